use crate::package_source::ObjectSystem;
use std::sync::Mutex;
use streamload_base::hashing::HashMap;
use streamload_base::ObjectHandle;

/// Objects created by in-flight loads that must not be collected until their package finishes.
/// Entries are counted, the same object can be held by several packages at once (an import
/// shared between two loads, for example).
#[derive(Default)]
pub struct KeepAliveSet {
    objects: Mutex<HashMap<ObjectHandle, u32>>,
}

impl KeepAliveSet {
    pub fn add(
        &self,
        object: ObjectHandle,
    ) {
        *self.objects.lock().unwrap().entry(object).or_insert(0) += 1;
    }

    /// Drops one reference for each of the given objects
    pub fn release(
        &self,
        objects: &[ObjectHandle],
    ) {
        let mut guard = self.objects.lock().unwrap();
        for object in objects {
            if let Some(count) = guard.get_mut(object) {
                *count -= 1;
                if *count == 0 {
                    guard.remove(object);
                }
            }
        }
    }

    /// Empties the set, clearing loading flags on everything that was held
    pub fn release_all(
        &self,
        object_system: &dyn ObjectSystem,
    ) {
        let released = self.drain();
        if !released.is_empty() {
            log::trace!("Released {} kept alive objects", released.len());
            object_system.clear_loading_flags(&released);
        }
    }

    /// Empties the set, invalidating everything that was held
    pub fn cancel_all(
        &self,
        object_system: &dyn ObjectSystem,
    ) {
        let canceled = self.drain();
        if !canceled.is_empty() {
            log::debug!("Invalidated {} kept alive objects", canceled.len());
            object_system.invalidate(&canceled);
        }
    }

    // Collect outside of the object system calls so they never run under our lock
    fn drain(&self) -> Vec<ObjectHandle> {
        self.objects
            .lock()
            .unwrap()
            .drain()
            .map(|(object, _)| object)
            .collect()
    }

    pub fn contains(
        &self,
        object: ObjectHandle,
    ) -> bool {
        self.objects.lock().unwrap().contains_key(&object)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
