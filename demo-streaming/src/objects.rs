use crate::linker::DemoLinker;
use std::sync::Mutex;
use std::time::Duration;
use streamload::base::hashing::HashMap;
use streamload::base::{ObjectHandle, PackageName};
use streamload::loader::{DeserializeError, ObjectSystem, PackageHandle, PACKAGE_CLASS_NAME};

// Objects of this class can only finish loading on the thread that ticks the loader
const MAIN_THREAD_ONLY_CLASS: &str = "Texture";

#[derive(Debug)]
struct DemoObject {
    package: PackageName,
    object_name: String,
    class_name: String,
    export_index: Option<usize>,
    data: Vec<u8>,
    preloaded: bool,
    post_loaded: bool,
    loading: bool,
    invalid: bool,
}

#[derive(Default)]
struct DemoWorld {
    next_handle: u64,
    objects: HashMap<ObjectHandle, DemoObject>,
    by_path: HashMap<(PackageName, String), ObjectHandle>,
    packages: HashMap<PackageName, ObjectHandle>,
    loaded_packages: HashMap<PackageName, Duration>,
}

impl DemoWorld {
    fn find_or_create(
        &mut self,
        package: &PackageName,
        object_name: &str,
        class_name: &str,
        export_index: Option<usize>,
    ) -> ObjectHandle {
        let key = (package.clone(), object_name.to_string());
        if let Some(handle) = self.by_path.get(&key) {
            if !self.objects[handle].invalid {
                return *handle;
            }
        }

        self.next_handle += 1;
        let handle = ObjectHandle(self.next_handle);
        self.objects.insert(
            handle,
            DemoObject {
                package: package.clone(),
                object_name: object_name.to_string(),
                class_name: class_name.to_string(),
                export_index,
                data: Vec::new(),
                preloaded: false,
                post_loaded: false,
                loading: export_index.is_some(),
                invalid: false,
            },
        );
        self.by_path.insert(key, handle);
        handle
    }
}

/// A flat in-memory object world. Export data is read straight out of the package archive.
#[derive(Default)]
pub struct DemoObjects {
    world: Mutex<DemoWorld>,
}

impl DemoObjects {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn loaded_package_count(&self) -> usize {
        self.world.lock().unwrap().loaded_packages.len()
    }

    pub fn describe(
        &self,
        package: &PackageName,
    ) -> Vec<String> {
        let world = self.world.lock().unwrap();
        let mut lines: Vec<_> = world
            .objects
            .values()
            .filter(|object| &object.package == package && object.export_index.is_some())
            .map(|object| {
                let state = if object.invalid {
                    "invalid"
                } else if object.loading {
                    "loading"
                } else if object.post_loaded {
                    "ready"
                } else {
                    "created"
                };
                format!(
                    "{}.{} ({}, {} bytes, {})",
                    object.package,
                    object.object_name,
                    object.class_name,
                    object.data.len(),
                    state
                )
            })
            .collect();
        lines.sort();
        lines
    }
}

impl ObjectSystem for DemoObjects {
    fn is_package_loaded(
        &self,
        name: &PackageName,
    ) -> bool {
        self.world.lock().unwrap().loaded_packages.contains_key(name)
    }

    fn create_package(
        &self,
        name: &PackageName,
    ) -> ObjectHandle {
        let mut world = self.world.lock().unwrap();
        if let Some(handle) = world.packages.get(name) {
            return *handle;
        }
        let handle = world.find_or_create(name, name.as_str(), PACKAGE_CLASS_NAME, None);
        world.packages.insert(name.clone(), handle);
        handle
    }

    fn create_import(
        &self,
        handle: &mut dyn PackageHandle,
        import_index: usize,
    ) -> Option<ObjectHandle> {
        let imports = handle.imports();
        let import = imports.get(import_index)?;
        let outer = match import.outer {
            Some(outer) => imports.get(outer)?,
            None => {
                return Some(self.create_package(&PackageName::new(&import.object_name)));
            }
        };

        let world = self.world.lock().unwrap();
        let key = (PackageName::new(&outer.object_name), import.object_name.clone());
        let object = world.by_path.get(&key).copied();
        if object.is_none() {
            log::warn!(
                "Unresolved import {}.{}",
                outer.object_name,
                import.object_name
            );
        }
        object
    }

    fn create_export(
        &self,
        handle: &mut dyn PackageHandle,
        export_index: usize,
        _objects_loaded: &mut Vec<ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, DeserializeError> {
        let linker = handle
            .downcast_ref::<DemoLinker>()
            .ok_or_else(|| DeserializeError::new("not a demo package"))?;
        let export = linker
            .export(export_index)
            .ok_or_else(|| DeserializeError::new(format!("no export {}", export_index)))?;

        let mut world = self.world.lock().unwrap();
        Ok(Some(world.find_or_create(
            linker.name(),
            &export.object_name,
            &export.class_name,
            Some(export_index),
        )))
    }

    #[profiling::function]
    fn preload(
        &self,
        handle: &mut dyn PackageHandle,
        object: ObjectHandle,
        _objects_loaded: &mut Vec<ObjectHandle>,
    ) -> Result<(), DeserializeError> {
        let linker = handle
            .downcast_mut::<DemoLinker>()
            .ok_or_else(|| DeserializeError::new("not a demo package"))?;

        let export_index = {
            let world = self.world.lock().unwrap();
            match world.objects.get(&object) {
                Some(o) if !o.preloaded && &o.package == linker.name() => o.export_index,
                _ => None,
            }
        };
        let export = match export_index.and_then(|index| linker.export(index)) {
            Some(export) => export.clone(),
            None => return Ok(()),
        };

        let archive = linker
            .archive_mut()
            .ok_or_else(|| DeserializeError::new("package has no archive"))?;
        let in_range = export
            .serial_offset
            .checked_add(export.serial_size)
            .map_or(false, |end| end <= archive.total_size());
        if !in_range {
            return Err(DeserializeError::new(format!(
                "{} lies outside the package",
                export.object_name
            )));
        }
        let mut data = vec![0u8; export.serial_size as usize];
        archive.seek(export.serial_offset);
        archive.serialize(&mut data).map_err(|e| {
            DeserializeError::new(format!("reading {}: {}", export.object_name, e))
        })?;

        let mut world = self.world.lock().unwrap();
        if let Some(o) = world.objects.get_mut(&object) {
            o.data = data;
            o.preloaded = true;
        }
        Ok(())
    }

    fn post_load(
        &self,
        object: ObjectHandle,
        _objects_loaded: &mut Vec<ObjectHandle>,
    ) {
        let mut world = self.world.lock().unwrap();
        if let Some(o) = world.objects.get_mut(&object) {
            o.post_loaded = true;
            log::trace!(
                "PostLoad {}.{} on {:?}",
                o.package,
                o.object_name,
                std::thread::current().name()
            );
        }
    }

    fn is_main_thread_only(
        &self,
        object: ObjectHandle,
    ) -> bool {
        let world = self.world.lock().unwrap();
        world
            .objects
            .get(&object)
            .map_or(false, |o| o.class_name == MAIN_THREAD_ONLY_CLASS)
    }

    fn outermost_package(
        &self,
        object: ObjectHandle,
    ) -> Option<PackageName> {
        let world = self.world.lock().unwrap();
        world.objects.get(&object).map(|o| o.package.clone())
    }

    fn clear_loading_flags(
        &self,
        objects: &[ObjectHandle],
    ) {
        let mut world = self.world.lock().unwrap();
        for object in objects {
            if let Some(o) = world.objects.get_mut(object) {
                o.loading = false;
            }
        }
    }

    fn invalidate(
        &self,
        objects: &[ObjectHandle],
    ) {
        let mut world = self.world.lock().unwrap();
        for object in objects {
            if let Some(o) = world.objects.get_mut(object) {
                o.invalid = true;
                o.loading = false;
            }
        }
    }

    fn mark_package_loaded(
        &self,
        package_object: ObjectHandle,
        load_time: Duration,
    ) {
        let mut world = self.world.lock().unwrap();
        let package = match world.objects.get(&package_object) {
            Some(o) => o.package.clone(),
            None => return,
        };
        log::info!("Loaded {} in {:?}", package, load_time);
        world.loaded_packages.insert(package, load_time);
    }
}
