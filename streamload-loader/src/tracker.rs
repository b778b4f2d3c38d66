use crate::error::LoadResult;
use crate::package::PackageLoadState;
use crate::package_source::{DependencyIndex, ObjectSystem};
use crate::request::{CompletionCallback, LoadRequest};
use std::time::Instant;
use streamload_base::hashing::{HashMap, HashSet};
use streamload_base::{LoadPriority, ObjectHandle, PackageId, PackageName, RequestId};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PackagePhase {
    Active,
    PendingFinalize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum InsertMode {
    // Fresh packages queue up behind everything of the same priority
    AfterMatchingPriorities,
    // Boosted packages jump ahead of same-priority siblings
    BeforeMatchingPriorities,
}

/// A callback that became ready while the tracker was locked. Invoked by the scheduler after the
/// lock is released.
pub(crate) struct ReadyCallback {
    pub callback: CompletionCallback,
    pub name: PackageName,
    pub package_object: Option<ObjectHandle>,
    pub result: LoadResult,
}

impl ReadyCallback {
    pub fn invoke(self) {
        self.callback
            .invoke(&self.name, self.package_object, self.result)
    }
}

pub(crate) struct PackageRecord {
    pub name: PackageName,
    pub priority: LoadPriority,
    pub phase: PackagePhase,
    pub request_ids: Vec<RequestId>,
    pub callbacks: Vec<CompletionCallback>,
    // Importers that still need this package's handle or exports
    pub dependency_ref_count: i32,
    pub handle_ready: bool,
    pub finished: bool,
    // Claimed by the finalize pass, new importers treat it as loaded
    pub finalizing: bool,
    pub result: Option<LoadResult>,
    pub package_object: Option<ObjectHandle>,
    // Importers waiting for this package's handle
    pub blocked_dependents: Vec<PackageId>,
    // Dependencies whose handle isn't ready yet
    pub pending_imports: Vec<PackageId>,
    // Dependencies held only so their handles stay alive until our exports are created
    pub referenced_imports: Vec<PackageId>,
    pub load_percentage: f32,
    pub dependency_root: Option<PackageId>,
    pub load_start: Option<Instant>,
    // Taken out while the package is being ticked or finalized
    pub state: Option<Box<PackageLoadState>>,
}

struct Slot {
    generation: u32,
    record: Option<PackageRecord>,
}

/// Arena of in-flight packages plus the active (descending priority) and pending-finalize
/// (FIFO) lists. Packages refer to each other by [`PackageId`], never by ownership, so import
/// cycles are just cycles of ids.
#[derive(Default)]
pub(crate) struct DependencyTracker {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    by_name: HashMap<PackageName, PackageId>,
    active: Vec<PackageId>,
    pending_finalize: Vec<PackageId>,
    known_missing: HashSet<PackageName>,
    // Packages created and not yet removed after finalization
    async_loading_count: i32,
    // Packages in the active list
    active_count: i32,
}

impl DependencyTracker {
    pub fn get(
        &self,
        id: PackageId,
    ) -> Option<&PackageRecord> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.record.as_ref())
    }

    pub fn get_mut(
        &mut self,
        id: PackageId,
    ) -> Option<&mut PackageRecord> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.record.as_mut())
    }

    pub fn find(
        &self,
        name: &PackageName,
    ) -> Option<PackageId> {
        self.by_name.get(name).copied()
    }

    pub fn active(&self) -> &[PackageId] {
        &self.active
    }

    pub fn pending_finalize(&self) -> &[PackageId] {
        &self.pending_finalize
    }

    pub fn async_loading_count(&self) -> i32 {
        self.async_loading_count
    }

    pub fn is_idle(&self) -> bool {
        self.active_count == 0 && self.pending_finalize.is_empty()
    }

    pub fn is_known_missing(
        &self,
        name: &PackageName,
    ) -> bool {
        self.known_missing.contains(name)
    }

    pub fn mark_known_missing(
        &mut self,
        name: &PackageName,
    ) {
        self.known_missing.insert(name.clone());
    }

    pub fn active_packages(&self) -> Vec<(PackageName, LoadPriority)> {
        self.active
            .iter()
            .filter_map(|id| self.get(*id))
            .map(|record| (record.name.clone(), record.priority))
            .collect()
    }

    fn allocate_id(&mut self) -> PackageId {
        match self.free_slots.pop() {
            Some(index) => PackageId::new(index, self.slots[index as usize].generation),
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    record: None,
                });
                PackageId::new((self.slots.len() - 1) as u32, 0)
            }
        }
    }

    fn create(
        &mut self,
        request: LoadRequest,
        priority: LoadPriority,
        dependency_root: Option<PackageId>,
    ) -> PackageId {
        let id = self.allocate_id();
        let state = Box::new(PackageLoadState::new(id, &request));
        log::debug!(
            "Created package {} ({:?}) with priority {}",
            request.name,
            id,
            priority
        );

        self.by_name.insert(request.name.clone(), id);
        self.slots[id.index()].record = Some(PackageRecord {
            name: request.name,
            priority,
            phase: PackagePhase::Active,
            request_ids: request.request_id.into_iter().collect(),
            callbacks: request.callbacks,
            dependency_ref_count: 0,
            handle_ready: false,
            finished: false,
            finalizing: false,
            result: None,
            package_object: None,
            blocked_dependents: Vec::new(),
            pending_imports: Vec::new(),
            referenced_imports: Vec::new(),
            load_percentage: 0.0,
            dependency_root,
            load_start: None,
            state: Some(state),
        });
        self.async_loading_count += 1;
        id
    }

    fn insert_active(
        &mut self,
        id: PackageId,
        insert_mode: InsertMode,
    ) {
        let priority = match self.get(id) {
            Some(record) => record.priority,
            None => return,
        };

        let slots = &self.slots;
        let priority_of = |other: &PackageId| {
            slots[other.index()]
                .record
                .as_ref()
                .map_or(LoadPriority::MIN, |record| record.priority)
        };
        let insert_index = match insert_mode {
            InsertMode::AfterMatchingPriorities => {
                self.active.iter().position(|other| priority_of(other) < priority)
            }
            InsertMode::BeforeMatchingPriorities => {
                self.active.iter().position(|other| priority_of(other) <= priority)
            }
        }
        .unwrap_or(self.active.len());

        self.active.insert(insert_index, id);
        self.active_count += 1;
    }

    fn attach_request(
        &mut self,
        id: PackageId,
        request: LoadRequest,
        ready_callbacks: &mut Vec<ReadyCallback>,
    ) {
        if let Some(record) = self.get_mut(id) {
            record.request_ids.extend(request.request_id);
            for callback in request.callbacks {
                if callback.internal && record.finished {
                    // The objects are already finished, nothing would ever call this
                    ready_callbacks.push(ReadyCallback {
                        callback,
                        name: record.name.clone(),
                        package_object: record.package_object,
                        result: record.result.unwrap_or(LoadResult::Failed),
                    });
                } else {
                    record.callbacks.push(callback);
                }
            }
        }
    }

    /// Merges a queued request into the tracker: attaches it to an in-flight package of the same
    /// name, or creates one. With a dependency index, hard dependencies are created first so they
    /// sit ahead of the package in the active list.
    pub fn process_request(
        &mut self,
        request: LoadRequest,
        dependency_root: Option<PackageId>,
        visited: &mut HashSet<PackageName>,
        dependency_index: Option<&dyn DependencyIndex>,
        objects: &dyn ObjectSystem,
        ready_callbacks: &mut Vec<ReadyCallback>,
    ) {
        profiling::scope!("DependencyTracker::process_request");
        visited.insert(request.name.clone());

        if let Some(existing) = self.find(&request.name) {
            let priority = request.priority;
            log::trace!("Attaching request for {} to {:?}", request.name, existing);
            self.attach_request(existing, request, ready_callbacks);
            let mut boosted = HashSet::default();
            self.update_existing_priorities(existing, priority, &mut boosted, dependency_index);
            return;
        }

        let name = request.name.clone();
        let priority = request.priority;
        let id = self.create(request, priority, dependency_root);

        if let Some(dependency_index) = dependency_index {
            let root = dependency_root.or(Some(id));
            for dependency in dependency_index.hard_dependencies(&name) {
                if !visited.contains(&dependency) && !objects.is_package_loaded(&dependency) {
                    self.process_request(
                        LoadRequest::dependency(dependency, priority),
                        root,
                        visited,
                        Some(dependency_index),
                        objects,
                        ready_callbacks,
                    );
                }
            }
        }

        self.insert_active(id, InsertMode::AfterMatchingPriorities);
    }

    /// Raises the priority of a package and everything it depends on to at least `priority`.
    pub fn update_existing_priorities(
        &mut self,
        id: PackageId,
        priority: LoadPriority,
        visited: &mut HashSet<PackageId>,
        dependency_index: Option<&dyn DependencyIndex>,
    ) {
        if !visited.insert(id) {
            return;
        }

        let (name, boost, mut dependencies) = match self.get_mut(id) {
            Some(record) => {
                let boost = record.phase == PackagePhase::Active && priority > record.priority;
                if boost {
                    record.priority = priority;
                }
                let mut dependencies = record.pending_imports.clone();
                dependencies.extend_from_slice(&record.referenced_imports);
                (record.name.clone(), boost, dependencies)
            }
            None => return,
        };

        if boost {
            log::trace!("Boosting {} to priority {}", name, priority);
            self.active.retain(|other| *other != id);
            self.active_count -= 1;
            self.insert_active(id, InsertMode::BeforeMatchingPriorities);
        }

        if let Some(dependency_index) = dependency_index {
            dependencies.extend(
                dependency_index
                    .hard_dependencies(&name)
                    .iter()
                    .filter_map(|dependency| self.find(dependency)),
            );
        }

        for dependency in dependencies {
            self.update_existing_priorities(dependency, priority, visited, dependency_index);
        }
    }

    /// Records that `importer` can't create its imports until `name` has a handle, or at least
    /// must keep `name` alive until its exports are created.
    pub fn add_import_dependency(
        &mut self,
        importer: PackageId,
        name: &PackageName,
    ) {
        let (importer_priority, importer_root) = match self.get(importer) {
            Some(record) => (record.priority, record.dependency_root),
            None => return,
        };

        match self.find(name) {
            // A package importing itself is satisfied by its own handle
            Some(existing) if existing == importer => {}
            Some(existing) => {
                let already_linked = self.get(importer).map_or(true, |record| {
                    record.pending_imports.contains(&existing)
                        || record.referenced_imports.contains(&existing)
                });
                if already_linked {
                    return;
                }

                let handle_ready = match self.get_mut(existing) {
                    Some(record) if record.finalizing => return,
                    Some(record) => {
                        record.dependency_ref_count += 1;
                        record.handle_ready || record.finished
                    }
                    None => return,
                };

                if handle_ready {
                    if let Some(record) = self.get_mut(importer) {
                        record.referenced_imports.push(existing);
                    }
                    let mut searched = HashSet::default();
                    self.add_dependency_tree(importer, existing, &mut searched);
                } else {
                    self.add_pending_edge(importer, existing);
                }
            }
            None => {
                // Discovered through an import, inherit the importer's priority
                let request = LoadRequest::dependency(name.clone(), importer_priority);
                let root = importer_root.or(Some(importer));
                let id = self.create(request, importer_priority, root);
                self.insert_active(id, InsertMode::AfterMatchingPriorities);
                if let Some(record) = self.get_mut(id) {
                    record.dependency_ref_count += 1;
                }
                self.add_pending_edge(importer, id);
            }
        }
    }

    // importer waits on dependency's handle. The caller has taken the reference.
    fn add_pending_edge(
        &mut self,
        importer: PackageId,
        dependency: PackageId,
    ) {
        if let Some(record) = self.get_mut(dependency) {
            record.blocked_dependents.push(importer);
        }
        if let Some(record) = self.get_mut(importer) {
            record.pending_imports.push(dependency);
        }
    }

    // Adopts the not-yet-ready dependencies of an imported package, so creating our imports never
    // has to wait on a handle that isn't there yet
    fn add_dependency_tree(
        &mut self,
        importer: PackageId,
        imported: PackageId,
        searched: &mut HashSet<PackageId>,
    ) {
        if !searched.insert(imported) {
            return;
        }

        let pending = match self.get(imported) {
            Some(record) => record.pending_imports.clone(),
            None => return,
        };

        for dependency in pending {
            let already_pending = self
                .get(importer)
                .map_or(true, |record| record.pending_imports.contains(&dependency));
            if dependency == importer || already_pending {
                continue;
            }

            let ready = match self.get(dependency) {
                Some(record) => record.handle_ready || record.finished,
                None => continue,
            };

            if ready {
                self.add_dependency_tree(importer, dependency, searched);
            } else {
                log::trace!("Adding handle dependency {:?} to {:?}", dependency, importer);
                if let Some(record) = self.get_mut(dependency) {
                    record.dependency_ref_count += 1;
                }
                self.add_pending_edge(importer, dependency);
            }
        }
    }

    pub fn first_pending_import(
        &self,
        id: PackageId,
    ) -> Option<PackageId> {
        self.get(id)
            .and_then(|record| record.pending_imports.first().copied())
    }

    fn unblock_dependents(
        &mut self,
        id: PackageId,
    ) {
        let dependents = match self.get_mut(id) {
            Some(record) => std::mem::take(&mut record.blocked_dependents),
            None => return,
        };

        for dependent in dependents {
            if let Some(record) = self.get_mut(dependent) {
                if let Some(position) = record.pending_imports.iter().position(|x| *x == id) {
                    record.pending_imports.remove(position);
                    record.referenced_imports.push(id);
                }
            }
        }
    }

    pub fn on_handle_ready(
        &mut self,
        id: PackageId,
    ) {
        if let Some(record) = self.get_mut(id) {
            record.handle_ready = true;
        }
        self.unblock_dependents(id);
    }

    /// Called from FinishObjects. Returns the internal callbacks, which run right away.
    pub fn finish_package(
        &mut self,
        id: PackageId,
        package_object: Option<ObjectHandle>,
        result: LoadResult,
    ) -> Vec<ReadyCallback> {
        let ready = match self.get_mut(id) {
            Some(record) => {
                record.finished = true;
                record.result = Some(result);
                record.package_object = package_object;

                let (internal, external): (Vec<_>, Vec<_>) = std::mem::take(&mut record.callbacks)
                    .into_iter()
                    .partition(|callback| callback.internal);
                record.callbacks = external;
                let name = record.name.clone();
                internal
                    .into_iter()
                    .map(|callback| ReadyCallback {
                        callback,
                        name: name.clone(),
                        package_object,
                        result,
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        // A failed package will never get a handle, don't leave its importers waiting
        self.unblock_dependents(id);
        ready
    }

    /// Drops this package's references on everything it imports
    pub fn release_imports(
        &mut self,
        id: PackageId,
    ) {
        let released = match self.get_mut(id) {
            Some(record) => {
                let mut released = std::mem::take(&mut record.pending_imports);
                released.append(&mut record.referenced_imports);
                released
            }
            None => return,
        };

        for dependency in released {
            if let Some(record) = self.get_mut(dependency) {
                record.dependency_ref_count -= 1;
                record.blocked_dependents.retain(|dependent| *dependent != id);
                log::trace!(
                    "{:?} released {} ({})",
                    id,
                    record.name,
                    record.dependency_ref_count
                );
                assert!(
                    record.dependency_ref_count >= 0,
                    "Dependency ref count of {} went negative",
                    record.name
                );
            }
        }
    }

    pub fn note_load_started(
        &mut self,
        id: PackageId,
        now: Instant,
    ) {
        let root = match self.get_mut(id) {
            Some(record) if record.load_start.is_none() => {
                record.load_start = Some(now);
                record.dependency_root
            }
            _ => return,
        };

        // The root loads last, its load time should include its dependencies
        if let Some(root) = root {
            if let Some(record) = self.get_mut(root) {
                if record.load_start.is_none() {
                    record.load_start = Some(now);
                }
            }
        }
    }

    /// Moves a package that finished ticking to the back of the finalize list
    pub fn complete_active(
        &mut self,
        id: PackageId,
    ) {
        if let Some(position) = self.active.iter().position(|x| *x == id) {
            self.active.remove(position);
            self.active_count -= 1;
        }
        if let Some(record) = self.get_mut(id) {
            record.phase = PackagePhase::PendingFinalize;
        }
        self.pending_finalize.push(id);
    }

    pub fn take_state(
        &mut self,
        id: PackageId,
    ) -> Option<Box<PackageLoadState>> {
        self.get_mut(id).and_then(|record| record.state.take())
    }

    pub fn put_state(
        &mut self,
        id: PackageId,
        state: Box<PackageLoadState>,
    ) {
        if let Some(record) = self.get_mut(id) {
            record.state = Some(state);
        }
    }

    pub fn set_load_percentage(
        &mut self,
        id: PackageId,
        load_percentage: f32,
    ) {
        if let Some(record) = self.get_mut(id) {
            record.load_percentage = record.load_percentage.max(load_percentage);
        }
    }

    /// -1 if no package of this name is in flight
    pub fn load_percentage(
        &self,
        name: &PackageName,
    ) -> f32 {
        self.find(name)
            .and_then(|id| self.get(id))
            .map_or(-1.0, |record| record.load_percentage)
    }

    /// Destroys a finalized package
    pub fn remove(
        &mut self,
        id: PackageId,
    ) -> Option<PackageRecord> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(id.index() as u32);

        if self.by_name.get(&record.name) == Some(&id) {
            self.by_name.remove(&record.name);
        }
        self.pending_finalize.retain(|x| *x != id);
        if let Some(position) = self.active.iter().position(|x| *x == id) {
            self.active.remove(position);
            self.active_count -= 1;
        }

        self.async_loading_count -= 1;
        assert!(
            self.async_loading_count >= 0,
            "Async loading count is negative, more packages were loaded than requested"
        );
        Some(record)
    }

    /// Empties the tracker. Known-missing packages are remembered.
    pub fn drain_all(&mut self) -> Vec<PackageRecord> {
        let records: Vec<PackageRecord> = self
            .slots
            .drain(..)
            .filter_map(|slot| slot.record)
            .collect();
        self.free_slots.clear();
        self.by_name.clear();
        self.active.clear();
        self.pending_finalize.clear();
        self.async_loading_count = 0;
        self.active_count = 0;
        records
    }
}
