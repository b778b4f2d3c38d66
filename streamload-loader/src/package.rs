use crate::budget::TickBudget;
use crate::error::{LoadFailure, LoadResult, OpenPackageError};
use crate::keep_alive::KeepAliveSet;
use crate::package_source::{
    HandleStatus, ImportEntry, ObjectSystem, OpenPackageRequest, PackageHandle, PackageSource,
};
use crate::request::LoadRequest;
use std::path::PathBuf;
use std::time::Instant;
use streamload_base::{ObjectHandle, PackageGuid, PackageId, PackageName};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LoadStep {
    CreateHandle,
    FinishHandle,
    LoadImports,
    CreateImports,
    FinishTextureAllocations,
    CreateExports,
    PreLoadObjects,
    PostLoadObjects,
    FinishObjects,
    Done,
}

impl LoadStep {
    fn next(self) -> LoadStep {
        match self {
            LoadStep::CreateHandle => LoadStep::FinishHandle,
            LoadStep::FinishHandle => LoadStep::LoadImports,
            LoadStep::LoadImports => LoadStep::CreateImports,
            LoadStep::CreateImports => LoadStep::FinishTextureAllocations,
            LoadStep::FinishTextureAllocations => LoadStep::CreateExports,
            LoadStep::CreateExports => LoadStep::PreLoadObjects,
            LoadStep::PreLoadObjects => LoadStep::PostLoadObjects,
            LoadStep::PostLoadObjects => LoadStep::FinishObjects,
            LoadStep::FinishObjects | LoadStep::Done => LoadStep::Done,
        }
    }
}

// What a single step reports back to the driver loop
#[derive(Debug, PartialEq)]
enum StepOutcome {
    Complete,
    TimedOut,
    Failed(LoadFailure),
    PendingOn(PackageId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TickResult {
    Complete,
    TimedOut,
    PendingDependency,
}

/// Everything a package needs from the scheduler while it ticks. Calls into the tracker take the
/// scheduler's locks for the duration of the call only.
pub(crate) trait PackageLoadContext {
    fn source(&self) -> &dyn PackageSource;

    fn objects(&self) -> &dyn ObjectSystem;

    fn keep_alive(&self) -> &KeepAliveSet;

    fn is_multithreaded(&self) -> bool;

    // Suspended or canceling, work stops at the next check
    fn should_yield(&self) -> bool;

    fn is_known_missing(
        &self,
        name: &PackageName,
    ) -> bool;

    fn mark_known_missing(
        &self,
        name: &PackageName,
    );

    fn add_import_dependency(
        &self,
        importer: PackageId,
        name: &PackageName,
    );

    // A dependency of this package whose handle isn't ready yet
    fn first_pending_import(
        &self,
        id: PackageId,
    ) -> Option<PackageId>;

    fn handle_ready(
        &self,
        id: PackageId,
    );

    fn release_imports(
        &self,
        id: PackageId,
    );

    fn report_load_percentage(
        &self,
        id: PackageId,
        load_percentage: f32,
    );

    fn finish(
        &self,
        id: PackageId,
        package_object: Option<ObjectHandle>,
        result: LoadResult,
    );
}

fn keep(
    ctx: &dyn PackageLoadContext,
    kept_alive: &mut Vec<ObjectHandle>,
    object: ObjectHandle,
) {
    ctx.keep_alive().add(object);
    kept_alive.push(object);
}

fn record_failure(
    failure: &mut Option<LoadFailure>,
    new_failure: LoadFailure,
) {
    log::error!("{}", new_failure);
    if failure.is_none() {
        *failure = Some(new_failure);
    }
}

// Follows outer links up to the import that names a whole package
fn outermost_import(
    imports: &[ImportEntry],
    index: usize,
) -> Result<&ImportEntry, String> {
    let mut import = &imports[index];
    let mut hops = 0;
    while let Some(outer) = import.outer {
        hops += 1;
        import = match imports.get(outer) {
            Some(outer_import) if hops <= imports.len() => outer_import,
            _ => return Err(format!("import {} has an invalid outer chain", index)),
        };
    }
    Ok(import)
}

/// Incremental load of one package. Owned by the scheduler's tracker, ticked on the loading
/// context until it reaches [`LoadStep::Done`], then finalized on the main context.
pub(crate) struct PackageLoadState {
    id: PackageId,
    name: PackageName,
    load_from: Option<PathBuf>,
    guid: Option<PackageGuid>,
    step: LoadStep,
    handle: Option<Box<dyn PackageHandle>>,
    package_object: Option<ObjectHandle>,
    load_import_index: usize,
    import_index: usize,
    export_index: usize,
    preload_index: usize,
    postload_index: usize,
    // Objects loaded on behalf of this package, preloaded and postloaded in order
    objects_loaded: Vec<ObjectHandle>,
    deferred_post_load: Vec<ObjectHandle>,
    deferred_post_load_index: usize,
    deferred_finalize: Vec<ObjectHandle>,
    kept_alive: Vec<ObjectHandle>,
    failure: Option<LoadFailure>,
    load_percentage: f32,
}

impl PackageLoadState {
    pub fn new(
        id: PackageId,
        request: &LoadRequest,
    ) -> Self {
        PackageLoadState {
            id,
            name: request.name.clone(),
            load_from: request.load_from.clone(),
            guid: request.guid,
            step: LoadStep::CreateHandle,
            handle: None,
            package_object: None,
            load_import_index: 0,
            import_index: 0,
            export_index: 0,
            preload_index: 0,
            postload_index: 0,
            objects_loaded: Vec::new(),
            deferred_post_load: Vec::new(),
            deferred_post_load_index: 0,
            deferred_finalize: Vec::new(),
            kept_alive: Vec::new(),
            failure: None,
            load_percentage: 0.0,
        }
    }

    #[cfg(test)]
    pub fn step(&self) -> LoadStep {
        self.step
    }

    // Objects this package holds in the keep-alive set
    pub fn kept_alive(&self) -> &[ObjectHandle] {
        &self.kept_alive
    }

    fn time_exceeded(
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
    ) -> bool {
        ctx.should_yield() || budget.is_time_limit_exceeded()
    }

    fn missing_handle(&self) -> StepOutcome {
        StepOutcome::Failed(LoadFailure::HandleCreationFailed {
            package: self.name.clone(),
            reason: "package has no handle".to_string(),
        })
    }

    /// Runs steps until the package is done, a step runs out of time, or the package has to
    /// wait for a dependency's handle.
    pub fn tick(
        &mut self,
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
    ) -> TickResult {
        profiling::scope!("PackageLoadState::tick");
        assert!(
            self.step != LoadStep::Done,
            "Ticked package {} after it finished",
            self.name
        );

        let result = loop {
            match self.run_step(budget, ctx) {
                StepOutcome::Complete => {
                    if self.step == LoadStep::FinishObjects {
                        self.step = LoadStep::Done;
                        break TickResult::Complete;
                    }
                    self.step = self.step.next();
                    if Self::time_exceeded(budget, ctx) {
                        break TickResult::TimedOut;
                    }
                }
                StepOutcome::Failed(failure) => {
                    record_failure(&mut self.failure, failure);
                    // Unwind through FinishObjects so callbacks fire and bookkeeping stays consistent
                    self.step = LoadStep::FinishObjects;
                }
                StepOutcome::TimedOut => {
                    if Self::time_exceeded(budget, ctx) {
                        break TickResult::TimedOut;
                    }
                    std::thread::yield_now();
                }
                StepOutcome::PendingOn(dependency) => {
                    log::trace!("{} is waiting on {:?}", self.name, dependency);
                    break TickResult::PendingDependency;
                }
            }
        };

        self.update_load_percentage(ctx);
        result
    }

    fn run_step(
        &mut self,
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
    ) -> StepOutcome {
        match self.step {
            LoadStep::CreateHandle => self.create_handle(budget, ctx),
            LoadStep::FinishHandle => self.finish_handle(budget, ctx),
            LoadStep::LoadImports => self.load_imports(budget, ctx),
            LoadStep::CreateImports => self.create_imports(budget, ctx),
            LoadStep::FinishTextureAllocations => self.finish_texture_allocations(budget),
            LoadStep::CreateExports => self.create_exports(budget, ctx),
            LoadStep::PreLoadObjects => self.preload_objects(budget, ctx),
            LoadStep::PostLoadObjects => self.post_load_objects(budget, ctx),
            LoadStep::FinishObjects => self.finish_objects(budget, ctx),
            LoadStep::Done => StepOutcome::Complete,
        }
    }

    #[profiling::function]
    fn create_handle(
        &mut self,
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
    ) -> StepOutcome {
        if self.handle.is_some() {
            return StepOutcome::Complete;
        }
        budget.set_last_work("creating handle", &self.name);

        if self.package_object.is_none() {
            let package_object = ctx.objects().create_package(&self.name);
            keep(ctx, &mut self.kept_alive, package_object);
            self.package_object = Some(package_object);
        }

        let request = OpenPackageRequest {
            name: &self.name,
            load_from: self.load_from.as_deref(),
            guid: self.guid,
        };

        match ctx.source().open_package(&request) {
            Ok(handle) => {
                log::debug!("Created handle for {}", self.name);
                self.handle = Some(handle);
                StepOutcome::Complete
            }
            Err(OpenPackageError::FileNotFound) => {
                ctx.mark_known_missing(&self.name);
                StepOutcome::Failed(LoadFailure::FileNotFound(self.name.clone()))
            }
            Err(OpenPackageError::HandleCreationFailed(reason)) => {
                StepOutcome::Failed(LoadFailure::HandleCreationFailed {
                    package: self.name.clone(),
                    reason,
                })
            }
        }
    }

    #[profiling::function]
    fn finish_handle(
        &mut self,
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
    ) -> StepOutcome {
        budget.set_last_work("ticking handle", &self.name);
        let remaining = budget.remaining();
        let handle = match self.handle.as_deref_mut() {
            Some(handle) => handle,
            None => return self.missing_handle(),
        };

        match handle.tick(remaining) {
            HandleStatus::Loaded => {
                ctx.handle_ready(self.id);
                StepOutcome::Complete
            }
            HandleStatus::InProgress => {
                budget.give_up_time_slice();
                StepOutcome::TimedOut
            }
            HandleStatus::Failed => StepOutcome::Failed(LoadFailure::HandleCreationFailed {
                package: self.name.clone(),
                reason: "handle failed to finish initialization".to_string(),
            }),
        }
    }

    #[profiling::function]
    fn load_imports(
        &mut self,
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
    ) -> StepOutcome {
        budget.set_last_work("loading imports", &self.name);
        let handle = match self.handle.as_deref() {
            Some(handle) => handle,
            None => return self.missing_handle(),
        };
        let imports = handle.imports();

        while self.load_import_index < imports.len() && !Self::time_exceeded(budget, ctx) {
            let index = self.load_import_index;
            self.load_import_index += 1;

            let import = match outermost_import(imports, index) {
                Ok(import) => import,
                Err(reason) => {
                    return StepOutcome::Failed(LoadFailure::HandleCreationFailed {
                        package: self.name.clone(),
                        reason,
                    })
                }
            };

            if !import.is_package() {
                continue;
            }

            let import_name = PackageName::new(&import.object_name);
            if ctx.is_known_missing(&import_name) || ctx.objects().is_package_loaded(&import_name)
            {
                continue;
            }

            if import_name.is_short() {
                // Usually a reference to a package of another project
                log::warn!(
                    "Short package name in import table of {}: {}",
                    self.name,
                    import_name
                );
                continue;
            }

            log::trace!("{} imports {}", self.name, import_name);
            ctx.add_import_dependency(self.id, &import_name);
        }

        if let Some(dependency) = ctx.first_pending_import(self.id) {
            budget.give_up_time_slice();
            return StepOutcome::PendingOn(dependency);
        }

        if self.load_import_index == imports.len() {
            StepOutcome::Complete
        } else {
            StepOutcome::TimedOut
        }
    }

    #[profiling::function]
    fn create_imports(
        &mut self,
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
    ) -> StepOutcome {
        let handle = match self.handle.as_deref_mut() {
            Some(handle) => handle,
            None => return self.missing_handle(),
        };
        let import_count = handle.imports().len();

        while self.import_index < import_count && !Self::time_exceeded(budget, ctx) {
            let index = self.import_index;
            self.import_index += 1;
            budget.set_last_work("creating imports for", &self.name);
            if let Some(object) = ctx.objects().create_import(handle, index) {
                keep(ctx, &mut self.kept_alive, object);
            }
        }

        if self.import_index == import_count {
            StepOutcome::Complete
        } else {
            StepOutcome::TimedOut
        }
    }

    fn finish_texture_allocations(
        &mut self,
        budget: &mut TickBudget,
    ) -> StepOutcome {
        let handle = match self.handle.as_deref_mut() {
            Some(handle) => handle,
            None => return self.missing_handle(),
        };

        if !handle.has_pending_resource_allocations() {
            return StepOutcome::Complete;
        }

        if budget.use_time_limit() && !budget.use_full_time_limit() {
            // Try again next tick
            budget.give_up_time_slice();
            StepOutcome::TimedOut
        } else {
            // Whatever is left gets allocated during deserialization instead
            handle.cancel_resource_allocations();
            StepOutcome::Complete
        }
    }

    #[profiling::function]
    fn create_exports(
        &mut self,
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
    ) -> StepOutcome {
        let handle = match self.handle.as_deref_mut() {
            Some(handle) => handle,
            None => return self.missing_handle(),
        };
        let export_count = handle.exports().len();

        while self.export_index < export_count && !Self::time_exceeded(budget, ctx) {
            let (serial_offset, serial_size) = {
                let export = &handle.exports()[self.export_index];
                (export.serial_offset, export.serial_size)
            };

            if handle.precache(serial_offset, serial_size) {
                let export_index = self.export_index;
                self.export_index += 1;
                budget.set_last_work("creating exports for", &self.name);

                match ctx
                    .objects()
                    .create_export(handle, export_index, &mut self.objects_loaded)
                {
                    Ok(Some(object)) => {
                        self.objects_loaded.push(object);
                        keep(ctx, &mut self.kept_alive, object);
                        // Serializing here rather than in PreLoadObjects keeps reads sequential
                        if let Err(e) = ctx
                            .objects()
                            .preload(handle, object, &mut self.objects_loaded)
                        {
                            record_failure(
                                &mut self.failure,
                                LoadFailure::DeserializeFailed {
                                    package: self.name.clone(),
                                    export_index,
                                    reason: e.0,
                                },
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => record_failure(
                        &mut self.failure,
                        LoadFailure::DeserializeFailed {
                            package: self.name.clone(),
                            export_index,
                            reason: e.0,
                        },
                    ),
                }
            } else if budget.give_up_time_slice() {
                return StepOutcome::TimedOut;
            } else {
                // No time slice to give up, wait for the read
                std::thread::yield_now();
            }
        }

        if self.export_index == export_count {
            // Imported packages were only referenced so their handles stay alive until now
            ctx.release_imports(self.id);
            StepOutcome::Complete
        } else {
            StepOutcome::TimedOut
        }
    }

    #[profiling::function]
    fn preload_objects(
        &mut self,
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
    ) -> StepOutcome {
        while self.preload_index < self.objects_loaded.len() && !Self::time_exceeded(budget, ctx) {
            let object = self.objects_loaded[self.preload_index];
            self.preload_index += 1;
            budget.set_last_work("preloading", &self.name);

            let handle = match self.handle.as_deref_mut() {
                Some(handle) => handle,
                None => return self.missing_handle(),
            };
            if let Err(e) = ctx
                .objects()
                .preload(handle, object, &mut self.objects_loaded)
            {
                record_failure(
                    &mut self.failure,
                    LoadFailure::PreloadFailed {
                        package: self.name.clone(),
                        object,
                        reason: e.0,
                    },
                );
            }
        }

        if self.preload_index == self.objects_loaded.len() {
            StepOutcome::Complete
        } else {
            StepOutcome::TimedOut
        }
    }

    #[profiling::function]
    fn post_load_objects(
        &mut self,
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
    ) -> StepOutcome {
        while self.postload_index < self.objects_loaded.len()
            && self.postload_index < self.preload_index
            && !Self::time_exceeded(budget, ctx)
        {
            let object = self.objects_loaded[self.postload_index];
            self.postload_index += 1;

            if !ctx.is_multithreaded() || !ctx.objects().is_main_thread_only(object) {
                budget.set_last_work("postloading_async", &self.name);
                ctx.objects().post_load(object, &mut self.objects_loaded);
            } else {
                self.deferred_post_load.push(object);
            }

            // Everything is finalized on the main context
            self.deferred_finalize.push(object);
            keep(ctx, &mut self.kept_alive, object);
        }

        let loaded_count = self.objects_loaded.len();
        if self.preload_index == loaded_count && self.postload_index == loaded_count {
            StepOutcome::Complete
        } else {
            if self.postload_index == self.preload_index {
                // PostLoad loaded more objects, they need to be preloaded first
                self.step = LoadStep::PreLoadObjects;
            }
            StepOutcome::TimedOut
        }
    }

    #[profiling::function]
    fn finish_objects(
        &mut self,
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
    ) -> StepOutcome {
        budget.set_last_work("finishing all objects", &self.name);

        let result = if self.failure.is_none() {
            self.objects_loaded.clear();
            LoadResult::Succeeded
        } else {
            // Only objects of this package are cleaned up, anything else is left to its owner
            let objects_loaded = std::mem::take(&mut self.objects_loaded);
            let ours: Vec<ObjectHandle> = objects_loaded
                .into_iter()
                .filter(|object| {
                    ctx.objects().outermost_package(*object).as_ref() == Some(&self.name)
                })
                .collect();
            if !ours.is_empty() {
                ctx.objects().invalidate(&ours);
                self.deferred_post_load
                    .retain(|object| !ours.contains(object));
                self.deferred_post_load_index =
                    self.deferred_post_load_index.min(self.deferred_post_load.len());
            }
            LoadResult::Failed
        };

        // A no-op unless the load failed before its exports were created
        ctx.release_imports(self.id);

        self.preload_index = 0;
        self.postload_index = 0;

        if result == LoadResult::Succeeded {
            if let Some(handle) = self.handle.as_deref_mut() {
                handle.cancel_resource_allocations();
            }
        }

        let package_object = match result {
            LoadResult::Succeeded => self.package_object,
            _ => None,
        };
        ctx.finish(self.id, package_object, result);
        StepOutcome::Complete
    }

    /// Main-context half of PostLoad, for objects that can't be post-loaded on the loading
    /// context. Runs under its own budget.
    #[profiling::function]
    pub fn post_load_deferred(
        &mut self,
        budget: &mut TickBudget,
        ctx: &dyn PackageLoadContext,
        load_start: Option<Instant>,
    ) -> TickResult {
        budget.set_last_work("postloading_gamethread", &self.name);

        while self.deferred_post_load_index < self.deferred_post_load.len()
            && !ctx.should_yield()
            && !budget.is_time_limit_exceeded()
        {
            let object = self.deferred_post_load[self.deferred_post_load_index];
            self.deferred_post_load_index += 1;

            let mut loaded_in_post_load = Vec::new();
            ctx.objects().post_load(object, &mut loaded_in_post_load);

            if !loaded_in_post_load.is_empty() {
                log::warn!(
                    "Detected {} objects loaded in PostLoad while streaming {}, this may cause hitches as they are preloaded immediately",
                    loaded_in_post_load.len(),
                    self.name
                );

                // There's no going back to the loading context from here
                while !loaded_in_post_load.is_empty() {
                    self.deferred_post_load
                        .extend_from_slice(&loaded_in_post_load);
                    let mut loaded_in_preload = Vec::new();
                    if let Some(handle) = self.handle.as_deref_mut() {
                        for preload_object in loaded_in_post_load {
                            if let Err(e) =
                                ctx.objects()
                                    .preload(handle, preload_object, &mut loaded_in_preload)
                            {
                                record_failure(
                                    &mut self.failure,
                                    LoadFailure::PreloadFailed {
                                        package: self.name.clone(),
                                        object: preload_object,
                                        reason: e.0,
                                    },
                                );
                            }
                        }
                    }
                    loaded_in_post_load = loaded_in_preload;
                }
            }
            self.update_load_percentage(ctx);
        }

        if self.deferred_post_load_index < self.deferred_post_load.len() {
            return TickResult::TimedOut;
        }

        ctx.objects().clear_loading_flags(&self.deferred_finalize);
        if self.failure.is_none() {
            if let Some(package_object) = self.package_object {
                ctx.objects().clear_loading_flags(&[package_object]);
                let load_time = load_start.map(|start| start.elapsed()).unwrap_or_default();
                ctx.objects().mark_package_loaded(package_object, load_time);
            }
        }
        TickResult::Complete
    }

    /// Abandons the load. Objects this package created are poisoned, never handed to another step.
    pub fn cancel(
        &mut self,
        objects: &dyn ObjectSystem,
    ) {
        let mut poisoned = std::mem::take(&mut self.objects_loaded);
        poisoned.extend(self.deferred_post_load.drain(..));
        poisoned.extend(self.package_object);
        if !poisoned.is_empty() {
            objects.invalidate(&poisoned);
        }

        if let Some(mut handle) = self.handle.take() {
            handle.flush_cache();
        }

        self.deferred_finalize.clear();
        self.preload_index = 0;
        self.postload_index = 0;
        self.step = LoadStep::Done;
    }

    fn update_load_percentage(
        &mut self,
        ctx: &dyn PackageLoadContext,
    ) {
        // PostLoad count is an estimate that keeps packages from sitting at 100% for most of
        // their load time
        let new_load_percentage = match self.handle.as_deref() {
            Some(handle) => {
                let import_count = handle.imports().len();
                let export_count = handle.exports().len();
                let post_load_count = self.deferred_post_load.len().max(import_count);
                let total = export_count + import_count + post_load_count;
                if total == 0 {
                    0.0
                } else {
                    let done = self.load_import_index
                        + self.export_index
                        + self.deferred_post_load_index;
                    100.0 * done as f32 / total as f32
                }
            }
            None if !self.deferred_post_load.is_empty() => {
                100.0 * self.deferred_post_load_index as f32 / self.deferred_post_load.len() as f32
            }
            None => 0.0,
        };

        let new_load_percentage = new_load_percentage.min(100.0);
        if new_load_percentage > self.load_percentage {
            self.load_percentage = new_load_percentage;
            ctx.report_load_percentage(self.id, new_load_percentage);
        }
    }
}
