use crate::budget::TickBudget;
use crate::config::LoaderConfig;
use crate::error::LoadResult;
use crate::keep_alive::KeepAliveSet;
use crate::loading_thread::Event;
use crate::package::{PackageLoadContext, TickResult};
use crate::package_source::{DependencyIndex, ObjectSystem, PackageSource};
use crate::request::{LoadRequest, PackageRequest};
use crate::tracker::{DependencyTracker, ReadyCallback};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use streamload_base::hashing::HashSet;
use streamload_base::{LoadPriority, ObjectHandle, PackageId, PackageName, RequestId};

const FLUSH_SLEEP: Duration = Duration::from_micros(100);

// State shared by the thread that ticks the loader and the loading thread.
//
// Lock order is queue, then tracker. The finalize lock is taken before either and serializes
// finalization against cancel. No lock is held while a package ticks or a callback runs.
pub(crate) struct SchedulerShared {
    pub config: LoaderConfig,
    source: Arc<dyn PackageSource>,
    objects: Arc<dyn ObjectSystem>,
    dependency_index: Option<Arc<dyn DependencyIndex>>,
    pub keep_alive: KeepAliveSet,
    queue: Mutex<Vec<LoadRequest>>,
    pub tracker: Mutex<DependencyTracker>,
    pending_requests: Mutex<HashSet<RequestId>>,
    next_request_id: AtomicU32,
    queued_count: AtomicI32,
    suspend_count: AtomicI32,
    should_cancel: AtomicBool,
    finalize_lock: Mutex<()>,
    pub queued_requests_event: Event,
    pub suspended_event: Event,
    pub resumed_event: Event,
    cancel_done_event: Event,
}

impl SchedulerShared {
    pub fn new(
        config: LoaderConfig,
        source: Arc<dyn PackageSource>,
        objects: Arc<dyn ObjectSystem>,
        dependency_index: Option<Arc<dyn DependencyIndex>>,
    ) -> Self {
        SchedulerShared {
            config,
            source,
            objects,
            dependency_index,
            keep_alive: KeepAliveSet::default(),
            queue: Default::default(),
            tracker: Default::default(),
            pending_requests: Default::default(),
            next_request_id: AtomicU32::new(1),
            queued_count: AtomicI32::new(0),
            suspend_count: AtomicI32::new(0),
            should_cancel: AtomicBool::new(false),
            finalize_lock: Mutex::new(()),
            queued_requests_event: Event::default(),
            suspended_event: Event::default(),
            resumed_event: Event::default(),
            cancel_done_event: Event::default(),
        }
    }

    //
    // Requests
    //
    pub fn enqueue(
        &self,
        request: PackageRequest,
    ) -> RequestId {
        let request_id = RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        log::debug!(
            "Queued {} with priority {} as request {}",
            request.name,
            request.priority,
            request_id
        );

        // Pending before the id is handed out, so flushing it right away waits
        self.pending_requests.lock().unwrap().insert(request_id);
        self.queued_count.fetch_add(1, Ordering::AcqRel);
        self.queue
            .lock()
            .unwrap()
            .push(LoadRequest::from_package_request(request, request_id));
        self.queued_requests_event.signal();
        request_id
    }

    pub fn is_request_pending(
        &self,
        request_id: RequestId,
    ) -> bool {
        self.pending_requests.lock().unwrap().contains(&request_id)
    }

    pub fn queued_count(&self) -> i32 {
        self.queued_count.load(Ordering::Acquire)
    }

    pub fn is_loading(&self) -> bool {
        self.queued_count() > 0 || self.tracker.lock().unwrap().async_loading_count() > 0
    }

    // Work for the loading context, as opposed to finalization
    pub fn has_async_work(&self) -> bool {
        self.queued_count() > 0 || !self.tracker.lock().unwrap().active().is_empty()
    }

    pub fn load_percentage(
        &self,
        name: &PackageName,
    ) -> f32 {
        self.tracker.lock().unwrap().load_percentage(name)
    }

    pub fn active_packages(&self) -> Vec<(PackageName, LoadPriority)> {
        self.tracker.lock().unwrap().active_packages()
    }

    pub fn pending_finalize_count(&self) -> usize {
        self.tracker.lock().unwrap().pending_finalize().len()
    }

    //
    // Suspend/cancel
    //
    pub fn is_suspended(&self) -> bool {
        self.suspend_count.load(Ordering::Acquire) > 0
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.should_cancel.load(Ordering::Acquire)
    }

    pub fn should_yield(&self) -> bool {
        self.is_suspended() || self.is_cancel_requested()
    }

    /// Returns true if this call took the count from zero to one. The caller waits for the
    /// loading thread's acknowledgement in that case.
    pub fn suspend(&self) -> bool {
        let previous = self.suspend_count.fetch_add(1, Ordering::AcqRel);
        // Wake the loading thread if it is idle so it notices
        self.queued_requests_event.signal();
        previous == 0
    }

    /// Returns true if this call took the count back to zero
    pub fn resume(&self) -> bool {
        let previous = self.suspend_count.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            self.suspend_count.fetch_add(1, Ordering::AcqRel);
            panic!("Async loading was resumed more often than it was suspended");
        }
        previous == 1
    }

    pub fn request_cancel(&self) {
        self.should_cancel.store(true, Ordering::Release);
        self.queued_requests_event.signal();
    }

    pub fn wait_for_cancel(&self) {
        self.cancel_done_event.wait();
    }

    /// Throws away everything in flight. Every callback fires with [`LoadResult::Canceled`],
    /// every object the loader still holds is invalidated.
    #[profiling::function]
    pub fn cancel_internal(&self) {
        let finalize_guard = self.finalize_lock.lock().unwrap();
        let queued = std::mem::take(&mut *self.queue.lock().unwrap());
        self.queued_count
            .fetch_sub(queued.len() as i32, Ordering::AcqRel);
        let records = self.tracker.lock().unwrap().drain_all();

        log::info!(
            "Canceling async loading of {} packages and {} queued requests",
            records.len(),
            queued.len()
        );

        let mut canceled_ids = Vec::new();
        let mut callbacks = Vec::new();
        for mut record in records {
            if let Some(mut state) = record.state.take() {
                state.cancel(&*self.objects);
            }
            canceled_ids.append(&mut record.request_ids);
            let name = record.name;
            callbacks.extend(record.callbacks.into_iter().map(|callback| (callback, name.clone())));
        }
        for request in queued {
            canceled_ids.extend(request.request_id);
            let name = request.name;
            callbacks.extend(request.callbacks.into_iter().map(|callback| (callback, name.clone())));
        }

        self.keep_alive.cancel_all(&*self.objects);
        {
            let mut pending_requests = self.pending_requests.lock().unwrap();
            for request_id in &canceled_ids {
                pending_requests.remove(request_id);
            }
        }

        self.should_cancel.store(false, Ordering::Release);
        drop(finalize_guard);

        for (callback, name) in callbacks {
            callback.invoke(&name, None, LoadResult::Canceled);
        }

        if self.config.multithreaded {
            self.cancel_done_event.signal();
        }
    }

    //
    // Loading context
    //
    fn create_packages_from_queue(&self) -> usize {
        profiling::scope!("create_packages_from_queue");
        let requests = std::mem::take(&mut *self.queue.lock().unwrap());
        if requests.is_empty() {
            return 0;
        }

        let request_count = requests.len();
        let dependency_index = if self.config.preload_dependencies {
            self.dependency_index.as_deref()
        } else {
            None
        };

        let mut ready_callbacks = Vec::new();
        {
            let mut tracker = self.tracker.lock().unwrap();
            for request in requests {
                let mut visited = HashSet::default();
                tracker.process_request(
                    request,
                    None,
                    &mut visited,
                    dependency_index,
                    &*self.objects,
                    &mut ready_callbacks,
                );
                // Only once the package is in the tracker, so is_loading never sees a gap
                self.queued_count.fetch_sub(1, Ordering::AcqRel);
            }
        }

        for ready_callback in ready_callbacks {
            ready_callback.invoke();
        }
        request_count
    }

    /// One pass over the active list, highest priority first
    #[profiling::function]
    fn process_async_loading(
        &self,
        budget: &mut TickBudget,
    ) -> TickResult {
        self.create_packages_from_queue();

        let ctx = SchedulerContext { shared: self };
        let mut position = 0;
        loop {
            if self.should_yield() {
                return TickResult::TimedOut;
            }

            let (id, mut state) = {
                let mut tracker = self.tracker.lock().unwrap();
                let id = match tracker.active().get(position) {
                    Some(id) => *id,
                    None => break,
                };
                match tracker.take_state(id) {
                    Some(state) => {
                        tracker.note_load_started(id, Instant::now());
                        (id, state)
                    }
                    None => {
                        position += 1;
                        continue;
                    }
                }
            };

            budget.begin_package();
            let result = state.tick(budget, &ctx);

            {
                let mut tracker = self.tracker.lock().unwrap();
                tracker.put_state(id, state);
                let current_position = tracker.active().iter().position(|x| *x == id);
                match result {
                    TickResult::Complete => {
                        log::debug!("Package {:?} finished loading, waiting to be finalized", id);
                        tracker.complete_active(id);
                        // Whatever followed it moved up into its slot
                        position = current_position.unwrap_or(position);
                    }
                    _ => position = current_position.map_or(position, |x| x + 1),
                }
            }

            if result == TickResult::TimedOut {
                return TickResult::TimedOut;
            }

            // Dependencies discovered by that tick get a chance to start right away
            self.create_packages_from_queue();
        }

        if self.tracker.lock().unwrap().active().is_empty() {
            TickResult::Complete
        } else {
            TickResult::PendingDependency
        }
    }

    pub fn tick_async_thread(
        &self,
        budget: &mut TickBudget,
    ) -> TickResult {
        if self.is_cancel_requested() {
            self.cancel_internal();
            return TickResult::Complete;
        }

        if self.is_suspended() {
            return TickResult::TimedOut;
        }

        self.process_async_loading(budget)
    }

    //
    // Main context
    //
    #[profiling::function]
    fn process_loaded_packages(
        &self,
        budget: &mut TickBudget,
        wait_for: Option<RequestId>,
    ) -> TickResult {
        let ctx = SchedulerContext { shared: self };
        let mut finalized_count = 0;

        loop {
            let finalize_guard = self.finalize_lock.lock().unwrap();
            let (id, mut state, load_start) = {
                let mut tracker = self.tracker.lock().unwrap();
                let id = match tracker.pending_finalize().first() {
                    Some(id) => *id,
                    None => return TickResult::Complete,
                };
                let record = match tracker.get_mut(id) {
                    Some(record) => record,
                    None => return TickResult::Complete,
                };
                if record.dependency_ref_count > 0 {
                    // Finalization is strictly in order, everything behind it waits as well
                    log::trace!(
                        "{} is still referenced by {} packages, finalization blocked",
                        record.name,
                        record.dependency_ref_count
                    );
                    return TickResult::PendingDependency;
                }
                record.finalizing = true;
                let load_start = record.load_start;
                match record.state.take() {
                    Some(state) => (id, state, load_start),
                    None => return TickResult::PendingDependency,
                }
            };

            let result = state.post_load_deferred(budget, &ctx, load_start);
            if result != TickResult::Complete {
                self.tracker.lock().unwrap().put_state(id, state);
                return result;
            }

            let record = self.tracker.lock().unwrap().remove(id);
            self.keep_alive.release(state.kept_alive());
            drop(finalize_guard);

            if let Some(record) = record {
                {
                    let mut pending_requests = self.pending_requests.lock().unwrap();
                    for request_id in &record.request_ids {
                        pending_requests.remove(request_id);
                    }
                }

                let result = record.result.unwrap_or(LoadResult::Failed);
                let package_object = match result {
                    LoadResult::Succeeded => record.package_object,
                    _ => None,
                };
                log::debug!("Finalized {} ({:?})", record.name, result);
                for callback in record.callbacks {
                    callback.invoke(&record.name, package_object, result);
                }
            }

            if let Some(wait_for) = wait_for {
                if !self.is_request_pending(wait_for) {
                    return TickResult::Complete;
                }
            }

            finalized_count += 1;
            if finalized_count % self.config.finalize_time_check_interval.max(1) == 0
                && budget.is_time_limit_exceeded()
            {
                return TickResult::TimedOut;
            }
        }
    }

    // The keep-alive set only needs to outlive loading, empty it once nothing is in flight
    fn release_keep_alive_if_idle(&self) {
        if self.keep_alive.is_empty() {
            return;
        }

        let queue = self.queue.lock().unwrap();
        let tracker = self.tracker.lock().unwrap();
        if queue.is_empty() && self.queued_count() == 0 && tracker.is_idle() {
            self.keep_alive.release_all(&*self.objects);
        }
    }

    /// Finalizes what it can, runs the loading pass when there is no loading thread, then
    /// finalizes again with what's left of the budget. Returns `Complete` once nothing is in
    /// flight, `TimedOut` if the budget ran out, otherwise `PendingDependency`.
    pub fn tick_async_loading(
        &self,
        budget: &mut TickBudget,
        wait_for: Option<RequestId>,
    ) -> TickResult {
        profiling::scope!("SchedulerShared::tick_async_loading");
        if self.is_suspended() {
            return TickResult::TimedOut;
        }
        let mut timed_out = false;

        let mut finalize_budget = budget.sub_budget(self.config.finalize_time_limit());
        if self.process_loaded_packages(&mut finalize_budget, wait_for) == TickResult::TimedOut {
            timed_out = true;
        }

        if !self.config.multithreaded && !timed_out {
            if self.tick_async_thread(budget) == TickResult::TimedOut {
                timed_out = true;
            }

            let mut finalize_budget = budget.sub_budget(self.config.finalize_time_limit());
            if self.process_loaded_packages(&mut finalize_budget, wait_for) == TickResult::TimedOut {
                timed_out = true;
            }
        }

        self.release_keep_alive_if_idle();

        if !self.is_loading() {
            TickResult::Complete
        } else if timed_out {
            TickResult::TimedOut
        } else {
            TickResult::PendingDependency
        }
    }

    /// Blocks until `request_id` (or everything) has been finalized
    pub fn flush(
        &self,
        request_id: Option<RequestId>,
    ) {
        assert!(
            !self.is_suspended(),
            "Cannot flush async loading while async loading is suspended"
        );

        if let Some(request_id) = request_id {
            if !self.is_request_pending(request_id) {
                return;
            }
        }

        profiling::scope!("SchedulerShared::flush");
        log::debug!("Flushing async loading of {:?}", request_id);
        loop {
            let done = match request_id {
                Some(request_id) => !self.is_request_pending(request_id),
                None => !self.is_loading(),
            };
            if done {
                break;
            }

            let mut budget = TickBudget::unlimited();
            self.tick_async_loading(&mut budget, request_id);

            if self.config.multithreaded {
                std::thread::sleep(FLUSH_SLEEP);
            }
        }
    }
}

struct SchedulerContext<'a> {
    shared: &'a SchedulerShared,
}

impl<'a> SchedulerContext<'a> {
    fn invoke_all(ready_callbacks: Vec<ReadyCallback>) {
        for ready_callback in ready_callbacks {
            ready_callback.invoke();
        }
    }
}

impl<'a> PackageLoadContext for SchedulerContext<'a> {
    fn source(&self) -> &dyn PackageSource {
        &*self.shared.source
    }

    fn objects(&self) -> &dyn ObjectSystem {
        &*self.shared.objects
    }

    fn keep_alive(&self) -> &KeepAliveSet {
        &self.shared.keep_alive
    }

    fn is_multithreaded(&self) -> bool {
        self.shared.config.multithreaded
    }

    fn should_yield(&self) -> bool {
        self.shared.should_yield()
    }

    fn is_known_missing(
        &self,
        name: &PackageName,
    ) -> bool {
        self.shared.tracker.lock().unwrap().is_known_missing(name)
    }

    fn mark_known_missing(
        &self,
        name: &PackageName,
    ) {
        log::warn!("Couldn't find file for package {}", name);
        self.shared.tracker.lock().unwrap().mark_known_missing(name)
    }

    fn add_import_dependency(
        &self,
        importer: PackageId,
        name: &PackageName,
    ) {
        self.shared
            .tracker
            .lock()
            .unwrap()
            .add_import_dependency(importer, name)
    }

    fn first_pending_import(
        &self,
        id: PackageId,
    ) -> Option<PackageId> {
        self.shared.tracker.lock().unwrap().first_pending_import(id)
    }

    fn handle_ready(
        &self,
        id: PackageId,
    ) {
        self.shared.tracker.lock().unwrap().on_handle_ready(id)
    }

    fn release_imports(
        &self,
        id: PackageId,
    ) {
        self.shared.tracker.lock().unwrap().release_imports(id)
    }

    fn report_load_percentage(
        &self,
        id: PackageId,
        load_percentage: f32,
    ) {
        self.shared
            .tracker
            .lock()
            .unwrap()
            .set_load_percentage(id, load_percentage)
    }

    fn finish(
        &self,
        id: PackageId,
        package_object: Option<ObjectHandle>,
        result: LoadResult,
    ) {
        let ready_callbacks =
            self.shared
                .tracker
                .lock()
                .unwrap()
                .finish_package(id, package_object, result);
        Self::invoke_all(ready_callbacks);
    }
}
