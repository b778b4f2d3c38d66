pub mod archive;
mod budget;
pub mod config;
pub mod disk_io;
pub mod error;
mod keep_alive;
mod loading_thread;
mod package;
pub mod package_source;
mod request;
mod scheduler;
mod tracker;

#[cfg(test)]
mod tests;

pub use crate::archive::{AsyncFileArchive, CompressedChunk, CompressionFlags};
pub use crate::config::LoaderConfig;
pub use crate::disk_io::AsyncReadQueue;
pub use crate::error::{DeserializeError, LoadFailure, LoadResult, LoaderError, OpenPackageError};
pub use crate::package::{LoadStep, TickResult};
pub use crate::package_source::{
    DependencyIndex, ExportEntry, HandleStatus, ImportEntry, ObjectSystem, OpenPackageRequest,
    PackageHandle, PackageSource, PACKAGE_CLASS_NAME,
};
pub use crate::request::{CompletionCallbackFn, PackageRequest};
pub use streamload_base::{LoadPriority, ObjectHandle, PackageGuid, PackageName, RequestId};

use crate::budget::TickBudget;
use crate::loading_thread::LoadingThread;
use crate::scheduler::SchedulerShared;
use std::sync::Arc;
use std::time::Duration;

// Streams packages in the background. Owns the scheduler state and, in multithreaded mode, the
// loading thread. Everything except `tick` may be called from any thread.
pub struct AsyncLoader {
    shared: Arc<SchedulerShared>,
    loading_thread: Option<LoadingThread>,
}

impl AsyncLoader {
    pub fn new(
        config: LoaderConfig,
        source: Arc<dyn PackageSource>,
        objects: Arc<dyn ObjectSystem>,
    ) -> Result<Self, LoaderError> {
        Self::create(config, source, objects, None)
    }

    /// With a dependency index, hard dependencies start loading as soon as their root is
    /// requested (if `preload_dependencies` is set) and priority boosts reach them.
    pub fn new_with_dependency_index(
        config: LoaderConfig,
        source: Arc<dyn PackageSource>,
        objects: Arc<dyn ObjectSystem>,
        dependency_index: Arc<dyn DependencyIndex>,
    ) -> Result<Self, LoaderError> {
        Self::create(config, source, objects, Some(dependency_index))
    }

    fn create(
        config: LoaderConfig,
        source: Arc<dyn PackageSource>,
        objects: Arc<dyn ObjectSystem>,
        dependency_index: Option<Arc<dyn DependencyIndex>>,
    ) -> Result<Self, LoaderError> {
        let multithreaded = config.multithreaded;
        let shared = Arc::new(SchedulerShared::new(
            config,
            source,
            objects,
            dependency_index,
        ));

        let loading_thread = if multithreaded {
            Some(LoadingThread::start(shared.clone())?)
        } else {
            log::info!("Async loading is time-sliced on the ticking thread");
            None
        };

        Ok(AsyncLoader {
            shared,
            loading_thread,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.shared.config
    }

    pub fn enqueue(
        &self,
        request: PackageRequest,
    ) -> RequestId {
        self.shared.enqueue(request)
    }

    /// 0 to 100 for a package in flight, -1 if the package isn't known to the loader
    pub fn load_percentage(
        &self,
        name: &PackageName,
    ) -> f32 {
        self.shared.load_percentage(name)
    }

    /// Blocks until the request (or every request, with `None`) has been finalized and its
    /// callbacks have run. Panics if loading is suspended.
    pub fn flush(
        &self,
        request_id: Option<RequestId>,
    ) {
        self.shared.flush(request_id)
    }

    /// Cancels everything queued or in flight and blocks until it's gone. Callbacks receive
    /// [`LoadResult::Canceled`]. Panics if loading is suspended.
    pub fn cancel(&self) {
        assert!(
            !self.shared.is_suspended(),
            "Cannot cancel async loading while async loading is suspended"
        );

        self.shared.request_cancel();
        if self.loading_thread.is_some() {
            self.shared.wait_for_cancel();
        } else {
            self.shared.cancel_internal();
        }
    }

    /// Reentrant. Blocks until the loading thread has stopped working.
    pub fn suspend(&self) {
        if self.shared.suspend() && self.loading_thread.is_some() {
            self.shared.suspended_event.wait();
        }
    }

    /// Panics if called more often than [`AsyncLoader::suspend`]
    pub fn resume(&self) {
        if self.shared.resume() && self.loading_thread.is_some() {
            self.shared.resumed_event.wait();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.is_suspended()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.is_loading()
    }

    /// Does one frame's worth of loading on the calling thread, which must be the same thread
    /// every time. `None` runs without a time limit.
    pub fn tick(
        &self,
        time_limit: Option<Duration>,
    ) -> TickResult {
        let budget = match time_limit {
            Some(time_limit) => TickBudget::new(true, false, time_limit),
            None => TickBudget::unlimited(),
        };
        let mut budget = budget.with_overrun_warning(&self.shared.config);
        self.shared.tick_async_loading(&mut budget, None)
    }

    /// Like [`AsyncLoader::tick`], but IO waits may block until the time limit is used up
    pub fn tick_full_time_limit(
        &self,
        time_limit: Duration,
    ) -> TickResult {
        let mut budget =
            TickBudget::new(true, true, time_limit).with_overrun_warning(&self.shared.config);
        self.shared.tick_async_loading(&mut budget, None)
    }

    pub fn tick_default(&self) -> TickResult {
        self.tick(Some(self.shared.config.time_limit()))
    }

    // Names and priorities of the packages being ticked, in processing order
    pub fn active_packages(&self) -> Vec<(PackageName, LoadPriority)> {
        self.shared.active_packages()
    }

    pub fn pending_finalize_count(&self) -> usize {
        self.shared.pending_finalize_count()
    }

    pub fn keep_alive_count(&self) -> usize {
        self.shared.keep_alive.len()
    }

    pub fn queued_count(&self) -> usize {
        self.shared.queued_count().max(0) as usize
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        if let Some(mut loading_thread) = self.loading_thread.take() {
            if self.shared.is_suspended() {
                log::warn!("AsyncLoader dropped while async loading is suspended");
            }
            loading_thread.stop();
        }
    }
}
