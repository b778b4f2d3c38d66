use crate::error::LoadResult;
use std::path::PathBuf;
use streamload_base::{LoadPriority, ObjectHandle, PackageGuid, PackageName, RequestId};

pub type CompletionCallbackFn =
    Box<dyn FnOnce(&PackageName, Option<ObjectHandle>, LoadResult) + Send + 'static>;

// Internal callbacks run on the loading context as soon as FinishObjects runs. External
// callbacks run on the thread that calls tick, once the package has been finalized.
pub(crate) struct CompletionCallback {
    pub internal: bool,
    pub callback: CompletionCallbackFn,
}

impl CompletionCallback {
    pub fn invoke(
        self,
        name: &PackageName,
        package_object: Option<ObjectHandle>,
        result: LoadResult,
    ) {
        (self.callback)(name, package_object, result)
    }
}

/// A request to load one package, built by the caller and handed to
/// [`crate::AsyncLoader::enqueue`].
///
/// ```ignore
/// let request = PackageRequest::new("/Game/Maps/Entry")
///     .priority(10)
///     .on_complete(|name, object, result| log::info!("{} {:?} {:?}", name, object, result));
/// let request_id = loader.enqueue(request);
/// ```
pub struct PackageRequest {
    pub(crate) name: PackageName,
    pub(crate) load_from: Option<PathBuf>,
    pub(crate) guid: Option<PackageGuid>,
    pub(crate) priority: LoadPriority,
    pub(crate) callbacks: Vec<CompletionCallback>,
}

impl PackageRequest {
    pub fn new(name: impl Into<PackageName>) -> Self {
        PackageRequest {
            name: name.into(),
            load_from: None,
            guid: None,
            priority: 0,
            callbacks: Vec::new(),
        }
    }

    /// Load the package from this file instead of the one its name resolves to
    pub fn load_from(
        mut self,
        path: impl Into<PathBuf>,
    ) -> Self {
        self.load_from = Some(path.into());
        self
    }

    pub fn guid(
        mut self,
        guid: PackageGuid,
    ) -> Self {
        self.guid = Some(guid);
        self
    }

    pub fn priority(
        mut self,
        priority: LoadPriority,
    ) -> Self {
        self.priority = priority;
        self
    }

    /// Called once, on the thread that ticks the loader, after the package is finalized. The
    /// package object is only passed on success.
    pub fn on_complete<F>(
        mut self,
        callback: F,
    ) -> Self
    where
        F: FnOnce(&PackageName, Option<ObjectHandle>, LoadResult) + Send + 'static,
    {
        self.callbacks.push(CompletionCallback {
            internal: false,
            callback: Box::new(callback),
        });
        self
    }

    /// Called once, on the loading context, as soon as the package's objects are finished and
    /// before main-thread finalization.
    pub fn on_objects_finished<F>(
        mut self,
        callback: F,
    ) -> Self
    where
        F: FnOnce(&PackageName, Option<ObjectHandle>, LoadResult) + Send + 'static,
    {
        self.callbacks.push(CompletionCallback {
            internal: true,
            callback: Box::new(callback),
        });
        self
    }

    pub fn name(&self) -> &PackageName {
        &self.name
    }
}

impl std::fmt::Debug for PackageRequest {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("PackageRequest")
            .field("name", &self.name)
            .field("load_from", &self.load_from)
            .field("priority", &self.priority)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

// A request as it sits in the scheduler's queue. Requests the scheduler makes for itself (hard
// dependencies) have no id and no callbacks.
pub(crate) struct LoadRequest {
    pub request_id: Option<RequestId>,
    pub name: PackageName,
    pub load_from: Option<PathBuf>,
    pub guid: Option<PackageGuid>,
    pub priority: LoadPriority,
    pub callbacks: Vec<CompletionCallback>,
}

impl LoadRequest {
    pub fn from_package_request(
        request: PackageRequest,
        request_id: RequestId,
    ) -> Self {
        LoadRequest {
            request_id: Some(request_id),
            name: request.name,
            load_from: request.load_from,
            guid: request.guid,
            priority: request.priority,
            callbacks: request.callbacks,
        }
    }

    pub fn dependency(
        name: PackageName,
        priority: LoadPriority,
    ) -> Self {
        LoadRequest {
            request_id: None,
            name,
            load_from: None,
            guid: None,
            priority,
            callbacks: Vec::new(),
        }
    }
}
