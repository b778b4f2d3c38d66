use crate::archive::AsyncFileArchive;
use crate::error::{DeserializeError, OpenPackageError};
use downcast_rs::Downcast;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use streamload_base::{ObjectHandle, PackageGuid, PackageName};

// Class name of an import that refers to a whole package rather than an object inside one
pub const PACKAGE_CLASS_NAME: &str = "Package";

// An object this package needs from somewhere else. `outer` indexes another import in the same
// table, the outermost one names the package that has to be loaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportEntry {
    pub outer: Option<usize>,
    pub object_name: String,
    pub class_name: String,
}

impl ImportEntry {
    pub fn package(name: impl Into<String>) -> Self {
        ImportEntry {
            outer: None,
            object_name: name.into(),
            class_name: PACKAGE_CLASS_NAME.to_string(),
        }
    }

    pub fn object(
        outer: usize,
        object_name: impl Into<String>,
        class_name: impl Into<String>,
    ) -> Self {
        ImportEntry {
            outer: Some(outer),
            object_name: object_name.into(),
            class_name: class_name.into(),
        }
    }

    pub fn is_package(&self) -> bool {
        self.class_name == PACKAGE_CLASS_NAME
    }
}

// An object stored in this package. The serial range is the logical offset of its data within
// the package file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    pub serial_offset: u64,
    pub serial_size: u64,
    pub object_name: String,
    pub class_name: String,
}

impl ExportEntry {
    pub fn new(
        object_name: impl Into<String>,
        class_name: impl Into<String>,
        serial_offset: u64,
        serial_size: u64,
    ) -> Self {
        ExportEntry {
            serial_offset,
            serial_size,
            object_name: object_name.into(),
            class_name: class_name.into(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandleStatus {
    Loaded,
    InProgress,
    Failed,
}

#[derive(Copy, Clone, Debug)]
pub struct OpenPackageRequest<'a> {
    pub name: &'a PackageName,
    pub load_from: Option<&'a Path>,
    pub guid: Option<PackageGuid>,
}

/// An open package file. Reading the summary is time-sliced through [`PackageHandle::tick`], after
/// which the import and export tables are available. Implementations are usually downcast by the
/// object system to deserialize exports.
pub trait PackageHandle: Downcast + Send {
    // Continue reading the package summary. A `None` limit means run to completion.
    fn tick(
        &mut self,
        time_limit: Option<Duration>,
    ) -> HandleStatus;

    fn imports(&self) -> &[ImportEntry];

    fn exports(&self) -> &[ExportEntry];

    // Returns true if [offset, offset + size) can be read without blocking
    fn precache(
        &mut self,
        offset: u64,
        size: u64,
    ) -> bool;

    // Direct access to the underlying file, for handles that are backed by one
    fn archive_mut(&mut self) -> Option<&mut AsyncFileArchive> {
        None
    }

    // GPU or other deferred allocations requested while creating exports
    fn has_pending_resource_allocations(&self) -> bool {
        false
    }

    fn cancel_resource_allocations(&mut self) {}

    // Called when the load is abandoned, outstanding reads must be waited on
    fn flush_cache(&mut self) {}
}

downcast_rs::impl_downcast!(PackageHandle);

// Where packages come from
pub trait PackageSource: Send + Sync {
    fn open_package(
        &self,
        request: &OpenPackageRequest,
    ) -> Result<Box<dyn PackageHandle>, OpenPackageError>;
}

/// The world that loaded objects live in. Called from the loading thread for everything except
/// [`ObjectSystem::post_load`] of main-thread-only objects and [`ObjectSystem::mark_package_loaded`].
///
/// `objects_loaded` is the per-package list of objects that were loaded as a side effect of a
/// call. The loader later runs preload and postload over everything that ends up in it.
pub trait ObjectSystem: Send + Sync {
    fn is_package_loaded(
        &self,
        name: &PackageName,
    ) -> bool;

    // Find or create the in-memory object that represents a package
    fn create_package(
        &self,
        name: &PackageName,
    ) -> ObjectHandle;

    // Resolve an import. None if the object could not be found, which is not an error.
    fn create_import(
        &self,
        handle: &mut dyn PackageHandle,
        import_index: usize,
    ) -> Option<ObjectHandle>;

    // Create (but don't yet deserialize) an export. The returned object is added to
    // `objects_loaded` by the caller.
    fn create_export(
        &self,
        handle: &mut dyn PackageHandle,
        export_index: usize,
        objects_loaded: &mut Vec<ObjectHandle>,
    ) -> Result<Option<ObjectHandle>, DeserializeError>;

    // Deserialize an object. Must ignore objects that have already been preloaded.
    fn preload(
        &self,
        handle: &mut dyn PackageHandle,
        object: ObjectHandle,
        objects_loaded: &mut Vec<ObjectHandle>,
    ) -> Result<(), DeserializeError>;

    fn post_load(
        &self,
        object: ObjectHandle,
        objects_loaded: &mut Vec<ObjectHandle>,
    );

    // Objects whose post_load has to run on the thread that calls tick
    fn is_main_thread_only(
        &self,
        _object: ObjectHandle,
    ) -> bool {
        false
    }

    fn outermost_package(
        &self,
        object: ObjectHandle,
    ) -> Option<PackageName>;

    // Clears whatever "being loaded" marks the object system keeps on these objects
    fn clear_loading_flags(
        &self,
        objects: &[ObjectHandle],
    );

    // Poisons objects of a failed or canceled load so nothing else picks them up. The same
    // object may be invalidated more than once.
    fn invalidate(
        &self,
        objects: &[ObjectHandle],
    );

    fn mark_package_loaded(
        &self,
        package_object: ObjectHandle,
        load_time: Duration,
    );
}

// Static knowledge of which packages a package can't load without, used to start loading
// dependencies before their importers reach them
pub trait DependencyIndex: Send + Sync {
    fn hard_dependencies(
        &self,
        name: &PackageName,
    ) -> Vec<PackageName>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn import_entry_classes() {
        let package = ImportEntry::package("/Game/Props");
        assert!(package.is_package());
        assert_eq!(package.outer, None);

        let object = ImportEntry::object(0, "Chair", "StaticMesh");
        assert!(!object.is_package());
        assert_eq!(object.outer, Some(0));
    }

    #[test]
    fn tables_serialize() {
        let exports = vec![ExportEntry::new("Chair", "StaticMesh", 128, 64)];
        let json = serde_json::to_string(&exports).unwrap();
        let parsed: Vec<ExportEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, exports);
    }
}
