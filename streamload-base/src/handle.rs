use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority of a load request. Higher values are more urgent. Dependencies the loader creates on
/// its own take the priority of the request or importer that discovered them.
pub type LoadPriority = i32;

/// Opaque reference to an object owned by the embedding application's object system. The loader
/// never dereferences it, it only hands it back to the object system.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHandle(pub u64);

impl fmt::Debug for ObjectHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("ObjectHandle")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

/// Externally visible id of a single enqueue call. Several requests may be served by the same
/// in-flight package.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index-stable key of a package in the scheduler's arena. The generation changes every time a
/// slot is reused, so a stale id never aliases a newer package.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId {
    index: u32,
    generation: u32,
}

impl PackageId {
    pub fn new(
        index: u32,
        generation: u32,
    ) -> Self {
        PackageId { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}
