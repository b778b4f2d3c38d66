pub mod hashing;

mod package_name;
pub use package_name::PackageName;

mod package_guid;
pub use package_guid::PackageGuid;

pub mod handle;
pub use handle::{LoadPriority, ObjectHandle, PackageId, RequestId};
