use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Logical name of a package, for example `/Game/Maps/Entry`. Cheap to clone, names are passed
/// around a lot between the scheduler, callbacks and the object system.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageName(Arc<str>);

impl PackageName {
    pub fn new(name: &str) -> Self {
        PackageName(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short names have no path separator. They usually come from references to packages of
    /// another project and can't be resolved to a file.
    pub fn is_short(&self) -> bool {
        !self.0.contains('/')
    }
}

impl From<&str> for PackageName {
    fn from(name: &str) -> Self {
        PackageName::new(name)
    }
}

impl From<String> for PackageName {
    fn from(name: String) -> Self {
        PackageName(Arc::from(name))
    }
}

impl From<&String> for PackageName {
    fn from(name: &String) -> Self {
        PackageName::new(name)
    }
}

impl Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PackageName {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "PackageName({:?})", &*self.0)
    }
}

impl fmt::Display for PackageName {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for PackageName {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PackageName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<PackageName, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(PackageName::from(name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn short_names() {
        assert!(PackageName::new("Engine").is_short());
        assert!(!PackageName::new("/Game/Maps/Entry").is_short());
    }

    #[test]
    fn serializes_as_plain_string() {
        let name = PackageName::new("/Game/Props");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"/Game/Props\"");
        let parsed: PackageName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn lookup_by_str() {
        let mut names = crate::hashing::HashSet::default();
        names.insert(PackageName::new("/Game/Core"));
        assert!(names.contains("/Game/Core"));
    }
}
