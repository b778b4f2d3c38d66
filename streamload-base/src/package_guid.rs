use std::fmt;
use std::str::FromStr;

use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};
pub use uuid;
use uuid::Uuid;

/// Content GUID stored in a package file. A load request may carry one to validate that the file
/// on disk is the version the caller expects.
///
/// If using a human-readable format, serializes to a hyphenated UUID format. Otherwise, serializes
/// to and from a `[u8; 16]`.
#[derive(PartialEq, Eq, Clone, Copy, Default, Hash, Ord, PartialOrd)]
pub struct PackageGuid(pub [u8; 16]);

impl PackageGuid {
    pub fn new_v4() -> Self {
        PackageGuid(*Uuid::new_v4().as_bytes())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        PackageGuid(*uuid.as_bytes())
    }

    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Debug for PackageGuid {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("PackageGuid")
            .field(&Uuid::from_bytes(self.0))
            .finish()
    }
}

impl fmt::Display for PackageGuid {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        Uuid::from_bytes(self.0).fmt(f)
    }
}

impl Serialize for PackageGuid {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

struct PackageGuidVisitor;

impl<'a> Visitor<'a> for PackageGuidVisitor {
    type Value = PackageGuid;

    fn expecting(
        &self,
        fmt: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(fmt, "a UUID-formatted string")
    }

    fn visit_str<E: de::Error>(
        self,
        s: &str,
    ) -> Result<Self::Value, E> {
        Uuid::from_str(s)
            .map(PackageGuid::from_uuid)
            .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(s), &self))
    }
}

impl<'de> Deserialize<'de> for PackageGuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_string(PackageGuidVisitor)
        } else {
            Ok(PackageGuid(<[u8; 16]>::deserialize(deserializer)?))
        }
    }
}
