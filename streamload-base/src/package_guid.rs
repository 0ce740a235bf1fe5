use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Debug, Formatter};
use uuid::Uuid;

/// Content guid stored in a package summary (and optionally on each export). Used to validate
/// that the file found on disk is the one the caller asked for.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Default)]
pub struct PackageGuid(pub u128);
impl PackageGuid {
    pub const fn null() -> Self {
        PackageGuid(0)
    }

    pub fn new_v4() -> Self {
        PackageGuid(Uuid::new_v4().as_u128())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        PackageGuid(uuid.as_u128())
    }

    pub fn as_uuid(&self) -> Uuid {
        Uuid::from_u128(self.0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PackageGuid(u128::from_le_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_le_bytes()
    }
}

impl Debug for PackageGuid {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_tuple("PackageGuid")
            .field(&Uuid::from_u128(self.0))
            .finish()
    }
}

impl fmt::Display for PackageGuid {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> fmt::Result {
        fmt::Display::fmt(&self.as_uuid(), f)
    }
}

// Same wire form as the uuid itself: a hyphenated string in JSON manifests
impl Serialize for PackageGuid {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        self.as_uuid().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PackageGuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Uuid::deserialize(deserializer).map(PackageGuid::from_uuid)
    }
}
