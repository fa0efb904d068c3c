//! Strongly-typed identifiers for domain entities.
//!
//! Patches get random, time-ordered ids. Everything materialized from a patch
//! (versions, builds, tasks) gets an id derived from its parent's id, so an
//! id can be computed and referenced before the row holding it exists.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::LazyLock;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0.simple())
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

macro_rules! define_name_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

define_id!(PatchId, "ptc");

define_name_id!(VersionId);
define_name_id!(BuildId);
define_name_id!(TaskId);
define_name_id!(HostId);
define_name_id!(DistroId);

static UNSAFE_ID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid id regex"));

/// Replace characters that are awkward in ids (whitespace, slashes, ...).
pub fn sanitize(part: &str) -> String {
    UNSAFE_ID_CHARS.replace_all(part, "-").into_owned()
}

/// Short digest over length-prefixed parts. Two different tuples never
/// share an input, even when their sanitized forms collide.
fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(&hasher.finalize()[..4])
}

impl VersionId {
    /// The version materialized when a patch is finalized.
    pub fn for_patch(patch_id: PatchId) -> Self {
        Self(format!("{}_0", patch_id.as_uuid().simple()))
    }
}

impl BuildId {
    /// Derive the id of the build for `variant` under `version`.
    pub fn derive(version: &VersionId, variant: &str) -> Self {
        Self(format!(
            "{}_{}_{}",
            version.as_str(),
            sanitize(variant),
            digest(&[version.as_str(), variant])
        ))
    }
}

impl TaskId {
    /// Derive the id of the task `(variant, task)` under `version`.
    ///
    /// Pure function of its inputs: the same triple always yields the same id.
    pub fn derive(version: &VersionId, variant: &str, task: &str) -> Self {
        Self(format!(
            "{}_{}_{}_{}",
            version.as_str(),
            sanitize(variant),
            sanitize(task),
            digest(&[version.as_str(), variant, task])
        ))
    }
}
