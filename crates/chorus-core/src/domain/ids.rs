//! Strongly-typed identifiers.
//!
//! ULID-backed: sortable by creation time, generated without coordination,
//! 128-bit. The Display form carries a short prefix ("task-", "batch-") so
//! ids are self-describing in logs and in the durable backend's queue
//! entries; `FromStr` accepts both the prefixed and the bare form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
#[error("malformed id: {0}")]
pub struct IdParseError(String);

macro_rules! ulid_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            pub fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            pub fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bare = s.strip_prefix($prefix).unwrap_or(s);
                Ulid::from_string(bare)
                    .map(Self)
                    .map_err(|_| IdParseError(s.to_string()))
            }
        }
    };
}

ulid_id!(TaskId, "task-");
ulid_id!(BatchId, "batch-");
