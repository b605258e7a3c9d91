//! Entity identifiers.
//!
//! Every stored entity is keyed by a database-assigned `BIGSERIAL`. The
//! newtypes keep a build ID from being passed where a pipeline ID is expected.

use derive_more::Display;
use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
        )]
        #[serde(transparent)]
        #[display("{_0}")]
        pub struct $name(i64);

        impl $name {
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// The raw storage key.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

numeric_id!(
    /// Identifies a team.
    TeamId
);

numeric_id!(
    /// Identifies a pipeline within the whole installation.
    PipelineId
);

numeric_id!(
    /// Identifies a job row belonging to a pipeline.
    JobId
);

numeric_id!(
    /// Identifies a build. Opaque to callers; unique across all teams.
    BuildId
);
