//! Strongly-typed identifiers.
//!
//! Workers are identified two ways: the OS process id of the current
//! incarnation, and the supervisor slot the process fills. A slot outlives
//! the processes that occupy it across restarts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a numeric ID newtype wrapper.
///
/// Generates: struct, `new()`, `get()`, Display, Serialize, Deserialize.
macro_rules! define_id {
    ($name:ident, $inner:ty, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name($inner);

        impl $name {
            pub const fn new(raw: $inner) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            fn from(raw: $inner) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(WorkerId, u32, "pid:");
define_id!(WorkerSlot, usize, "slot:");
