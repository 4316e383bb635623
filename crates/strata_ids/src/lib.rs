//! Shared identifier wrappers for Strata.
//!
//! Pipeline tasks and pipeline-definition nodes are both identified by
//! opaque database integers. The wrappers keep them from being
//! mixed up at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_int_id {
    ($name:ident, $label:expr) => {
        #[doc = concat!("Database ", $label, ".")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_int_id!(TaskId, "task ID");
define_int_id!(NodeId, "pipeline definition node ID");

impl TaskId {
    /// Producer id stored for ledger rows that no task has produced yet.
    pub const UNPRODUCED: TaskId = TaskId(0);

    /// Consumer id recorded when this task finished without producing output.
    ///
    /// The ledger stores such consumers as the negated task id.
    pub const fn non_producing_marker(self) -> i64 {
        -self.0
    }

    /// Recover the task from a stored consumer id of either sign.
    pub const fn from_consumer_id(consumer_id: i64) -> Self {
        TaskId(consumer_id.abs())
    }
}
