//! Newtype identifiers.
//!
//! Thin typed wrappers around `String`/`u64` rather than bare primitives at
//! public boundaries, mirroring how the teacher favors small typed wrappers
//! (e.g. tool names, session keys) over stringly-typed data.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(String);

        impl $name {
            /// Wrap an owned string as this identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(RunId, "Identifies a run uniquely within the runtime.");
string_id!(SpanId, "Identifies one agent-loop step within a run.");
string_id!(AgentId, "Identifies an agent definition (prompt + tool set).");
string_id!(
    SessionKey,
    "Identifies a conversation/session for memory retrieval."
);
string_id!(GroupId, "Identifies a swarm delegation group.");
string_id!(ToolCallId, "Identifies one tool invocation within a step.");

/// Identifies one event within the append-only event log.
///
/// Wraps the monotonically increasing `u64` primary key assigned by the
/// event log on insert, rather than exposing a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(u64);

impl EventId {
    /// Wrap a raw event log row id.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw row id, for use as a pagination cursor.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_round_trip_through_display() {
        let id = RunId::new("run-1");
        assert_eq!(id.as_str(), "run-1");
        assert_eq!(id.to_string(), "run-1");
    }

    #[test]
    fn event_ids_order_numerically() {
        assert!(EventId::new(2) > EventId::new(1));
    }
}
