//! Scope Guard: the (org, user, project?) boundary enforced on every read.
//!
//! Grounded on the teacher's small pure-function policy checks
//! (`ToolBox::requires_confirmation` / `is_forbidden`) rather than an
//! ambient or thread-local context: scope is always a value passed
//! explicitly to the call that needs it, never cached or derived from a
//! prior read.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// The (org, user, project?) triple gating access to every persisted
/// entity. `project` may be absent; absence is matched only by absence,
/// never treated as a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Organization identifier.
    pub org_id: String,
    /// User identifier.
    pub user_id: String,
    /// Optional project identifier.
    pub project_id: Option<String>,
}

impl Scope {
    /// Build a scope without a project.
    #[must_use]
    pub fn new(org_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            user_id: user_id.into(),
            project_id: None,
        }
    }

    /// Attach a project to this scope.
    #[must_use]
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// True when `self` is allowed to see an entity stored under `stored`.
    ///
    /// Scope equality is exact: `org_id` and `user_id` must match and
    /// `project_id` must match including the `None` case.
    #[must_use]
    pub fn visible(&self, stored: &Self) -> bool {
        self == stored
    }
}

/// Reject the read with [`RuntimeError::NotFound`] when `requested` does not
/// match `stored`. Called at every repository read boundary per spec §4.5.
///
/// # Errors
/// Returns `NOT_FOUND` when the scopes differ, so that an out-of-scope
/// lookup is indistinguishable from a missing row.
pub fn require_scope(requested: &Scope, stored: &Scope, what: &str) -> Result<()> {
    if requested.visible(stored) {
        Ok(())
    } else {
        Err(RuntimeError::not_found(format!(
            "{what} not visible under the given scope"
        )))
    }
}
