//! Error types for the agent runtime.
//!
//! This module defines the closed error taxonomy used throughout the crate,
//! mapping each variant to the wire-level `code` string that callers embed
//! in `run.failed` / `tool.result` payloads.

use std::fmt;

/// A type alias for `Result<T, RuntimeError>`.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// The closed set of errors produced by the runtime.
#[derive(Debug)]
pub enum RuntimeError {
    /// A request failed validation before any state changed.
    InvalidInput {
        /// Description of the validation failure.
        message: String,
    },

    /// A read or write was attempted with a scope that does not match the
    /// entity's persisted scope.
    ScopeMismatch {
        /// Description of the mismatched boundary.
        message: String,
    },

    /// An entity could not be found under the given scope.
    NotFound {
        /// Description of what was not found.
        message: String,
    },

    /// The persistence layer failed.
    Storage {
        /// The underlying error message.
        message: String,
    },

    /// A single tool call failed; does not terminate the run.
    ToolError {
        /// Name of the tool that failed.
        tool_name: String,
        /// The underlying error message.
        message: String,
    },

    /// A tool call exceeded its declared `timeout_ms`.
    Timeout {
        /// Name of the tool that timed out.
        tool_name: String,
    },

    /// A pending approval was rejected by the external decision-maker.
    ApprovalRejected {
        /// Reason given for the rejection, if any.
        reason: Option<String>,
    },

    /// A tool call was blocked by policy before execution.
    PolicyBlocked {
        /// Name of the blocked tool.
        tool_name: String,
        /// Reason the policy blocked the call.
        reason: String,
    },

    /// The agent loop failed and the run must terminate.
    AgentError {
        /// Description of the failure.
        message: String,
    },

    /// The run exhausted its token/step budget.
    BudgetExceeded {
        /// Description of which budget was exceeded.
        message: String,
    },

    /// The run reached its maximum step count without a final answer.
    MaxSteps {
        /// Maximum allowed steps.
        max_steps: usize,
    },

    /// A delegation would have created a cycle in the parent chain.
    DelegationCycle {
        /// The run id that would have closed the cycle.
        run_id: String,
    },

    /// A child run failed; surfaced to the parent's fan-in result.
    ChildFailed {
        /// The child run id that failed.
        child_run_id: String,
        /// The child's failure message.
        message: String,
    },

    /// An idempotent operation was retried after already resolving.
    AlreadyResolved {
        /// Description of what was already resolved.
        message: String,
    },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::ScopeMismatch { message } => write!(f, "scope mismatch: {message}"),
            Self::NotFound { message } => write!(f, "not found: {message}"),
            Self::Storage { message } => write!(f, "storage error: {message}"),
            Self::ToolError { tool_name, message } => {
                write!(f, "tool '{tool_name}' failed: {message}")
            }
            Self::Timeout { tool_name } => write!(f, "tool '{tool_name}' timed out"),
            Self::ApprovalRejected { reason } => match reason {
                Some(r) => write!(f, "approval rejected: {r}"),
                None => write!(f, "approval rejected"),
            },
            Self::PolicyBlocked { tool_name, reason } => {
                write!(f, "tool '{tool_name}' blocked by policy: {reason}")
            }
            Self::AgentError { message } => write!(f, "agent error: {message}"),
            Self::BudgetExceeded { message } => write!(f, "budget exceeded: {message}"),
            Self::MaxSteps { max_steps } => write!(f, "reached maximum steps ({max_steps})"),
            Self::DelegationCycle { run_id } => {
                write!(f, "delegation would cycle back to ancestor run '{run_id}'")
            }
            Self::ChildFailed {
                child_run_id,
                message,
            } => write!(f, "child run '{child_run_id}' failed: {message}"),
            Self::AlreadyResolved { message } => write!(f, "already resolved: {message}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<rusqlite::Error> for RuntimeError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for RuntimeError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl RuntimeError {
    /// The stable wire-level code for this error, embedded in `run.failed`
    /// and `tool.result` payloads.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::ScopeMismatch { .. } => "SCOPE_MISMATCH",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::ToolError { .. } => "TOOL_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ApprovalRejected { .. } => "APPROVAL_REJECTED",
            Self::PolicyBlocked { .. } => "POLICY_BLOCKED",
            Self::AgentError { .. } => "AGENT_ERROR",
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::MaxSteps { .. } => "MAX_STEPS",
            Self::DelegationCycle { .. } => "DELEGATION_CYCLE",
            Self::ChildFailed { .. } => "CHILD_FAILED",
            Self::AlreadyResolved { .. } => "ALREADY_RESOLVED",
        }
    }

    /// True for errors that terminate the run (agent/step-level), as
    /// opposed to tool-level errors that stay local to one call.
    #[must_use]
    pub const fn terminates_run(&self) -> bool {
        matches!(
            self,
            Self::AgentError { .. } | Self::BudgetExceeded { .. } | Self::MaxSteps { .. }
        )
    }

    /// Shorthand constructor for [`RuntimeError::NotFound`].
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Shorthand constructor for [`RuntimeError::InvalidInput`].
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Shorthand constructor for [`RuntimeError::AgentError`].
    #[must_use]
    pub fn agent(message: impl Into<String>) -> Self {
        Self::AgentError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_per_variant() {
        assert_eq!(RuntimeError::not_found("x").code(), "NOT_FOUND");
        assert_eq!(RuntimeError::invalid_input("x").code(), "INVALID_INPUT");
        assert_eq!(RuntimeError::MaxSteps { max_steps: 5 }.code(), "MAX_STEPS");
    }

    #[test]
    fn only_step_level_errors_terminate_the_run() {
        assert!(RuntimeError::agent("boom").terminates_run());
        assert!(RuntimeError::MaxSteps { max_steps: 1 }.terminates_run());
        assert!(!RuntimeError::ToolError {
            tool_name: "t".into(),
            message: "m".into()
        }
        .terminates_run());
        assert!(!RuntimeError::ApprovalRejected { reason: None }.terminates_run());
    }

    #[test]
    fn display_includes_context() {
        let err = RuntimeError::ToolError {
            tool_name: "delete_file".into(),
            message: "permission denied".into(),
        };
        assert!(err.to_string().contains("delete_file"));
        assert!(err.to_string().contains("permission denied"));
    }
}
