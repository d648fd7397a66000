//! The Agent Loop: drives one run's step machine from Observe through
//! Reflect, collaborating with memory retrieval and context assembly.

mod context;
mod retrieval;
mod run_loop;

pub use context::{build_context, AgentContext};
pub use retrieval::{MemoryItem, MemoryStore, NullMemoryStore};
pub use run_loop::{AgentLoop, DelegationKind, DelegationRequest, Delegator};
