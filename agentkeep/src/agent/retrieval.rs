//! Memory retrieval: the Agent Loop's Retrieve step collaborator.
//!
//! Named distinctly from a transcript store (it is read-oriented, not an
//! append target) and grounded on `NoopRunHooks`'s no-op-default pattern: a
//! working runtime can omit retrieval entirely.

use async_trait::async_trait;

use crate::error::Result;
use crate::ids::SessionKey;
use crate::scope::Scope;

/// One retrieved memory item, opaque to the Agent Loop beyond its text.
#[derive(Debug, Clone)]
pub struct MemoryItem {
    /// Identifier of the item, opaque to the runtime.
    pub item_id: String,
    /// The retrieved content, folded into the system prompt.
    pub content: String,
}

/// External collaborator queried by the Retrieve step with working context.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Fetch up to `limit` items relevant to `query` within `session_key`.
    ///
    /// # Errors
    /// Implementations may return any [`crate::error::RuntimeError`]; a
    /// failure here does not terminate the run (callers should fall back to
    /// an empty result on error, per spec §4.8's best-effort Retrieve step).
    async fn retrieve(
        &self,
        scope: &Scope,
        session_key: &SessionKey,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryItem>>;
}

/// The default [`MemoryStore`]: always returns no items.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMemoryStore;

#[async_trait]
impl MemoryStore for NullMemoryStore {
    async fn retrieve(
        &self,
        _scope: &Scope,
        _session_key: &SessionKey,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        Ok(Vec::new())
    }
}
