//! Runtime configuration.
//!
//! Holds the tunable limits referenced throughout the crate: step/tool
//! concurrency, event bus inbox capacity, dispatcher worker pool size, and
//! the per-run token budget.

/// Default maximum number of agent-loop steps before a run fails with
/// [`crate::error::RuntimeError::MaxSteps`].
pub const DEFAULT_MAX_STEPS: usize = 20;

/// Default number of tool calls executed concurrently within one
/// parallel-eligible chunk.
pub const DEFAULT_PARALLEL_LIMIT: usize = 8;

/// Default bounded capacity of each subscriber's event inbox.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Default number of runs the ingress dispatcher will drive concurrently.
pub const DEFAULT_DISPATCHER_WORKERS: usize = 4;

/// Default depth of the ingress dispatcher's work queue.
pub const DEFAULT_DISPATCHER_QUEUE: usize = 128;

/// Default wall-clock timeout applied to a single tool call, in milliseconds,
/// when the tool itself declares none.
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;

/// Tunable limits for one runtime instance.
///
/// Construct with [`RuntimeConfig::new`] and adjust fields with the
/// builder-style `with_*` setters, mirroring the teacher's small
/// configuration structs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum agent-loop steps per run.
    pub max_steps: usize,
    /// Tool calls executed concurrently within one parallel chunk.
    pub parallel_limit: usize,
    /// Bounded capacity of each subscriber's event inbox.
    pub bus_capacity: usize,
    /// Number of runs the dispatcher drives concurrently.
    pub dispatcher_workers: usize,
    /// Depth of the dispatcher's submission queue.
    pub dispatcher_queue: usize,
    /// Fallback tool-call timeout in milliseconds.
    pub default_tool_timeout_ms: u64,
    /// Maximum cumulative tokens a run may consume before it is failed with
    /// [`crate::error::RuntimeError::BudgetExceeded`]. `None` disables the check.
    pub max_tokens: Option<u64>,
}

impl RuntimeConfig {
    /// Create a configuration with the teacher-aligned defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            parallel_limit: DEFAULT_PARALLEL_LIMIT,
            bus_capacity: DEFAULT_BUS_CAPACITY,
            dispatcher_workers: DEFAULT_DISPATCHER_WORKERS,
            dispatcher_queue: DEFAULT_DISPATCHER_QUEUE,
            default_tool_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
            max_tokens: None,
        }
    }

    /// Set the maximum number of agent-loop steps.
    #[must_use]
    pub const fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set the tool-call parallelism limit.
    #[must_use]
    pub const fn with_parallel_limit(mut self, parallel_limit: usize) -> Self {
        self.parallel_limit = parallel_limit;
        self
    }

    /// Set the per-subscriber event inbox capacity.
    #[must_use]
    pub const fn with_bus_capacity(mut self, bus_capacity: usize) -> Self {
        self.bus_capacity = bus_capacity;
        self
    }

    /// Set the dispatcher's concurrent worker count.
    #[must_use]
    pub const fn with_dispatcher_workers(mut self, dispatcher_workers: usize) -> Self {
        self.dispatcher_workers = dispatcher_workers;
        self
    }

    /// Set the dispatcher's submission queue depth.
    #[must_use]
    pub const fn with_dispatcher_queue(mut self, dispatcher_queue: usize) -> Self {
        self.dispatcher_queue = dispatcher_queue;
        self
    }

    /// Set the per-run token budget.
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
