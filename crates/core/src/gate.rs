//! Connection gate abstraction.
//!
//! The gate controls whether new client connections to the maintained
//! database are accepted. Only the orchestrator holds a gate, and it always
//! receives it by `&mut`, so there is exactly one writer per run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GateError;

/// Whether new connections are currently accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Open,
    Blocked,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block/allow capability over new client connections.
///
/// Both transitions must be idempotent: blocking a blocked gate and
/// allowing an open gate are successful no-ops.
#[async_trait]
pub trait ConnectionGate: Send {
    /// Stop accepting new connections.
    async fn block(&mut self) -> Result<(), GateError>;

    /// Accept new connections again.
    ///
    /// A failure must be returned, never swallowed; the caller decides
    /// whether to retry.
    async fn allow(&mut self) -> Result<(), GateError>;

    /// The last state the gate successfully transitioned to.
    fn current_state(&self) -> GateState;
}

// ---------------------------------------------------------------------------
// In-memory gate
// ---------------------------------------------------------------------------

/// Process-local gate used for dry runs and tests.
///
/// Supports failure injection for both transitions and counts every call.
#[derive(Debug)]
pub struct InMemoryGate {
    state: GateState,
    block_calls: u32,
    allow_calls: u32,
    successful_allows: u32,
    fail_block: bool,
    allow_failures_remaining: u32,
}

impl Default for InMemoryGate {
    fn default() -> Self {
        Self {
            state: GateState::Open,
            block_calls: 0,
            allow_calls: 0,
            successful_allows: 0,
            fail_block: false,
            allow_failures_remaining: 0,
        }
    }
}

impl InMemoryGate {
    /// Create an open gate that never fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a gate whose `block` always fails.
    pub fn failing_block() -> Self {
        Self {
            fail_block: true,
            ..Self::default()
        }
    }

    /// Create a gate whose first `failures` calls to `allow` fail.
    pub fn failing_allow(failures: u32) -> Self {
        Self {
            allow_failures_remaining: failures,
            ..Self::default()
        }
    }

    /// Create a gate that starts out blocked (left over from a crashed run).
    pub fn already_blocked() -> Self {
        Self {
            state: GateState::Blocked,
            ..Self::default()
        }
    }

    pub fn block_calls(&self) -> u32 {
        self.block_calls
    }

    /// Every `allow` invocation, including failed ones.
    pub fn allow_calls(&self) -> u32 {
        self.allow_calls
    }

    pub fn successful_allows(&self) -> u32 {
        self.successful_allows
    }
}

#[async_trait]
impl ConnectionGate for InMemoryGate {
    async fn block(&mut self) -> Result<(), GateError> {
        self.block_calls += 1;
        if self.fail_block {
            return Err(GateError::Block("injected block failure".to_string()));
        }
        self.state = GateState::Blocked;
        Ok(())
    }

    async fn allow(&mut self) -> Result<(), GateError> {
        self.allow_calls += 1;
        if self.allow_failures_remaining > 0 {
            self.allow_failures_remaining -= 1;
            return Err(GateError::Allow("injected allow failure".to_string()));
        }
        self.state = GateState::Open;
        self.successful_allows += 1;
        Ok(())
    }

    fn current_state(&self) -> GateState {
        self.state
    }
}
