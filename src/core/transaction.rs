//! Transaction coordination
//!
//! Each adapter instance owns one [`TransactionGate`]. The gate guarantees that at most
//! one transaction scope is open per adapter, rejects nested scopes with a
//! `TransactionState` error, and decides what a second concurrent scope does
//! ([`ConcurrencyPolicy`]). Nesting is detected per task: while a scope's body runs, the
//! gate id is recorded in a task-local set, so a nested call from inside the body fails
//! fast instead of deadlocking on the gate.
//!
//! Backends without native multi-operation atomicity do not get a fabricated rollback.
//! They run batches through [`run_sequential`], which stops at the first failure and
//! reports the outcomes that were already applied.

use super::error::{BridgeError, Result};
use super::value::Outcome;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

tokio::task_local! {
    static OPEN_SCOPES: Vec<u64>;
}

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

/// What a second, concurrent scope on the same adapter does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Wait until the open scope closes (backend serializes writers anyway)
    Queue,
    /// Fail immediately with a `TransactionState` error
    FailFast,
}

/// Held while a transaction scope is open
pub type ScopePermit = OwnedMutexGuard<()>;

/// Per-adapter gate serializing transaction scopes
///
/// Clones share the same gate, so every clone of an adapter sees the same scope state.
#[derive(Debug, Clone)]
pub struct TransactionGate {
    id: u64,
    backend: &'static str,
    policy: ConcurrencyPolicy,
    lock: Arc<Mutex<()>>,
}

impl TransactionGate {
    /// Create a gate for one adapter instance
    pub fn new(backend: &'static str, policy: ConcurrencyPolicy) -> Self {
        Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            policy,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Concurrency policy of this gate
    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    /// Whether the current task is running inside a scope of this gate
    pub fn in_scope(&self) -> bool {
        OPEN_SCOPES
            .try_with(|ids| ids.contains(&self.id))
            .unwrap_or(false)
    }

    /// Whether any task currently holds a scope on this gate
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Open a scope
    ///
    /// # Errors
    ///
    /// - `TransactionState` when called from inside a scope of the same gate
    /// - `TransactionState` when another scope is open and the policy is `FailFast`
    pub async fn enter(&self) -> Result<ScopePermit> {
        if self.in_scope() {
            return Err(BridgeError::transaction_state(format!(
                "nested transaction scope on {} is not allowed",
                self.backend
            )));
        }

        match self.policy {
            ConcurrencyPolicy::Queue => Ok(Arc::clone(&self.lock).lock_owned().await),
            ConcurrencyPolicy::FailFast => {
                Arc::clone(&self.lock).try_lock_owned().map_err(|_| {
                    BridgeError::transaction_state(format!(
                        "a transaction scope is already open on {}",
                        self.backend
                    ))
                })
            }
        }
    }

    /// Run `fut` as the body of a scope of this gate
    ///
    /// Calls to [`enter`](Self::enter) made while `fut` runs on this task are rejected.
    pub async fn scoped<F: Future>(&self, fut: F) -> F::Output {
        let mut ids = OPEN_SCOPES.try_with(|ids| ids.clone()).unwrap_or_default();
        ids.push(self.id);
        OPEN_SCOPES.scope(ids, fut).await
    }

    /// Wait for any scope opened by another task to close
    ///
    /// Returns `None` inside a scope of this gate (the operation belongs to the scope),
    /// otherwise a permit that keeps new scopes out until the operation finishes.
    pub async fn pass(&self) -> Option<ScopePermit> {
        if self.in_scope() {
            None
        } else {
            Some(Arc::clone(&self.lock).lock_owned().await)
        }
    }
}

/// Lifecycle of a transaction scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Operations may still be issued
    Open,
    /// All operations were committed
    Committed,
    /// All operations were discarded
    RolledBack,
}

/// Tracks one scope and enforces that it closes exactly once
#[derive(Debug)]
pub struct ScopeTracker {
    state: AtomicU8,
}

impl ScopeTracker {
    const OPEN: u8 = 0;
    const COMMITTED: u8 = 1;
    const ROLLED_BACK: u8 = 2;

    /// A freshly opened scope
    pub fn open() -> Self {
        Self {
            state: AtomicU8::new(Self::OPEN),
        }
    }

    /// Current state
    pub fn state(&self) -> ScopeState {
        match self.state.load(Ordering::Acquire) {
            Self::OPEN => ScopeState::Open,
            Self::COMMITTED => ScopeState::Committed,
            _ => ScopeState::RolledBack,
        }
    }

    /// Fail unless the scope is still open
    pub fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ScopeState::Open => Ok(()),
            ScopeState::Committed => Err(BridgeError::transaction_state(
                "scope has already been committed",
            )),
            ScopeState::RolledBack => Err(BridgeError::transaction_state(
                "scope has already been rolled back",
            )),
        }
    }

    /// Close the scope as committed
    pub fn mark_committed(&self) -> Result<()> {
        self.close(Self::COMMITTED)
    }

    /// Close the scope as rolled back
    pub fn mark_rolled_back(&self) -> Result<()> {
        self.close(Self::ROLLED_BACK)
    }

    fn close(&self, to: u8) -> Result<()> {
        self.state
            .compare_exchange(Self::OPEN, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                BridgeError::transaction_state(match to {
                    Self::COMMITTED => "cannot commit a closed scope",
                    _ => "cannot roll back a closed scope",
                })
            })
    }
}

/// Apply operations one by one, stopping at the first failure
///
/// This is the best-effort path for backends without native transactions: nothing is
/// rolled back. On failure the error is `BatchAborted`, carrying the failing index and the
/// outcomes of every operation applied before it.
pub async fn run_sequential<Op, F, Fut>(operations: Vec<Op>, mut apply: F) -> Result<Vec<Outcome>>
where
    F: FnMut(Op) -> Fut,
    Fut: Future<Output = Result<Outcome>>,
{
    let mut completed = Vec::with_capacity(operations.len());
    for (index, op) in operations.into_iter().enumerate() {
        match apply(op).await {
            Ok(outcome) => completed.push(outcome),
            Err(source) => {
                tracing::warn!(index, applied = completed.len(), "best-effort batch aborted");
                return Err(BridgeError::BatchAborted {
                    index,
                    completed,
                    source: Box::new(source),
                });
            }
        }
    }
    Ok(completed)
}
