//! Per-conversation request lifecycles
//!
//! At most one request is in flight per conversation. Beginning a new one
//! supersedes the previous request, each request carries a timeout that
//! cancels it and notifies the client, and callers may cancel explicitly.
//! Cancellation is cooperative: holders of the lifecycle's token stop at
//! their next suspension point.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Invoked once when a request times out, before its token is cancelled
pub type TimeoutCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Why a lifecycle stopped being active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Active = 0,
    /// A newer request for the same conversation replaced this one
    Superseded = 1,
    TimedOut = 2,
    /// Stopped by an explicit cancel
    Cancelled = 3,
    /// Finished normally
    Ended = 4,
}

impl LifecycleState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Superseded,
            2 => Self::TimedOut,
            3 => Self::Cancelled,
            _ => Self::Ended,
        }
    }
}

struct LifecycleInner {
    conversation_id: String,
    generation: u64,
    token: CancellationToken,
    state: AtomicU8,
    timeout: Duration,
    deadline: Mutex<Instant>,
    timer: Mutex<Option<JoinHandle<()>>>,
    on_timeout: Option<TimeoutCallback>,
}

/// Handle to one in-flight request
#[derive(Clone)]
pub struct RequestLifecycle {
    inner: Arc<LifecycleInner>,
}

impl RequestLifecycle {
    /// Token cancelled when the request is superseded, times out, or is cancelled
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    /// When the timeout fires unless reset or ended first
    pub fn deadline(&self) -> Instant {
        *self.inner.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    /// Registry-wide sequence number; later requests have higher numbers
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Move from `Active` to `next`; only the first transition wins
    fn transition(&self, next: LifecycleState) -> bool {
        self.inner
            .state
            .compare_exchange(
                LifecycleState::Active as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn abort_timer(&self) {
        if let Some(timer) = self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.abort();
        }
    }

    /// Stop the request on behalf of a terminal transition
    fn stop(&self, next: LifecycleState) -> bool {
        if !self.transition(next) {
            return false;
        }
        self.abort_timer();
        self.inner.token.cancel();
        true
    }
}

impl std::fmt::Debug for RequestLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLifecycle")
            .field("conversation_id", &self.inner.conversation_id)
            .field("generation", &self.inner.generation)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryInner {
    active: DashMap<String, RequestLifecycle>,
    generation: AtomicU64,
}

/// Registry of the current request per conversation
#[derive(Clone, Default)]
pub struct LifecycleRegistry {
    inner: Arc<RegistryInner>,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request for `conversation_id`, superseding any
    /// request already in flight, and arm its timeout
    ///
    /// Must be called within a tokio runtime.
    pub fn begin(
        &self,
        conversation_id: &str,
        timeout: Duration,
        on_timeout: Option<TimeoutCallback>,
    ) -> RequestLifecycle {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let lifecycle = RequestLifecycle {
            inner: Arc::new(LifecycleInner {
                conversation_id: conversation_id.to_owned(),
                generation,
                token: CancellationToken::new(),
                state: AtomicU8::new(LifecycleState::Active as u8),
                timeout,
                deadline: Mutex::new(Instant::now() + timeout),
                timer: Mutex::new(None),
                on_timeout,
            }),
        };

        match self.inner.active.entry(conversation_id.to_owned()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get();
                if previous.stop(LifecycleState::Superseded) {
                    tracing::debug!(
                        conversation_id,
                        generation = previous.generation(),
                        "superseded in-flight request"
                    );
                }
                entry.insert(lifecycle.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(lifecycle.clone());
            }
        }

        self.arm(&lifecycle);
        lifecycle
    }

    /// Push the deadline out by the full timeout without superseding
    pub fn reset_timeout(&self, lifecycle: &RequestLifecycle) {
        if lifecycle.is_active() {
            self.arm(lifecycle);
        }
    }

    /// Finish a request normally
    ///
    /// The registry entry is removed only if it still belongs to this
    /// request.
    pub fn end(&self, lifecycle: &RequestLifecycle) {
        if lifecycle.transition(LifecycleState::Ended) {
            lifecycle.abort_timer();
        }
        self.deregister(lifecycle);
    }

    /// Cancel the in-flight request of a conversation
    ///
    /// Returns whether a request was active.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let Some((_, lifecycle)) = self.inner.active.remove(conversation_id) else {
            return false;
        };

        let cancelled = lifecycle.stop(LifecycleState::Cancelled);
        if cancelled {
            tracing::debug!(conversation_id, generation = lifecycle.generation(), "request cancelled");
        }
        cancelled
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.inner
            .active
            .get(conversation_id)
            .is_some_and(|lifecycle| lifecycle.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    fn deregister(&self, lifecycle: &RequestLifecycle) {
        self.inner.active.remove_if(lifecycle.conversation_id(), |_, current| {
            current.generation() == lifecycle.generation()
        });
    }

    fn arm(&self, lifecycle: &RequestLifecycle) {
        let deadline = Instant::now() + lifecycle.inner.timeout;
        *lifecycle.inner.deadline.lock().unwrap_or_else(PoisonError::into_inner) = deadline;

        let registry = self.clone();
        let handle = lifecycle.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            registry.fire_timeout(&handle).await;
        });

        let previous = lifecycle
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn fire_timeout(&self, lifecycle: &RequestLifecycle) {
        if !lifecycle.transition(LifecycleState::TimedOut) {
            return;
        }

        tracing::warn!(
            conversation_id = %lifecycle.conversation_id(),
            timeout = ?lifecycle.inner.timeout,
            "request timed out"
        );

        if let Some(on_timeout) = &lifecycle.inner.on_timeout {
            on_timeout().await;
        }

        lifecycle.inner.token.cancel();
        self.deregister(lifecycle);
    }
}
