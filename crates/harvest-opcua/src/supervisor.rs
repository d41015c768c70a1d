// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session liveness supervision.
//!
//! [`ReconnectSupervisor`] owns the reconnect state machine of one connected
//! session. Keep-alive signals arrive on protocol threads; a bad status moves
//! the machine to `RECONNECTING` and spawns exactly one attempt identified by
//! a token. The attempt's completion is applied only if its token is still
//! the outstanding one.
//!
//! ```text
//!              bad keep-alive                 completion(token == current)
//!   HEALTHY ───────────────────► RECONNECTING ────────────────────────────► HEALTHY
//!      │                           │   ▲  │
//!      │                           │   └──┘ attempt failed: re-arm after grace
//!      │ close()                   │ close()
//!      ▼                           ▼
//!   CLOSED ◄────────────────────────
//! ```
//!
//! The active session and its subscription live together in a
//! [`SessionSlot`] and are replaced as a unit, so readers never observe a
//! half-swapped pair.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::{KeepAliveObserver, OpcUaSession, OpcUaTransport, SessionId, StatusCode};
use crate::error::{ConfigurationError, OpcUaResult};
use crate::subscription::Subscription;

// =============================================================================
// Session slot
// =============================================================================

/// The session and subscription currently in use.
pub struct ActiveSession {
    /// Live session.
    pub session: Arc<dyn OpcUaSession>,
    /// Subscription created on the session, once discovery has finished.
    pub subscription: Option<Arc<Subscription>>,
}

impl ActiveSession {
    /// Wraps a freshly created session without a subscription.
    pub fn new(session: Arc<dyn OpcUaSession>) -> Self {
        Self {
            session,
            subscription: None,
        }
    }

    /// Returns a copy carrying `subscription`.
    pub fn with_subscription(&self, subscription: Arc<Subscription>) -> Self {
        Self {
            session: self.session.clone(),
            subscription: Some(subscription),
        }
    }
}

impl fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSession")
            .field("session", &self.session.id())
            .field("subscription", &self.subscription.as_ref().map(|s| s.id()))
            .finish()
    }
}

/// Atomically swappable slot holding the active session.
pub type SessionSlot = ArcSwapOption<ActiveSession>;

// =============================================================================
// State
// =============================================================================

/// Reconnect state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// The session is alive.
    #[default]
    Healthy,
    /// An attempt identified by `token` is outstanding.
    Reconnecting {
        /// Identity of the outstanding attempt.
        token: u64,
    },
    /// Supervision ended.
    Closed,
}

impl SupervisorState {
    /// Returns `true` while an attempt is outstanding.
    #[inline]
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting { .. })
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Reconnecting { .. } => write!(f, "RECONNECTING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Result of applying a reconnect completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The new session replaced the old one.
    Applied,
    /// The token no longer matched the outstanding attempt.
    Stale,
    /// The attempt failed; the machine stays in `RECONNECTING`.
    Failed,
}

/// Snapshot of reconnect counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectStats {
    /// Bad keep-alives that started an attempt.
    pub triggers: u64,
    /// Bad keep-alives received while an attempt was outstanding.
    pub duplicate_triggers: u64,
    /// Attempts that replaced the session.
    pub completed: u64,
    /// Attempts that failed at the protocol layer.
    pub failed: u64,
    /// Completions discarded because their token was stale.
    pub stale: u64,
}

#[derive(Default)]
struct ReconnectCounters {
    triggers: AtomicU64,
    duplicate_triggers: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
}

impl ReconnectCounters {
    fn snapshot(&self) -> ReconnectStats {
        ReconnectStats {
            triggers: self.triggers.load(Ordering::Relaxed),
            duplicate_triggers: self.duplicate_triggers.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// ReconnectSupervisor
// =============================================================================

/// Drives at most one reconnection attempt at a time for a session slot.
pub struct ReconnectSupervisor {
    transport: Arc<dyn OpcUaTransport>,
    slot: Arc<SessionSlot>,
    grace_period: Duration,
    state: Mutex<SupervisorState>,
    next_token: AtomicU64,
    state_tx: watch::Sender<SupervisorState>,
    cancel: CancellationToken,
    runtime: Handle,
    counters: ReconnectCounters,
    this: Weak<Self>,
}

impl ReconnectSupervisor {
    /// Creates a supervisor for `slot`.
    ///
    /// Must be called from within a Tokio runtime; attempts are spawned on
    /// it even when keep-alives arrive on foreign threads.
    pub fn new(
        transport: Arc<dyn OpcUaTransport>,
        slot: Arc<SessionSlot>,
        grace_period: Duration,
    ) -> OpcUaResult<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|e| ConfigurationError::NoRuntime {
            reason: e.to_string(),
        })?;
        let (state_tx, _) = watch::channel(SupervisorState::Healthy);

        Ok(Arc::new_cyclic(|this| Self {
            transport,
            slot,
            grace_period,
            state: Mutex::new(SupervisorState::Healthy),
            next_token: AtomicU64::new(1),
            state_tx,
            cancel: CancellationToken::new(),
            runtime,
            counters: ReconnectCounters::default(),
            this: this.clone(),
        }))
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ReconnectStats {
        self.counters.snapshot()
    }

    /// Keep-alive observer to install on supervised sessions.
    ///
    /// The observer holds the supervisor weakly so a session never keeps
    /// its own supervisor alive.
    pub fn observer(&self) -> Arc<dyn KeepAliveObserver> {
        Arc::new(SupervisorObserver {
            supervisor: self.this.clone(),
        })
    }

    /// Handles one keep-alive signal. Never blocks on reconnection.
    pub fn on_keep_alive(&self, session_id: SessionId, status: StatusCode) {
        let current = self.slot.load();
        let is_current = current
            .as_ref()
            .is_some_and(|active| active.session.id() == session_id);
        if !is_current {
            trace!(session = %session_id, "Keep-alive from a superseded session ignored");
            return;
        }
        if status.is_good() {
            return;
        }

        let mut state = self.state.lock();
        match *state {
            SupervisorState::Healthy => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                *state = SupervisorState::Reconnecting { token };
                drop(state);

                self.counters.triggers.fetch_add(1, Ordering::Relaxed);
                self.state_tx.send_replace(SupervisorState::Reconnecting { token });
                warn!(
                    session = %session_id,
                    status = %status,
                    token,
                    grace_period = ?self.grace_period,
                    "Keep-alive failed, reconnecting"
                );

                if let Some(active) = current.as_ref() {
                    self.spawn_attempt(token, active.session.clone());
                }
            }
            SupervisorState::Reconnecting { token } => {
                self.counters.duplicate_triggers.fetch_add(1, Ordering::Relaxed);
                debug!(session = %session_id, token, "Reconnect already in progress");
            }
            SupervisorState::Closed => {}
        }
    }

    fn spawn_attempt(&self, token: u64, previous: Arc<dyn OpcUaSession>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            this.run_attempt(token, previous).await;
        });
    }

    async fn run_attempt(self: Arc<Self>, token: u64, previous: Arc<dyn OpcUaSession>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(token, "Reconnect attempt cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.grace_period) => {}
            }

            let result = self.transport.reconnect(previous.clone()).await;
            match self.complete(token, result) {
                CompletionOutcome::Failed => continue,
                CompletionOutcome::Applied | CompletionOutcome::Stale => return,
            }
        }
    }

    /// Applies the completion of attempt `token`.
    ///
    /// A completion whose token is not the outstanding one is discarded and
    /// any session it produced is closed in the background.
    pub fn complete(
        &self,
        token: u64,
        result: OpcUaResult<Arc<dyn OpcUaSession>>,
    ) -> CompletionOutcome {
        let mut state = self.state.lock();
        if *state != (SupervisorState::Reconnecting { token }) {
            let observed = *state;
            drop(state);
            self.counters.stale.fetch_add(1, Ordering::Relaxed);
            warn!(token, state = %observed, "Discarding stale reconnect completion");
            if let Ok(orphan) = result {
                self.close_in_background(orphan);
            }
            return CompletionOutcome::Stale;
        }

        match result {
            Ok(session) => {
                let subscription = self
                    .slot
                    .load()
                    .as_ref()
                    .and_then(|active| active.subscription.clone());
                session.set_keep_alive_observer(self.observer());
                let session_id = session.id();
                self.slot.store(Some(Arc::new(ActiveSession {
                    session,
                    subscription,
                })));
                *state = SupervisorState::Healthy;
                drop(state);

                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.state_tx.send_replace(SupervisorState::Healthy);
                info!(session = %session_id, token, "Session re-established");
                CompletionOutcome::Applied
            }
            Err(e) => {
                drop(state);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                e.log("reconnect");
                CompletionOutcome::Failed
            }
        }
    }

    /// Ends supervision and cancels any outstanding attempt.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state == SupervisorState::Closed {
            return;
        }
        *state = SupervisorState::Closed;
        drop(state);

        self.cancel.cancel();
        self.state_tx.send_replace(SupervisorState::Closed);
        debug!("Reconnect supervision closed");
    }

    fn close_in_background(&self, session: Arc<dyn OpcUaSession>) {
        self.runtime.spawn(async move {
            if let Err(e) = session.close().await {
                debug!(session = %session.id(), error = %e, "Closing orphaned session failed");
            }
        });
    }
}

impl fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("transport", &self.transport.display_name())
            .field("state", &self.state())
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

struct SupervisorObserver {
    supervisor: Weak<ReconnectSupervisor>,
}

impl KeepAliveObserver for SupervisorObserver {
    fn on_keep_alive(&self, session_id: SessionId, status: StatusCode) {
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.on_keep_alive(session_id, status);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{MockSession, MockTransport, MockTree};
    use crate::config::SubscriptionSettings;
    use crate::error::{OpcUaError, SessionError};
    use crate::subscription::SubscriptionBuilder;
    use crate::tags::TagBindingTable;

    const GRACE: Duration = Duration::from_millis(10);

    struct Fixture {
        transport: Arc<MockTransport>,
        slot: Arc<SessionSlot>,
        first: Arc<MockSession>,
        supervisor: Arc<ReconnectSupervisor>,
    }

    fn fixture() -> Fixture {
        let transport = MockTransport::new(MockTree::default());
        let first = transport.open_session();
        let slot = Arc::new(SessionSlot::from(Some(Arc::new(ActiveSession::new(
            first.clone() as Arc<dyn OpcUaSession>,
        )))));
        let supervisor = ReconnectSupervisor::new(
            transport.clone() as Arc<dyn OpcUaTransport>,
            slot.clone(),
            GRACE,
        )
        .unwrap();
        first.set_keep_alive_observer(supervisor.observer());
        Fixture {
            transport,
            slot,
            first,
            supervisor,
        }
    }

    fn current_id(slot: &SessionSlot) -> Option<SessionId> {
        slot.load().as_ref().map(|active| active.session.id())
    }

    async fn until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn until_state(supervisor: &ReconnectSupervisor, expected: SupervisorState) {
        let mut rx = supervisor.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == expected))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SupervisorState::Healthy.to_string(), "HEALTHY");
        assert_eq!(
            SupervisorState::Reconnecting { token: 4 }.to_string(),
            "RECONNECTING"
        );
        assert_eq!(SupervisorState::Closed.to_string(), "CLOSED");
        assert!(SupervisorState::Reconnecting { token: 1 }.is_reconnecting());
    }

    #[test]
    fn test_new_outside_runtime() {
        let transport = MockTransport::new(MockTree::default());
        let result = ReconnectSupervisor::new(transport, Arc::new(SessionSlot::empty()), GRACE);
        assert!(matches!(
            result,
            Err(OpcUaError::Configuration(ConfigurationError::NoRuntime { .. }))
        ));
    }

    #[tokio::test]
    async fn test_good_keep_alive_ignored() {
        let f = fixture();
        f.first.keep_alive(StatusCode::GOOD);
        assert_eq!(f.supervisor.state(), SupervisorState::Healthy);
        assert_eq!(f.supervisor.stats(), ReconnectStats::default());
    }

    #[tokio::test]
    async fn test_keep_alive_from_other_session_ignored() {
        let f = fixture();
        let other = f.transport.open_session();
        other.set_keep_alive_observer(f.supervisor.observer());

        other.keep_alive(StatusCode::BAD_COMMUNICATION_ERROR);

        assert_eq!(f.supervisor.state(), SupervisorState::Healthy);
        assert_eq!(f.supervisor.stats().triggers, 0);
    }

    #[tokio::test]
    async fn test_overlapping_triggers_start_one_attempt() {
        let f = fixture();
        f.transport.gate_reconnects();

        f.first.keep_alive(StatusCode::BAD_TIMEOUT);
        f.first.keep_alive(StatusCode::BAD_CONNECTION_CLOSED);
        assert!(f.supervisor.state().is_reconnecting());

        until(|| f.transport.reconnect_calls.load(Ordering::SeqCst) == 1).await;
        f.first.keep_alive(StatusCode::BAD_TIMEOUT);
        tokio::time::sleep(GRACE * 3).await;

        assert_eq!(f.transport.reconnect_calls.load(Ordering::SeqCst), 1);
        let stats = f.supervisor.stats();
        assert_eq!(stats.triggers, 1);
        assert_eq!(stats.duplicate_triggers, 2);

        f.transport.reconnect_gate.notify_one();
        until_state(&f.supervisor, SupervisorState::Healthy).await;
        assert_eq!(f.transport.reconnect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.supervisor.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_successful_reconnect_swaps_session() {
        let f = fixture();
        let bindings = TagBindingTable::build(&[]);
        let settings = SubscriptionSettings::default();
        let listener: Arc<dyn crate::client::DataChangeListener> =
            Arc::new(crate::dispatch::ValueChangeDispatcher::new(
                Arc::new(TagBindingTable::default()),
                Arc::new(crate::dispatch::MeasurementPipeline::new(Arc::new(
                    harvest_core::MemorySink::new(),
                ))),
            ));
        let subscription = SubscriptionBuilder::new(&bindings, &settings)
            .build(Vec::new(), f.first.as_ref(), listener)
            .await
            .unwrap();
        let with_subscription = f
            .slot
            .load_full()
            .unwrap()
            .with_subscription(Arc::new(subscription));
        f.slot.store(Some(Arc::new(with_subscription)));

        f.first.keep_alive(StatusCode::BAD_TIMEOUT);
        until_state(&f.supervisor, SupervisorState::Healthy).await;

        let second = f.transport.session(1);
        assert_eq!(current_id(&f.slot), Some(second.id()));
        assert!(second.has_observer());
        let carried = f.slot.load_full().unwrap();
        assert_eq!(carried.subscription.as_ref().map(|s| s.id()), Some(7));

        // The old session no longer drives the machine.
        f.first.keep_alive(StatusCode::BAD_TIMEOUT);
        assert_eq!(f.supervisor.state(), SupervisorState::Healthy);

        // The new one does.
        f.transport.gate_reconnects();
        second.keep_alive(StatusCode::BAD_TIMEOUT);
        assert!(f.supervisor.state().is_reconnecting());
        assert_eq!(f.supervisor.stats().triggers, 2);
    }

    #[tokio::test]
    async fn test_stale_completion_leaves_session_unchanged() {
        let f = fixture();
        f.transport.gate_reconnects();
        f.first.keep_alive(StatusCode::BAD_TIMEOUT);
        let SupervisorState::Reconnecting { token } = f.supervisor.state() else {
            panic!("expected reconnecting");
        };

        let orphan = f.transport.open_session();
        let outcome = f
            .supervisor
            .complete(token + 1, Ok(orphan.clone() as Arc<dyn OpcUaSession>));

        assert_eq!(outcome, CompletionOutcome::Stale);
        assert_eq!(current_id(&f.slot), Some(f.first.id()));
        assert_eq!(f.supervisor.state(), SupervisorState::Reconnecting { token });
        assert_eq!(f.supervisor.stats().stale, 1);
        until(|| orphan.closed.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_completion_while_healthy_is_stale() {
        let f = fixture();
        let orphan: Arc<dyn OpcUaSession> = f.transport.open_session();
        let outcome = f.supervisor.complete(1, Ok(orphan));
        assert_eq!(outcome, CompletionOutcome::Stale);
        assert_eq!(current_id(&f.slot), Some(f.first.id()));
    }

    #[tokio::test]
    async fn test_failed_attempt_rearms_with_same_token() {
        let f = fixture();
        f.transport.script_reconnects(&[false, false]);

        f.first.keep_alive(StatusCode::BAD_TIMEOUT);
        let initial = f.supervisor.state();
        until_state(&f.supervisor, SupervisorState::Healthy).await;

        assert!(initial.is_reconnecting());
        assert_eq!(f.transport.reconnect_calls.load(Ordering::SeqCst), 3);
        let stats = f.supervisor.stats();
        assert_eq!(stats.triggers, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_failed_completion_keeps_reconnecting() {
        let f = fixture();
        f.transport.gate_reconnects();
        f.first.keep_alive(StatusCode::BAD_TIMEOUT);
        let state = f.supervisor.state();
        let SupervisorState::Reconnecting { token } = state else {
            panic!("expected reconnecting");
        };

        let outcome = f
            .supervisor
            .complete(token, Err(SessionError::reconnect_failed("refused").into()));

        assert_eq!(outcome, CompletionOutcome::Failed);
        assert_eq!(f.supervisor.state(), state);
        assert_eq!(current_id(&f.slot), Some(f.first.id()));
    }

    #[tokio::test]
    async fn test_close_discards_in_flight_completion() {
        let f = fixture();
        f.transport.gate_reconnects();
        f.first.keep_alive(StatusCode::BAD_TIMEOUT);
        until(|| f.transport.reconnect_calls.load(Ordering::SeqCst) == 1).await;

        f.supervisor.close();
        assert_eq!(f.supervisor.state(), SupervisorState::Closed);

        f.transport.reconnect_gate.notify_one();
        until(|| f.supervisor.stats().stale == 1).await;

        assert_eq!(current_id(&f.slot), Some(f.first.id()));
        assert_eq!(f.supervisor.state(), SupervisorState::Closed);
        let produced = f.transport.session(1);
        until(|| produced.closed.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_close_cancels_pending_grace_period() {
        let transport = MockTransport::new(MockTree::default());
        let first = transport.open_session();
        let slot = Arc::new(SessionSlot::from(Some(Arc::new(ActiveSession::new(
            first.clone() as Arc<dyn OpcUaSession>,
        )))));
        let supervisor = ReconnectSupervisor::new(
            transport.clone() as Arc<dyn OpcUaTransport>,
            slot,
            Duration::from_secs(3600),
        )
        .unwrap();
        first.set_keep_alive_observer(supervisor.observer());

        first.keep_alive(StatusCode::BAD_TIMEOUT);
        supervisor.close();
        supervisor.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(transport.reconnect_calls.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.state(), SupervisorState::Closed);

        first.keep_alive(StatusCode::BAD_TIMEOUT);
        assert_eq!(supervisor.stats().triggers, 1);
    }
}
