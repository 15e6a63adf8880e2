//! Leader-only execution of session-mutating calls

use crate::coordination::LeadershipNotifier;
use crate::error::{Result, SessionError};
use std::future::Future;
use std::sync::Arc;

/// Runs an operation only when this context currently holds the lease.
///
/// The decision is taken once, when `guard` is called. An operation that
/// starts as leader runs to completion even if leadership changes meanwhile.
#[derive(Clone)]
pub struct SessionGate {
    notifier: Arc<LeadershipNotifier>,
}

impl SessionGate {
    pub fn new(notifier: Arc<LeadershipNotifier>) -> Self {
        Self { notifier }
    }

    /// Whether a guarded call would run right now
    pub fn check(&self) -> Result<()> {
        if self.notifier.is_leader() {
            Ok(())
        } else {
            Err(SessionError::NotLeader)
        }
    }

    /// Run `op` if leader, otherwise return `NotLeader` without running it
    pub async fn guard<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Err(e) = self.check() {
            tracing::debug!("Skipping session call: this context is not the leader");
            return Err(e);
        }
        Ok(op().await)
    }

    /// Like [`guard`](Self::guard) for fallible operations
    pub async fn try_guard<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.guard(op).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::LeadershipEvent;
    use crate::peer::{PeerId, PeerRole};
    use chrono::Utc;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn set_leader(notifier: &LeadershipNotifier, leader: bool) {
        let peer_id = PeerId::new();
        let timestamp = Utc::now();
        let event = if leader {
            LeadershipEvent::Acquired { peer_id, timestamp }
        } else {
            LeadershipEvent::Lost {
                peer_id,
                role: PeerRole::Follower,
                holder: None,
                timestamp,
            }
        };
        notifier.publish(event);
    }

    #[tokio::test]
    async fn test_guard_runs_only_for_leader() {
        let notifier = Arc::new(LeadershipNotifier::new(4));
        let gate = SessionGate::new(notifier.clone());
        let calls = AtomicUsize::new(0);

        let result = gate
            .guard(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(result.unwrap_err().is_not_leader());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        set_leader(&notifier, true);
        let value = gate.guard(|| async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_try_guard_flattens_errors() {
        let notifier = Arc::new(LeadershipNotifier::new(4));
        let gate = SessionGate::new(notifier.clone());
        set_leader(&notifier, true);

        let result: Result<()> = gate
            .try_guard(|| async { Err(SessionError::backend("upstream refused")) })
            .await;
        assert!(matches!(result, Err(SessionError::Backend(_))));
    }

    proptest! {
        #[test]
        fn prop_gate_follows_leadership_flag(flags in prop::collection::vec(any::<bool>(), 1..32)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let notifier = Arc::new(LeadershipNotifier::new(64));
            let gate = SessionGate::new(notifier.clone());
            let calls = AtomicUsize::new(0);
            let mut expected = 0;

            for leader in flags {
                set_leader(&notifier, leader);
                let result = runtime.block_on(gate.guard(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                }));
                prop_assert_eq!(result.is_ok(), leader);
                if leader {
                    expected += 1;
                }
            }
            prop_assert_eq!(calls.load(Ordering::SeqCst), expected);
        }
    }
}
