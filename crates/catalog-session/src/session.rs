//! Session calls routed through the leader gate
//!
//! Sign-in, sign-out and profile synchronization mutate the shared
//! authentication session, so only the leading context may issue them.
//! Followers get [`SessionError::NotLeader`] and rely on the leader's
//! effects becoming visible through the shared store.

use crate::error::{Result, SessionError};
use crate::gate::SessionGate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInRequest {
    pub username: String,
    pub password: String,
}

/// Session issued by the authentication backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub id: String,
    pub user_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Remote authentication service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_in(&self, request: SignInRequest) -> Result<AuthSession>;

    async fn sign_out(&self, session_id: &str) -> Result<()>;

    async fn sync_profile(&self, profile: UserProfile) -> Result<()>;
}

/// Issues session calls on behalf of this context when it leads
#[derive(Clone)]
pub struct SessionController {
    gate: SessionGate,
    backend: Arc<dyn AuthBackend>,
}

impl SessionController {
    pub fn new(gate: SessionGate, backend: Arc<dyn AuthBackend>) -> Self {
        Self { gate, backend }
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub async fn sign_in(&self, request: SignInRequest) -> Result<AuthSession> {
        if request.username.is_empty() {
            return Err(SessionError::backend("Username cannot be empty"));
        }

        let username = request.username.clone();
        let session = self
            .gate
            .try_guard(|| self.backend.sign_in(request))
            .await?;

        tracing::info!("Signed in {} (session {})", username, session.id);
        Ok(session)
    }

    pub async fn sign_out(&self, session_id: &str) -> Result<()> {
        self.gate
            .try_guard(|| self.backend.sign_out(session_id))
            .await?;

        tracing::info!("Signed out session {}", session_id);
        Ok(())
    }

    pub async fn sync_profile(&self, profile: UserProfile) -> Result<()> {
        let user_id = profile.user_id.clone();
        self.gate
            .try_guard(|| self.backend.sync_profile(profile))
            .await?;

        tracing::debug!("Synchronized profile for {}", user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{LeadershipEvent, LeadershipNotifier};
    use crate::peer::PeerId;
    use mockall::predicate::eq;

    fn gate(leader: bool) -> SessionGate {
        let notifier = Arc::new(LeadershipNotifier::new(4));
        if leader {
            notifier.publish(LeadershipEvent::Acquired {
                peer_id: PeerId::new(),
                timestamp: Utc::now(),
            });
        }
        SessionGate::new(notifier)
    }

    fn request() -> SignInRequest {
        SignInRequest {
            username: "reader".to_string(),
            password: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_leader_signs_in() {
        let mut backend = MockAuthBackend::new();
        backend
            .expect_sign_in()
            .with(eq(request()))
            .times(1)
            .returning(|request| {
                let now = Utc::now();
                Ok(AuthSession {
                    id: "session-1".to_string(),
                    user_id: request.username,
                    issued_at: now,
                    expires_at: now + chrono::Duration::hours(1),
                })
            });

        let controller = SessionController::new(gate(true), Arc::new(backend));
        let session = controller.sign_in(request()).await.unwrap();
        assert_eq!(session.id, "session-1");
        assert_eq!(session.user_id, "reader");
    }

    #[tokio::test]
    async fn test_follower_never_reaches_backend() {
        let mut backend = MockAuthBackend::new();
        backend.expect_sign_in().times(0);
        backend.expect_sign_out().times(0);
        backend.expect_sync_profile().times(0);

        let controller = SessionController::new(gate(false), Arc::new(backend));
        assert!(controller.sign_in(request()).await.unwrap_err().is_not_leader());
        assert!(controller.sign_out("session-1").await.unwrap_err().is_not_leader());

        let profile = UserProfile {
            user_id: "reader".to_string(),
            display_name: None,
            email: None,
            updated_at: Utc::now(),
        };
        assert!(controller.sync_profile(profile).await.unwrap_err().is_not_leader());
    }

    #[tokio::test]
    async fn test_backend_errors_propagate() {
        let mut backend = MockAuthBackend::new();
        backend
            .expect_sign_out()
            .withf(|session_id| session_id == "expired")
            .times(1)
            .returning(|_| Err(SessionError::backend("session expired")));

        let controller = SessionController::new(gate(true), Arc::new(backend));
        let err = controller.sign_out("expired").await.unwrap_err();
        assert!(matches!(err, SessionError::Backend(_)));
    }

    #[tokio::test]
    async fn test_empty_username_is_rejected() {
        let mut backend = MockAuthBackend::new();
        backend.expect_sign_in().times(0);

        let controller = SessionController::new(gate(true), Arc::new(backend));
        let request = SignInRequest {
            username: String::new(),
            password: "secret".to_string(),
        };
        assert!(controller.sign_in(request).await.is_err());
    }
}
