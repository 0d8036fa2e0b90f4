use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::auth::{AuthError, CallbackOutcome, Flow as AuthFlow, TokenGrant};
use crate::reddit::{OAuthToken, Profile, TokenProvider};
use crate::storage;

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn from_grant(grant: &TokenGrant) -> Self {
        Self {
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone(),
            expires_at: grant.expires_at,
        }
    }

    fn from_stored(stored: storage::StoredSession) -> Self {
        Self {
            access_token: stored.access_token,
            refresh_token: stored.refresh_token,
            expires_at: stored.expires_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehydrateOutcome {
    Restored,
    Refreshed,
    LoggedOut,
    /// Rehydration already ran this process; nothing was read or refreshed.
    Skipped,
}

/// Owns the one live session for this process. Constructed explicitly and
/// passed to whoever needs it; there is no ambient singleton.
pub struct Manager {
    store: Arc<storage::Store>,
    flow: Arc<AuthFlow>,
    current: RwLock<Option<Session>>,
    profile: RwLock<Option<Profile>>,
    rehydrated: AtomicBool,
}

impl Manager {
    pub fn new(store: Arc<storage::Store>, flow: Arc<AuthFlow>) -> Self {
        Self {
            store,
            flow,
            current: RwLock::new(None),
            profile: RwLock::new(None),
            rehydrated: AtomicBool::new(false),
        }
    }

    /// Restores the persisted session once per process start. An expired
    /// access token is never reused: it either refreshes or the whole
    /// session is cleared. Re-entry (a second caller racing the first) is a
    /// guarded no-op.
    pub fn rehydrate(&self) -> Result<RehydrateOutcome> {
        if self.rehydrated.swap(true, Ordering::SeqCst) {
            return Ok(RehydrateOutcome::Skipped);
        }

        let stored = match self.store.load_session()? {
            Some(stored) => Session::from_stored(stored),
            None => return Ok(RehydrateOutcome::LoggedOut),
        };

        let now = Utc::now();
        if !stored.access_token.is_empty() && !stored.expired(now) {
            *self.current.write() = Some(stored);
            return Ok(RehydrateOutcome::Restored);
        }

        let refresh_token = match stored.refresh_token {
            Some(token) if !token.is_empty() => token,
            _ => {
                // Expired with nothing to refresh from.
                self.store.clear_session()?;
                return Ok(RehydrateOutcome::LoggedOut);
            }
        };

        match self.flow.refresh(&refresh_token) {
            Ok(grant) => {
                *self.current.write() = Some(Session::from_grant(&grant));
                info!("session refreshed during rehydration");
                Ok(RehydrateOutcome::Refreshed)
            }
            Err(err) => {
                // A dead refresh token is not retried; force re-auth.
                warn!(error = %err, "session refresh failed, clearing session");
                self.store.clear_session()?;
                *self.current.write() = None;
                Ok(RehydrateOutcome::LoggedOut)
            }
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.current.read().clone()
    }

    pub fn profile(&self) -> Option<Profile> {
        self.profile.read().clone()
    }

    /// Commits a completed callback: session and profile become current.
    pub fn complete_login(&self, outcome: CallbackOutcome) {
        *self.current.write() = Some(Session::from_grant(&outcome.grant));
        *self.profile.write() = Some(outcome.profile);
    }

    pub fn logout(&self) -> Result<()> {
        self.store.clear_session()?;
        *self.current.write() = None;
        *self.profile.write() = None;
        Ok(())
    }

    /// Refreshes the current session in place. On failure the session is
    /// cleared, mirroring the rehydration contract.
    fn refresh_current(&self) -> Result<Session, AuthError> {
        let refresh_token = self
            .current()
            .and_then(|session| session.refresh_token)
            .ok_or(AuthError::MissingCredentials)?;
        match self.flow.refresh(&refresh_token) {
            Ok(grant) => {
                let session = Session::from_grant(&grant);
                *self.current.write() = Some(session.clone());
                Ok(session)
            }
            Err(err) => {
                warn!(error = %err, "mid-session refresh failed, logging out");
                let _ = self.logout();
                Err(err)
            }
        }
    }

    /// Token source for the API client. Hands out the current access token,
    /// refreshing first when it has expired so a stale token never reaches
    /// the wire.
    pub fn token_provider(self: &Arc<Self>) -> Arc<dyn TokenProvider> {
        Arc::new(ManagerTokenSource {
            manager: self.clone(),
        })
    }
}

struct ManagerTokenSource {
    manager: Arc<Manager>,
}

impl TokenProvider for ManagerTokenSource {
    fn token(&self) -> Result<OAuthToken> {
        let session = self
            .manager
            .current()
            .ok_or_else(|| anyhow::anyhow!("no active session"))?;
        let session = if session.expired(Utc::now()) {
            self.manager.refresh_current()?
        } else {
            session
        };
        Ok(OAuthToken {
            access_token: session.access_token,
            expires_at: Some(session.expires_at.into()),
        })
    }
}
