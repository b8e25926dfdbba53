//! Browser sessions for the SSO flow.
//!
//! The session carries the marketplace in context, the tenant and request ID
//! of an SSO attempt in flight, and the authenticated user. Browsers hold only
//! a random session ID in a cookie.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_cookies::{
    Cookie, Cookies,
    cookie::{SameSite as CookieSameSite, time::Duration as CookieDuration},
};
use uuid::Uuid;

use crate::config::{SameSite, SessionConfig};

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSession {
    pub id: Uuid,
    /// Marketplace selected with the `mId` request parameter.
    pub marketplace_id: Option<String>,
    /// Tenant of the SSO attempt in flight.
    pub tenant_id: Option<String>,
    /// ID of the last `AuthnRequest` sent, matched against `InResponseTo`.
    pub request_id: Option<String>,
    /// Encoded `AuthnRequest` waiting to be posted by the POST-include page.
    pub pending_request: Option<String>,
    /// Where to send the user after a successful login.
    pub relay_state: Option<String>,
    /// Authenticated user.
    pub user_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl WebSession {
    pub fn new(ttl: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            marketplace_id: None,
            tenant_id: None,
            request_id: None,
            pending_request: None,
            relay_state: None,
            user_id: None,
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Marketplace ID, ignoring blank values.
    pub fn marketplace(&self) -> Option<&str> {
        non_blank(self.marketplace_id.as_deref())
    }

    pub fn user(&self) -> Option<&str> {
        non_blank(self.user_id.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns `None` for unknown and expired sessions.
    async fn load(&self, id: Uuid) -> SessionResult<Option<WebSession>>;

    async fn save(&self, session: &WebSession) -> SessionResult<()>;

    async fn delete(&self, id: Uuid) -> SessionResult<()>;

    /// Drop expired sessions.
    async fn cleanup(&self) -> SessionResult<usize>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Session Store
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory session store.
///
/// Sessions are lost on restart and not shared across nodes.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, WebSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: Uuid) -> SessionResult<Option<WebSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id).filter(|s| !s.is_expired()).cloned())
    }

    async fn save(&self, session: &WebSession) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&id);
        Ok(())
    }

    async fn cleanup(&self) -> SessionResult<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired());
        Ok(before - sessions.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cookie binding
// ─────────────────────────────────────────────────────────────────────────────

/// Upper bound for configured lifetimes: one year.
const MAX_SESSION_SECS: u64 = 365 * 24 * 60 * 60;

fn lifetime_secs(config: &SessionConfig) -> i64 {
    config.duration_secs.min(MAX_SESSION_SECS) as i64
}

fn ttl(config: &SessionConfig) -> Duration {
    Duration::seconds(lifetime_secs(config))
}

/// The session named by the request's cookie, or a fresh one if the cookie
/// is missing, malformed, unknown or expired. Fresh sessions are not stored
/// until [`persist`] is called.
pub async fn load_or_create(
    store: &dyn SessionStore,
    cookies: &Cookies,
    config: &SessionConfig,
) -> SessionResult<WebSession> {
    if let Some(cookie) = cookies.get(&config.cookie_name)
        && let Ok(id) = cookie.value().parse::<Uuid>()
        && let Some(session) = store.load(id).await?
    {
        return Ok(session);
    }
    Ok(WebSession::new(ttl(config)))
}

/// Extend the session's lifetime, store it and point the cookie at it.
pub async fn persist(
    store: &dyn SessionStore,
    cookies: &Cookies,
    config: &SessionConfig,
    session: &mut WebSession,
) -> SessionResult<()> {
    session.expires_at = Utc::now() + ttl(config);
    store.save(session).await?;
    cookies.add(session_cookie(config, session.id));
    Ok(())
}

/// Move the session to a fresh ID and drop the old one from the store.
///
/// Must run whenever the session gains privileges, so an ID planted before
/// login never names an authenticated session. [`persist`] then points the
/// cookie at the new ID.
pub async fn renew_id(store: &dyn SessionStore, session: &mut WebSession) -> SessionResult<()> {
    store.delete(session.id).await?;
    session.id = Uuid::new_v4();
    Ok(())
}

fn session_cookie(config: &SessionConfig, id: Uuid) -> Cookie<'static> {
    let same_site = match config.same_site {
        SameSite::Strict => CookieSameSite::Strict,
        SameSite::Lax => CookieSameSite::Lax,
        SameSite::None => CookieSameSite::None,
    };
    Cookie::build((config.cookie_name.clone(), id.to_string()))
        .path("/")
        .http_only(true)
        .secure(config.secure)
        .same_site(same_site)
        .max_age(CookieDuration::seconds(lifetime_secs(config)))
        .build()
}
