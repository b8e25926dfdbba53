//! Access filter for closed marketplaces.
//!
//! Every request not matching the exclusion pattern is checked against the
//! marketplace held in the session. Restricted marketplaces admit only users
//! whose organization has been granted access; everyone else is sent to log
//! in or to the insufficient-authorities page.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tower_cookies::Cookies;

use crate::{
    AppState,
    auth::{AuthenticationMode, WebSession, session},
};

/// Query parameter selecting the marketplace.
pub const MARKETPLACE_ID_PARAM: &str = "mId";

/// Where a request stands with respect to the marketplace in context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    Excluded,
    NoMarketplaceContext,
    Unrestricted,
    RestrictedAuthenticated,
    RestrictedUnauthenticated,
    /// A directory lookup failed.
    LookupFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    RedirectToIdp,
    RedirectInsufficientAuth,
    RedirectMarketplaceStart,
}

impl AccessDecision {
    /// Redirect target, `None` for [`AccessDecision::Allow`].
    pub fn target<'a>(&self, state: &'a AppState) -> Option<&'a str> {
        let redirects = &state.config.auth.redirects;
        match self {
            Self::Allow => None,
            Self::RedirectToIdp => Some(&redirects.saml_sp_redirect_page),
            Self::RedirectInsufficientAuth => Some(&redirects.insufficient_auth_url),
            Self::RedirectMarketplaceStart => Some(&redirects.marketplace_start_url),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessOutcome {
    pub state: AccessState,
    pub decision: AccessDecision,
}

impl AccessOutcome {
    fn new(state: AccessState, decision: AccessDecision) -> Self {
        Self { state, decision }
    }

    fn lookup_failed() -> Self {
        Self::new(AccessState::LookupFailed, AccessDecision::RedirectInsufficientAuth)
    }
}

/// Decide what happens to a request for `path` made within `session`.
pub async fn decide(state: &AppState, path: &str, session: &WebSession) -> AccessOutcome {
    if state.exclude_url.is_match(path) {
        return AccessOutcome::new(AccessState::Excluded, AccessDecision::Allow);
    }

    let mode = match state.settings.mode().await {
        Ok(mode) => mode,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read authentication mode");
            return AccessOutcome::lookup_failed();
        }
    };
    let login = match mode {
        AuthenticationMode::SamlSp => AccessDecision::RedirectToIdp,
        AuthenticationMode::Internal => AccessDecision::RedirectMarketplaceStart,
    };

    let Some(marketplace_id) = session.marketplace() else {
        let decision = match mode {
            AuthenticationMode::SamlSp => AccessDecision::RedirectToIdp,
            AuthenticationMode::Internal => AccessDecision::Allow,
        };
        return AccessOutcome::new(AccessState::NoMarketplaceContext, decision);
    };

    let marketplace = match state.marketplaces.get_marketplace(marketplace_id).await {
        Ok(marketplace) => marketplace,
        Err(e) => {
            tracing::warn!(marketplace_id, error = %e, "Marketplace lookup failed");
            return AccessOutcome::lookup_failed();
        }
    };
    if !marketplace.restricted {
        return AccessOutcome::new(AccessState::Unrestricted, AccessDecision::Allow);
    }

    let user = match session.user() {
        None => None,
        Some(user_id) => match state.users.find_user(user_id).await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "User lookup failed");
                return AccessOutcome::lookup_failed();
            }
        },
    };
    let Some(user) = user else {
        return AccessOutcome::new(AccessState::RestrictedUnauthenticated, login);
    };

    match state
        .authorization
        .organization_has_access(&user.organization_id, marketplace_id)
        .await
    {
        Ok(true) => AccessOutcome::new(AccessState::RestrictedAuthenticated, AccessDecision::Allow),
        Ok(false) => AccessOutcome::new(
            AccessState::RestrictedAuthenticated,
            AccessDecision::RedirectInsufficientAuth,
        ),
        Err(e) => {
            tracing::warn!(
                organization_id = %user.organization_id,
                marketplace_id,
                error = %e,
                "Authorization lookup failed"
            );
            AccessOutcome::lookup_failed()
        }
    }
}

/// Marketplace ID from the request's query string, if present and non-blank.
fn marketplace_param(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == MARKETPLACE_ID_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Middleware enforcing [`decide`] on every request.
pub async fn marketplace_access_middleware(
    State(state): State<AppState>,
    cookies: Cookies,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if state.exclude_url.is_match(&path) {
        return next.run(request).await;
    }

    let session_config = &state.config.auth.session;
    let mut web_session =
        match session::load_or_create(state.sessions.as_ref(), &cookies, session_config).await {
            Ok(web_session) => web_session,
            Err(e) => {
                tracing::warn!(error = %e, "Session lookup failed");
                return redirect(&state.config.auth.redirects.insufficient_auth_url);
            }
        };

    let mut dirty = false;
    if let Some(marketplace_id) = marketplace_param(&request) {
        dirty = web_session.marketplace_id.as_deref() != Some(marketplace_id.as_str());
        web_session.marketplace_id = Some(marketplace_id);
    }

    let outcome = decide(&state, &path, &web_session).await;
    tracing::debug!(
        path = %path,
        marketplace_id = ?web_session.marketplace(),
        state = ?outcome.state,
        decision = ?outcome.decision,
        "Marketplace access evaluated"
    );

    if outcome.decision == AccessDecision::RedirectToIdp {
        web_session.relay_state = Some(
            request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| path.clone()),
        );
        dirty = true;
    }

    if dirty
        && let Err(e) = session::persist(
            state.sessions.as_ref(),
            &cookies,
            session_config,
            &mut web_session,
        )
        .await
    {
        tracing::warn!(error = %e, "Failed to store session");
        return redirect(&state.config.auth.redirects.insufficient_auth_url);
    }

    match outcome.decision.target(&state) {
        None => next.run(request).await,
        Some(target) => redirect(target),
    }
}

fn redirect(target: &str) -> Response {
    Redirect::to(target).into_response()
}
