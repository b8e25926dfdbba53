//! SAML 2.0 service provider endpoints.
//!
//! - `/saml2/redirectToIdp.jsf` - Generates an AuthnRequest and sends the browser to the IdP
//! - `/saml2/saml2PostInclude.jsf` - Auto-submitting form for the HTTP-POST binding
//! - `/saml2/acs` - Assertion Consumer Service (handles the SAML Response)
//! - `/slogout.jsf` - Local logout, then on to the IdP logout page

use std::path::Path;

use axum::{
    Form,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use quick_xml::escape::escape;
use serde::Deserialize;
use tower_cookies::Cookies;

use crate::{
    AppState,
    auth::{
        AuthnRequestBuilder, Binding, EncodedAuthnRequest, SsoError, TenantAuthSettings,
        WebSession, session,
    },
};

/// Redirect to the error page matching the user's context: the marketplace
/// logout page inside a marketplace, the public error page otherwise.
fn fail(state: &AppState, web_session: Option<&WebSession>, err: SsoError) -> Response {
    let redirects = &state.config.auth.redirects;
    let page = if web_session.and_then(WebSession::marketplace).is_some() {
        &redirects.marketplace_error_page
    } else {
        &redirects.error_page
    };
    err.into_redirect(page)
}

/// Load the request's session, or redirect to the error page.
async fn load_session(state: &AppState, cookies: &Cookies) -> Result<WebSession, Response> {
    session::load_or_create(state.sessions.as_ref(), cookies, &state.config.auth.session)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Session lookup failed");
            Redirect::to(&state.config.auth.redirects.error_page).into_response()
        })
}

async fn store_session(
    state: &AppState,
    cookies: &Cookies,
    web_session: &mut WebSession,
) -> Result<(), Response> {
    session::persist(
        state.sessions.as_ref(),
        cookies,
        &state.config.auth.session,
        web_session,
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Failed to store session");
        Redirect::to(&state.config.auth.redirects.error_page).into_response()
    })
}

/// Whether the original request arrived over HTTPS, directly or through a
/// TLS-terminating proxy.
fn is_secure_request(headers: &HeaderMap, uri: &Uri) -> bool {
    let forwarded_https = headers
        .get("x-forwarded-proto")
        .is_some_and(|proto| proto.as_bytes().eq_ignore_ascii_case(b"https"));
    let scheme_https = uri
        .scheme_str()
        .is_some_and(|s| s.eq_ignore_ascii_case("https"));
    forwarded_https || scheme_https
}

/// Site-relative redirect target, rejecting anything that could leave the site.
fn local_target(target: Option<&str>) -> Option<&str> {
    let target = target?.trim();
    (target.starts_with('/') && !target.starts_with("//") && !target.contains('\\'))
        .then_some(target)
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// AuthnRequest
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RedirectParams {
    #[serde(rename = "tenantID")]
    pub tenant_id: Option<String>,
}

/// Start an SSO attempt.
///
/// The tenant comes from the `tenantID` parameter, falling back to the one
/// remembered in the session. The request ID is kept in the session so the
/// response can be correlated.
#[tracing::instrument(name = "saml.redirect_to_idp", skip_all)]
pub async fn redirect_to_idp(
    State(state): State<AppState>,
    cookies: Cookies,
    headers: HeaderMap,
    uri: Uri,
    Query(params): Query<RedirectParams>,
) -> Response {
    let mut web_session = match load_session(&state, &cookies).await {
        Ok(web_session) => web_session,
        Err(response) => return response,
    };

    let tenant_id = params
        .tenant_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| web_session.tenant_id.clone());

    let (settings, idp_url, encoded) =
        match start_request(&state, tenant_id.as_deref(), is_secure_request(&headers, &uri)).await
        {
            Ok(started) => started,
            Err(err) => return fail(&state, Some(&web_session), err),
        };

    web_session.tenant_id = settings.tenant_id.clone();
    web_session.request_id = Some(encoded.request_id.clone());

    let response = match encoded.binding {
        Binding::HttpRedirect => {
            web_session.pending_request = None;
            found(&encoded.redirect_url(&idp_url, web_session.relay_state.as_deref()))
        }
        Binding::HttpPost => {
            web_session.pending_request = Some(encoded.encoded);
            Redirect::to(&state.config.auth.redirects.saml_post_include_page).into_response()
        }
    };

    if let Err(response) = store_session(&state, &cookies, &mut web_session).await {
        return response;
    }

    tracing::info!(
        tenant_id = ?settings.tenant_id,
        request_id = %encoded.request_id,
        binding = ?encoded.binding,
        "Sending AuthnRequest to identity provider"
    );
    response
}

async fn start_request(
    state: &AppState,
    tenant_id: Option<&str>,
    is_https: bool,
) -> Result<(TenantAuthSettings, String, EncodedAuthnRequest), SsoError> {
    let settings = state.settings.resolve(tenant_id).await?;
    let idp_url = settings.idp_endpoint()?.to_string();

    let identity = match settings.keystore_path() {
        Some(path) if state.config.auth.signing.enabled => Some(
            state
                .identities
                .get_or_load(
                    Path::new(path),
                    settings.signing_key_alias.as_deref(),
                    settings.signing_keystore_pass.as_deref(),
                )
                .await?,
        ),
        _ => None,
    };

    let mut builder = AuthnRequestBuilder::new(settings.binding());
    if let Some(identity) = &identity {
        builder = builder.with_signer(state.signatures.signer(identity));
    }
    let encoded = builder.build(settings.issuer.as_deref().unwrap_or_default(), is_https)?;

    Ok((settings, idp_url, encoded))
}

/// Auto-submitting form posting the pending AuthnRequest to the IdP.
#[tracing::instrument(name = "saml.post_include", skip_all)]
pub async fn post_include(State(state): State<AppState>, cookies: Cookies) -> Response {
    let mut web_session = match load_session(&state, &cookies).await {
        Ok(web_session) => web_session,
        Err(response) => return response,
    };

    let Some(request) = web_session.pending_request.take() else {
        tracing::debug!("No pending AuthnRequest, starting over");
        return Redirect::to(&state.config.auth.redirects.saml_sp_redirect_page).into_response();
    };

    let idp_url = match state
        .settings
        .resolve(web_session.tenant_id.as_deref())
        .await
        .and_then(|settings| settings.idp_endpoint())
    {
        Ok(url) => url,
        Err(err) => return fail(&state, Some(&web_session), err),
    };

    if let Err(response) = store_session(&state, &cookies, &mut web_session).await {
        return response;
    }

    Html(render_post_form(
        idp_url.as_str(),
        &request,
        web_session.relay_state.as_deref(),
    ))
    .into_response()
}

fn render_post_form(action: &str, saml_request: &str, relay_state: Option<&str>) -> String {
    let relay_input = relay_state
        .filter(|r| !r.is_empty())
        .map(|r| {
            format!(
                r#"<input type="hidden" name="RelayState" value="{}"/>"#,
                escape(r)
            )
        })
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Signing in</title></head>
<body onload="document.forms[0].submit()">
<form method="post" action="{action}">
<input type="hidden" name="SAMLRequest" value="{request}"/>
{relay_input}
<noscript><button type="submit">Continue</button></noscript>
</form>
</body>
</html>
"#,
        action = escape(action),
        request = escape(saml_request),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Assertion Consumer Service
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    pub saml_response: Option<String>,
    #[serde(rename = "RelayState")]
    pub relay_state: Option<String>,
}

/// Consume the IdP's response and log the user in.
#[tracing::instrument(name = "saml.acs", skip_all)]
pub async fn acs(
    State(state): State<AppState>,
    cookies: Cookies,
    Form(form): Form<AcsForm>,
) -> Response {
    let mut web_session = match load_session(&state, &cookies).await {
        Ok(web_session) => web_session,
        Err(response) => return response,
    };

    let user_id = match authenticate(&state, &web_session, form.saml_response.as_deref()).await {
        Ok(user_id) => user_id,
        Err(err) => return fail(&state, Some(&web_session), err),
    };

    let target = local_target(form.relay_state.as_deref())
        .or_else(|| local_target(web_session.relay_state.as_deref()))
        .unwrap_or(&state.config.auth.redirects.marketplace_start_url)
        .to_string();

    if let Err(e) = session::renew_id(state.sessions.as_ref(), &mut web_session).await {
        tracing::error!(error = %e, "Failed to renew session ID");
        return Redirect::to(&state.config.auth.redirects.error_page).into_response();
    }
    web_session.user_id = Some(user_id.clone());
    web_session.request_id = None;
    web_session.pending_request = None;
    web_session.relay_state = None;
    if let Err(response) = store_session(&state, &cookies, &mut web_session).await {
        return response;
    }

    tracing::info!(
        user_id = %user_id,
        tenant_id = ?web_session.tenant_id,
        "SAML login succeeded"
    );
    Redirect::to(&target).into_response()
}

/// Decode, check and extract the user from a posted response. The user must
/// be known to the user directory.
async fn authenticate(
    state: &AppState,
    web_session: &WebSession,
    encoded: Option<&str>,
) -> Result<String, SsoError> {
    let extractor = &state.extractor;
    let encoded = encoded
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| SsoError::identity_not_found("no SAMLResponse parameter"))?;
    let document = extractor.parse(&extractor.decode(encoded)?)?;

    if state.config.auth.verification.check_in_response_to
        && let Some(expected) = web_session.request_id.as_deref()
        && extractor.in_response_to(&document) != Some(expected)
    {
        return Err(SsoError::identity_not_found(format!(
            "response does not answer request {expected}"
        )));
    }

    // With a trusted certificate only the signed part of the document counts.
    let scope = match &state.idp_certificate {
        Some(certificate) => {
            let verified = state.signatures.verify(&document, certificate)?;
            document
                .element_at(&verified.path)
                .ok_or_else(|| SsoError::InvalidSignature("signed element vanished".into()))?
        }
        None if state.config.auth.verification.allow_unsigned_responses => {
            tracing::warn!("Accepting unsigned SAML response, no IdP certificate configured");
            &document
        }
        None => {
            return Err(SsoError::InvalidSignature(
                "no identity provider certificate to verify the response".into(),
            ));
        }
    };

    let user_id = extractor.user_id_from_document(scope)?;
    match state.users.find_user(&user_id).await {
        Ok(Some(user)) => Ok(user.user_id),
        Ok(None) => Err(SsoError::identity_not_found(format!(
            "user {user_id} is not registered"
        ))),
        Err(e) => Err(SsoError::identity_not_found_with(
            "user directory lookup failed",
            e,
        )),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logout
// ─────────────────────────────────────────────────────────────────────────────

/// Forget the user and continue to the tenant's IdP logout page, or `/`.
#[tracing::instrument(name = "saml.logout", skip_all)]
pub async fn logout(State(state): State<AppState>, cookies: Cookies) -> Response {
    let mut web_session = match load_session(&state, &cookies).await {
        Ok(web_session) => web_session,
        Err(response) => return response,
    };

    let logout_url = match state.settings.resolve(web_session.tenant_id.as_deref()).await {
        Ok(settings) => settings.logout_url.filter(|url| !url.trim().is_empty()),
        Err(e) => {
            tracing::warn!(error = %e, "Could not resolve logout URL");
            None
        }
    };

    let user_id = web_session.user_id.take();
    web_session.request_id = None;
    web_session.pending_request = None;
    if let Err(response) = store_session(&state, &cookies, &mut web_session).await {
        return response;
    }

    tracing::info!(user_id = ?user_id, "User logged out");
    Redirect::to(logout_url.as_deref().unwrap_or("/")).into_response()
}
