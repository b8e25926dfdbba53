use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::auth::AuthenticationMode;

/// Authentication configuration.
///
/// ```toml
/// [auth]
/// mode = "saml_sp"
///
/// [auth.sso]
/// issuer_id = "https://marketplace.example.com"
/// idp_url = "https://idp.example.com/sso"
/// idp_http_method = "POST"
/// signing_keystore = "/etc/marketplace/sp.p12"
/// signing_keystore_pass = "${SP_KEYSTORE_PASS}"
///
/// [auth.verification]
/// idp_certificate = "/etc/marketplace/idp.pem"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// `internal` (local login) or `saml_sp` (identity provider login).
    #[serde(default)]
    pub mode: AuthenticationMode,

    /// Global SSO settings, used when a request carries no tenant.
    #[serde(default)]
    pub sso: SsoSettingsConfig,

    /// Marketplace access filter.
    #[serde(default)]
    pub filter: AccessFilterConfig,

    /// Redirect targets produced by the filter and the SAML endpoints.
    #[serde(default)]
    pub redirects: RedirectConfig,

    /// Session cookie.
    #[serde(default)]
    pub session: SessionConfig,

    /// Outbound request signing.
    #[serde(default)]
    pub signing: SigningConfig,

    /// Inbound response verification.
    #[serde(default)]
    pub verification: VerificationConfig,
}

impl AuthConfig {
    pub fn is_saml_sp(&self) -> bool {
        self.mode == AuthenticationMode::SamlSp
    }
}

/// SSO settings of one scope: the global defaults or a single tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SsoSettingsConfig {
    /// Issuer identifier placed in outbound `AuthnRequest`s.
    #[serde(default)]
    pub issuer_id: Option<String>,

    /// Identity provider login endpoint.
    #[serde(default)]
    pub idp_url: Option<String>,

    /// `GET` selects the HTTP-Redirect binding, anything else HTTP-POST.
    #[serde(default)]
    pub idp_http_method: Option<String>,

    /// PKCS#12 keystore or PEM bundle holding the signing key.
    #[serde(default)]
    pub signing_keystore: Option<String>,

    #[serde(default)]
    pub signing_key_alias: Option<String>,

    #[serde(default)]
    pub signing_keystore_pass: Option<String>,

    /// Where the identity provider expects users to be sent on logout.
    #[serde(default)]
    pub logout_url: Option<String>,
}

/// Marketplace access filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessFilterConfig {
    /// Request paths fully matching this pattern bypass the filter.
    #[serde(default = "default_exclude_url_pattern")]
    pub exclude_url_pattern: String,
}

impl Default for AccessFilterConfig {
    fn default() -> Self {
        Self {
            exclude_url_pattern: default_exclude_url_pattern(),
        }
    }
}

fn default_exclude_url_pattern() -> String {
    concat!(
        r"(.*/img/.*|.*/css/.*|.*/fonts/.*|.*/scripts/.*|^/slogout\.jsf|^/public/.*",
        r"|^/saml2/.*|^/health|^/marketplace/terms/.*",
        r"|^/marketplace/index\.jsf|^/marketplace/insufficientAuthorities\.jsf",
        r"|^/marketplace/logout\.jsf)"
    )
    .to_string()
}

/// Redirect targets. All are site-relative paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectConfig {
    #[serde(default = "default_saml_sp_redirect_page")]
    pub saml_sp_redirect_page: String,

    #[serde(default = "default_saml_post_include_page")]
    pub saml_post_include_page: String,

    #[serde(default = "default_insufficient_auth_url")]
    pub insufficient_auth_url: String,

    #[serde(default = "default_marketplace_start_url")]
    pub marketplace_start_url: String,

    /// Error page used when no marketplace is in context.
    #[serde(default = "default_error_page")]
    pub error_page: String,

    /// Error page used when a marketplace is in context.
    #[serde(default = "default_marketplace_error_page")]
    pub marketplace_error_page: String,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            saml_sp_redirect_page: default_saml_sp_redirect_page(),
            saml_post_include_page: default_saml_post_include_page(),
            insufficient_auth_url: default_insufficient_auth_url(),
            marketplace_start_url: default_marketplace_start_url(),
            error_page: default_error_page(),
            marketplace_error_page: default_marketplace_error_page(),
        }
    }
}

fn default_saml_sp_redirect_page() -> String {
    "/saml2/redirectToIdp.jsf".to_string()
}

fn default_saml_post_include_page() -> String {
    "/saml2/saml2PostInclude.jsf".to_string()
}

fn default_insufficient_auth_url() -> String {
    "/marketplace/insufficientAuthorities.jsf".to_string()
}

fn default_marketplace_start_url() -> String {
    "/marketplace/index.jsf".to_string()
}

fn default_error_page() -> String {
    crate::auth::DEFAULT_ERROR_PAGE.to_string()
}

fn default_marketplace_error_page() -> String {
    "/marketplace/logout.jsf".to_string()
}

/// Session cookie configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Cookie name.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Idle session lifetime in seconds.
    #[serde(default = "default_session_duration")]
    pub duration_secs: u64,

    /// Secure cookie (HTTPS only).
    #[serde(default)]
    pub secure: bool,

    /// SameSite cookie attribute. The HTTP-POST response from the identity
    /// provider is a cross-site POST, which only carries the cookie with
    /// `none` (and `secure = true`).
    #[serde(default)]
    pub same_site: SameSite,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            duration_secs: default_session_duration(),
            secure: false,
            same_site: SameSite::default(),
        }
    }
}

fn default_cookie_name() -> String {
    "MPSSO_SESSION".to_string()
}

fn default_session_duration() -> u64 {
    30 * 60 // 30 minutes
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

/// Outbound `AuthnRequest` signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningConfig {
    /// Sign requests when the resolved settings name a keystore.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Publish the raw public key in `KeyInfo` when the keystore holds no
    /// certificate.
    #[serde(default)]
    pub embed_key_value: bool,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            embed_key_value: false,
        }
    }
}

/// Inbound SAML response checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerificationConfig {
    /// Trusted identity provider certificate (PEM or DER). Every response
    /// must carry a valid signature from this certificate.
    #[serde(default)]
    pub idp_certificate: Option<PathBuf>,

    /// Accept unsigned responses when no certificate is configured. Anyone
    /// able to post to the assertion consumer can then log in as any user;
    /// only for test deployments.
    #[serde(default)]
    pub allow_unsigned_responses: bool,

    /// Reject responses whose `InResponseTo` does not match the request ID
    /// stored in the session.
    #[serde(default = "default_true")]
    pub check_in_response_to: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            idp_certificate: None,
            allow_unsigned_responses: false,
            check_in_response_to: true,
        }
    }
}

fn default_true() -> bool {
    true
}
