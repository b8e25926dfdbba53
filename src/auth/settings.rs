//! Per-tenant SSO settings resolution.
//!
//! A request without a tenant uses the platform-wide `SSO_*` settings. A
//! request naming a tenant uses only that tenant's registered settings; there
//! is no fallback to the global values for fields the tenant leaves unset.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    Binding, SsoError,
    directory::{
        ConfigurationKey, ConfigurationService, DirectoryError, GLOBAL_SCOPE, TenantDirectory,
        TenantRecord,
    },
};

/// How users of the platform authenticate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationMode {
    /// Users log in against the platform's own user store.
    #[default]
    #[serde(alias = "INTERNAL")]
    Internal,
    /// Users log in at a SAML identity provider.
    #[serde(alias = "SAML_SP")]
    SamlSp,
}

impl AuthenticationMode {
    /// Value stored under the `AUTH_MODE` configuration key.
    pub fn as_setting(self) -> &'static str {
        match self {
            Self::Internal => "INTERNAL",
            Self::SamlSp => "SAML_SP",
        }
    }

    pub fn from_setting(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INTERNAL" => Some(Self::Internal),
            "SAML_SP" => Some(Self::SamlSp),
            _ => None,
        }
    }

    pub fn is_saml_sp(self) -> bool {
        self == Self::SamlSp
    }
}

/// Resolved SSO settings of one tenant, or of the platform when no tenant is
/// given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantAuthSettings {
    /// `None` for the global settings.
    pub tenant_id: Option<String>,
    pub issuer: Option<String>,
    pub idp_url: Option<String>,
    /// Lower-cased `scheme//host/first-segment` prefix of the IdP URL.
    pub idp_url_context_root: Option<String>,
    pub idp_http_method: Option<String>,
    pub signing_keystore: Option<String>,
    pub signing_key_alias: Option<String>,
    pub signing_keystore_pass: Option<String>,
    pub logout_url: Option<String>,
}

impl TenantAuthSettings {
    fn from_record(record: TenantRecord) -> Self {
        Self {
            idp_url_context_root: record.idp_url.as_deref().and_then(context_root),
            tenant_id: Some(record.tenant_id),
            issuer: record.issuer_id,
            idp_url: record.idp_url,
            idp_http_method: record.idp_http_method,
            signing_keystore: record.signing_keystore,
            signing_key_alias: record.signing_key_alias,
            signing_keystore_pass: record.signing_keystore_pass,
            logout_url: record.logout_url,
        }
    }

    /// Binding selected by the configured IdP request method.
    pub fn binding(&self) -> Binding {
        Binding::from_http_method(self.idp_http_method.as_deref())
    }

    /// The IdP URL as an absolute URL.
    pub fn idp_endpoint(&self) -> Result<Url, SsoError> {
        let url = self.idp_url.as_deref().unwrap_or_default().trim();
        Url::parse(url).map_err(|source| SsoError::MalformedIdpUrl {
            url: url.to_string(),
            source,
        })
    }

    /// Signing keystore path, if one is configured.
    pub fn keystore_path(&self) -> Option<&str> {
        self.signing_keystore
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
    }
}

/// Lower-cased `scheme//host/first-segment` of a URL, used for prefix
/// matching against mixed-case URLs.
///
/// The URL is split on `/` with empty segments skipped; fewer than three
/// segments yields `None`. The scheme segment keeps its colon, so
/// `HTTPS://Example.COM/Path/more` becomes `https://example.com/path`.
pub fn context_root(idp_url: &str) -> Option<String> {
    let mut tokens = idp_url.split('/').filter(|token| !token.is_empty());
    let (scheme, host, segment) = (tokens.next()?, tokens.next()?, tokens.next()?);
    Some(format!(
        "{}//{}/{}",
        scheme.to_lowercase(),
        host.to_lowercase(),
        segment.to_lowercase()
    ))
}

/// Resolves [`TenantAuthSettings`] and the platform authentication mode.
#[derive(Clone)]
pub struct AuthenticationSettingsResolver {
    configuration: Arc<dyn ConfigurationService>,
    tenants: Arc<dyn TenantDirectory>,
}

impl AuthenticationSettingsResolver {
    pub fn new(
        configuration: Arc<dyn ConfigurationService>,
        tenants: Arc<dyn TenantDirectory>,
    ) -> Self {
        Self {
            configuration,
            tenants,
        }
    }

    /// The `AUTH_MODE` setting. Unset or unrecognized values mean internal
    /// authentication.
    pub async fn mode(&self) -> Result<AuthenticationMode, DirectoryError> {
        let value = self
            .configuration
            .get_setting(ConfigurationKey::AuthMode, GLOBAL_SCOPE)
            .await?;
        Ok(match value.as_deref() {
            None => AuthenticationMode::Internal,
            Some(value) => AuthenticationMode::from_setting(value).unwrap_or_else(|| {
                tracing::warn!(value, "Unrecognized AUTH_MODE setting, using internal");
                AuthenticationMode::Internal
            }),
        })
    }

    /// Settings for `tenant_id`, or the global settings when it is blank.
    pub async fn resolve(&self, tenant_id: Option<&str>) -> Result<TenantAuthSettings, SsoError> {
        match tenant_id.map(str::trim).filter(|id| !id.is_empty()) {
            None => Ok(self.global_settings().await),
            Some(tenant_id) => {
                let record = self.tenants.find_tenant(tenant_id).await.map_err(|e| {
                    tracing::warn!(tenant_id, error = %e, "Tenant lookup failed");
                    SsoError::TenantNotFound(tenant_id.to_string())
                })?;
                Ok(TenantAuthSettings::from_record(record))
            }
        }
    }

    async fn global_settings(&self) -> TenantAuthSettings {
        let idp_url = self.global(ConfigurationKey::SsoIdpUrl).await;
        TenantAuthSettings {
            tenant_id: None,
            issuer: self.global(ConfigurationKey::SsoIssuerId).await,
            idp_url_context_root: idp_url.as_deref().and_then(context_root),
            idp_url,
            idp_http_method: self
                .global(ConfigurationKey::SsoIdpAuthenticationRequestHttpMethod)
                .await,
            signing_keystore_pass: self.global(ConfigurationKey::SsoSigningKeystorePass).await,
            signing_key_alias: self.global(ConfigurationKey::SsoSigningKeyAlias).await,
            signing_keystore: self.global(ConfigurationKey::SsoSigningKeystore).await,
            logout_url: self.global(ConfigurationKey::SsoLogoutUrl).await,
        }
    }

    /// A failed read is treated as unset; the caller fails later on the
    /// missing value with a more specific error.
    async fn global(&self, key: ConfigurationKey) -> Option<String> {
        match self.configuration.get_setting(key, GLOBAL_SCOPE).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to read configuration setting");
                None
            }
        }
    }
}
