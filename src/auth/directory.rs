//! Directory services consumed by the SSO flow and the access filter.
//!
//! Each concern sits behind its own async trait so deployments can back them
//! with whatever platform services they have. [`StaticDirectory`] implements
//! all of them from the `[directory]` and `[auth]` configuration sections.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ServiceConfig, SsoSettingsConfig, TenantConfig};

/// Scope of platform-wide configuration settings.
pub const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Marketplace not found: {0}")]
    MarketplaceNotFound(String),

    #[error("Directory service unavailable: {0}")]
    Unavailable(String),
}

/// Keys of the platform configuration settings read by the SSO flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigurationKey {
    AuthMode,
    SsoIssuerId,
    SsoIdpUrl,
    SsoIdpAuthenticationRequestHttpMethod,
    SsoSigningKeystorePass,
    SsoSigningKeyAlias,
    SsoSigningKeystore,
    SsoLogoutUrl,
}

impl ConfigurationKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthMode => "AUTH_MODE",
            Self::SsoIssuerId => "SSO_ISSUER_ID",
            Self::SsoIdpUrl => "SSO_IDP_URL",
            Self::SsoIdpAuthenticationRequestHttpMethod => {
                "SSO_IDP_AUTHENTICATION_REQUEST_HTTP_METHOD"
            }
            Self::SsoSigningKeystorePass => "SSO_SIGNING_KEYSTORE_PASS",
            Self::SsoSigningKeyAlias => "SSO_SIGNING_KEY_ALIAS",
            Self::SsoSigningKeystore => "SSO_SIGNING_KEYSTORE",
            Self::SsoLogoutUrl => "SSO_LOGOUT_URL",
        }
    }
}

impl std::fmt::Display for ConfigurationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant and the identity provider settings registered for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub issuer_id: Option<String>,
    pub idp_url: Option<String>,
    pub idp_http_method: Option<String>,
    pub signing_keystore: Option<String>,
    pub signing_key_alias: Option<String>,
    pub signing_keystore_pass: Option<String>,
    pub logout_url: Option<String>,
}

impl From<&TenantConfig> for TenantRecord {
    fn from(tenant: &TenantConfig) -> Self {
        Self {
            tenant_id: tenant.id.clone(),
            issuer_id: tenant.issuer_id.clone(),
            idp_url: tenant.idp_url.clone(),
            idp_http_method: tenant.idp_http_method.clone(),
            signing_keystore: tenant.signing_keystore.clone(),
            signing_key_alias: tenant.signing_key_alias.clone(),
            signing_keystore_pass: tenant.signing_keystore_pass.clone(),
            logout_url: tenant.logout_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketplaceContext {
    pub marketplace_id: String,
    pub restricted: bool,
    pub has_public_landing_page: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDetails {
    pub user_id: String,
    pub organization_id: String,
}

/// Platform configuration settings.
#[async_trait]
pub trait ConfigurationService: Send + Sync {
    async fn get_setting(
        &self,
        key: ConfigurationKey,
        scope: &str,
    ) -> Result<Option<String>, DirectoryError>;
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Fails with [`DirectoryError::TenantNotFound`] for unknown tenants.
    async fn find_tenant(&self, tenant_id: &str) -> Result<TenantRecord, DirectoryError>;
}

#[async_trait]
pub trait MarketplaceDirectory: Send + Sync {
    async fn get_marketplace(
        &self,
        marketplace_id: &str,
    ) -> Result<MarketplaceContext, DirectoryError>;
}

#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn organization_has_access(
        &self,
        organization_id: &str,
        marketplace_id: &str,
    ) -> Result<bool, DirectoryError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserDetails>, DirectoryError>;
}

struct MarketplaceEntry {
    context: MarketplaceContext,
    organizations: HashSet<String>,
}

/// Directory backed by the service configuration.
pub struct StaticDirectory {
    settings: HashMap<ConfigurationKey, String>,
    tenants: HashMap<String, TenantRecord>,
    marketplaces: HashMap<String, MarketplaceEntry>,
    users: HashMap<String, UserDetails>,
}

impl StaticDirectory {
    pub fn from_config(config: &ServiceConfig) -> Self {
        let mut settings = global_settings(&config.auth.sso);
        settings.insert(
            ConfigurationKey::AuthMode,
            config.auth.mode.as_setting().to_string(),
        );

        let tenants = config
            .directory
            .tenants
            .iter()
            .map(|tenant| (tenant.id.clone(), TenantRecord::from(tenant)))
            .collect();

        let marketplaces = config
            .directory
            .marketplaces
            .iter()
            .map(|mp| {
                let entry = MarketplaceEntry {
                    context: MarketplaceContext {
                        marketplace_id: mp.id.clone(),
                        restricted: mp.restricted,
                        has_public_landing_page: mp.public_landing_page,
                    },
                    organizations: mp.organizations.iter().cloned().collect(),
                };
                (mp.id.clone(), entry)
            })
            .collect();

        let users = config
            .directory
            .users
            .iter()
            .map(|user| {
                let details = UserDetails {
                    user_id: user.id.clone(),
                    organization_id: user.organization_id.clone(),
                };
                (user.id.clone(), details)
            })
            .collect();

        Self {
            settings,
            tenants,
            marketplaces,
            users,
        }
    }
}

fn global_settings(sso: &SsoSettingsConfig) -> HashMap<ConfigurationKey, String> {
    [
        (ConfigurationKey::SsoIssuerId, &sso.issuer_id),
        (ConfigurationKey::SsoIdpUrl, &sso.idp_url),
        (
            ConfigurationKey::SsoIdpAuthenticationRequestHttpMethod,
            &sso.idp_http_method,
        ),
        (ConfigurationKey::SsoSigningKeystorePass, &sso.signing_keystore_pass),
        (ConfigurationKey::SsoSigningKeyAlias, &sso.signing_key_alias),
        (ConfigurationKey::SsoSigningKeystore, &sso.signing_keystore),
        (ConfigurationKey::SsoLogoutUrl, &sso.logout_url),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.clone().map(|value| (key, value)))
    .collect()
}

#[async_trait]
impl ConfigurationService for StaticDirectory {
    async fn get_setting(
        &self,
        key: ConfigurationKey,
        scope: &str,
    ) -> Result<Option<String>, DirectoryError> {
        if scope != GLOBAL_SCOPE {
            return Ok(None);
        }
        Ok(self.settings.get(&key).cloned())
    }
}

#[async_trait]
impl TenantDirectory for StaticDirectory {
    async fn find_tenant(&self, tenant_id: &str) -> Result<TenantRecord, DirectoryError> {
        self.tenants
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| DirectoryError::TenantNotFound(tenant_id.to_string()))
    }
}

#[async_trait]
impl MarketplaceDirectory for StaticDirectory {
    async fn get_marketplace(
        &self,
        marketplace_id: &str,
    ) -> Result<MarketplaceContext, DirectoryError> {
        self.marketplaces
            .get(marketplace_id)
            .map(|entry| entry.context.clone())
            .ok_or_else(|| DirectoryError::MarketplaceNotFound(marketplace_id.to_string()))
    }
}

#[async_trait]
impl AuthorizationService for StaticDirectory {
    async fn organization_has_access(
        &self,
        organization_id: &str,
        marketplace_id: &str,
    ) -> Result<bool, DirectoryError> {
        let entry = self
            .marketplaces
            .get(marketplace_id)
            .ok_or_else(|| DirectoryError::MarketplaceNotFound(marketplace_id.to_string()))?;
        Ok(!entry.context.restricted || entry.organizations.contains(organization_id))
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserDetails>, DirectoryError> {
        Ok(self.users.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticDirectory {
        let config = ServiceConfig::from_str(
            r#"
            [auth]
            mode = "saml_sp"

            [auth.sso]
            issuer_id = "https://sp.example.com"
            idp_url = "https://idp.example.com/sso"

            [auth.verification]
            idp_certificate = "/etc/marketplace/idp.pem"

            [[directory.tenants]]
            id = "acme"
            issuer_id = "https://sp.example.com/acme"
            idp_url = "https://login.acme.example/saml"
            idp_http_method = "GET"

            [[directory.marketplaces]]
            id = "open"

            [[directory.marketplaces]]
            id = "closed"
            restricted = true
            public_landing_page = true
            organizations = ["org1"]

            [[directory.users]]
            id = "alice"
            organization_id = "org1"
        "#,
        )
        .unwrap();
        StaticDirectory::from_config(&config)
    }

    #[tokio::test]
    async fn test_global_settings() {
        let directory = directory();

        assert_eq!(
            directory
                .get_setting(ConfigurationKey::AuthMode, GLOBAL_SCOPE)
                .await
                .unwrap()
                .as_deref(),
            Some("SAML_SP")
        );
        assert_eq!(
            directory
                .get_setting(ConfigurationKey::SsoIdpUrl, GLOBAL_SCOPE)
                .await
                .unwrap()
                .as_deref(),
            Some("https://idp.example.com/sso")
        );
        assert_eq!(
            directory
                .get_setting(ConfigurationKey::SsoLogoutUrl, GLOBAL_SCOPE)
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            directory
                .get_setting(ConfigurationKey::SsoIdpUrl, "acme")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_find_tenant() {
        let directory = directory();

        let tenant = directory.find_tenant("acme").await.unwrap();
        assert_eq!(tenant.idp_url.as_deref(), Some("https://login.acme.example/saml"));
        assert_eq!(tenant.idp_http_method.as_deref(), Some("GET"));

        let err = directory.find_tenant("nope").await.unwrap_err();
        assert!(matches!(err, DirectoryError::TenantNotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_marketplaces_and_access() {
        let directory = directory();

        let closed = directory.get_marketplace("closed").await.unwrap();
        assert!(closed.restricted);
        assert!(closed.has_public_landing_page);
        assert!(!directory.get_marketplace("open").await.unwrap().restricted);
        assert!(matches!(
            directory.get_marketplace("missing").await,
            Err(DirectoryError::MarketplaceNotFound(_))
        ));

        assert!(directory.organization_has_access("org1", "closed").await.unwrap());
        assert!(!directory.organization_has_access("org2", "closed").await.unwrap());
        assert!(directory.organization_has_access("org2", "open").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_user() {
        let directory = directory();

        let alice = directory.find_user("alice").await.unwrap().unwrap();
        assert_eq!(alice.organization_id, "org1");
        assert!(directory.find_user("bob").await.unwrap().is_none());
    }

    #[test]
    fn test_configuration_key_names() {
        assert_eq!(ConfigurationKey::AuthMode.to_string(), "AUTH_MODE");
        assert_eq!(
            ConfigurationKey::SsoIdpAuthenticationRequestHttpMethod.as_str(),
            "SSO_IDP_AUTHENTICATION_REQUEST_HTTP_METHOD"
        );
    }
}
