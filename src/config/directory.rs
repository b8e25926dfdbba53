use serde::{Deserialize, Serialize};

/// Statically configured directory data: tenants, marketplaces and users.
///
/// ```toml
/// [[directory.tenants]]
/// id = "acme"
/// issuer_id = "https://marketplace.example.com/acme"
/// idp_url = "https://login.acme.example/saml"
///
/// [[directory.marketplaces]]
/// id = "closed-mp"
/// restricted = true
/// organizations = ["org-1"]
///
/// [[directory.users]]
/// id = "alice"
/// organization_id = "org-1"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,

    #[serde(default)]
    pub marketplaces: Vec<MarketplaceConfig>,

    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl DirectoryConfig {
    pub(super) fn validate(&self) -> Result<(), String> {
        check_unique("tenant", self.tenants.iter().map(|t| t.id.as_str()))?;
        check_unique("marketplace", self.marketplaces.iter().map(|m| m.id.as_str()))?;
        check_unique("user", self.users.iter().map(|u| u.id.as_str()))?;
        Ok(())
    }
}

fn check_unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(format!("directory {kind} with an empty id"));
        }
        if !seen.insert(id) {
            return Err(format!("duplicate directory {kind} id '{id}'"));
        }
    }
    Ok(())
}

/// A tenant with its own identity provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantConfig {
    pub id: String,

    #[serde(default)]
    pub issuer_id: Option<String>,

    #[serde(default)]
    pub idp_url: Option<String>,

    #[serde(default)]
    pub idp_http_method: Option<String>,

    #[serde(default)]
    pub signing_keystore: Option<String>,

    #[serde(default)]
    pub signing_key_alias: Option<String>,

    #[serde(default)]
    pub signing_keystore_pass: Option<String>,

    #[serde(default)]
    pub logout_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketplaceConfig {
    pub id: String,

    /// Only members of `organizations` may browse a restricted marketplace.
    #[serde(default)]
    pub restricted: bool,

    #[serde(default)]
    pub public_landing_page: bool,

    #[serde(default)]
    pub organizations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    pub id: String,
    pub organization_id: String,
}
