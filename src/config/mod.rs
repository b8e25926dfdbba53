//! Configuration module for the marketplace SSO service.
//!
//! The service is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [auth]
//! mode = "saml_sp"
//!
//! [auth.sso]
//! issuer_id = "https://marketplace.example.com"
//! idp_url = "https://idp.example.com/sso"
//! signing_keystore_pass = "${SP_KEYSTORE_PASS}"
//!
//! [auth.verification]
//! idp_certificate = "/etc/marketplace/idp.pem"
//! ```

mod auth;
mod directory;
mod observability;
mod server;

use std::{path::Path, sync::LazyLock};

pub use auth::*;
pub use directory::*;
pub use observability::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
pub use server::*;

/// Root configuration for the marketplace SSO service.
///
/// All sections are optional with sensible defaults. An empty file runs the
/// service in internal authentication mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Authentication mode, SSO settings, filter and session configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Tenants, marketplaces and users served from configuration.
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Observability configuration (logging).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: ServiceConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.exclude_url_regex()?;

        if self.auth.is_saml_sp()
            && self.auth.sso.idp_url.as_deref().is_none_or(|url| url.trim().is_empty())
            && self.directory.tenants.is_empty()
        {
            return Err(ConfigError::Validation(
                "SAML service provider mode (auth.mode = \"saml_sp\") needs either \
                 auth.sso.idp_url or at least one [[directory.tenants]] entry"
                    .into(),
            ));
        }

        let verification = &self.auth.verification;
        if self.auth.is_saml_sp()
            && verification.idp_certificate.is_none()
            && !verification.allow_unsigned_responses
        {
            return Err(ConfigError::Validation(
                "SAML service provider mode needs auth.verification.idp_certificate to \
                 verify identity provider responses (or allow_unsigned_responses = true \
                 for test deployments)"
                    .into(),
            ));
        }

        self.directory.validate().map_err(ConfigError::Validation)?;

        let redirects = &self.auth.redirects;
        for (name, page) in [
            ("saml_sp_redirect_page", &redirects.saml_sp_redirect_page),
            ("saml_post_include_page", &redirects.saml_post_include_page),
        ] {
            if !page.starts_with('/') || RESERVED_ROUTES.contains(&page.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "auth.redirects.{name} must be a path starting with '/' that does not \
                     clash with a built-in route, got '{page}'"
                )));
            }
        }
        if redirects.saml_sp_redirect_page == redirects.saml_post_include_page {
            return Err(ConfigError::Validation(
                "auth.redirects.saml_sp_redirect_page and saml_post_include_page must differ"
                    .into(),
            ));
        }

        Ok(())
    }

    /// The exclusion pattern compiled to match whole request paths.
    pub fn exclude_url_regex(&self) -> Result<Regex, ConfigError> {
        let pattern = &self.auth.filter.exclude_url_pattern;
        Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            ConfigError::Validation(format!(
                "auth.filter.exclude_url_pattern is not a valid regular expression: {e}"
            ))
        })
    }
}

/// Routes served at fixed paths.
const RESERVED_ROUTES: [&str; 3] = ["/health", "/saml2/acs", "/slogout.jsf"];

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (lines where content before the variable is a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in ENV_VAR.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            // Skip if this variable is inside a comment
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthenticationMode;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ServiceConfig::from_str("").unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.auth.mode, AuthenticationMode::Internal);
        assert_eq!(
            config.auth.redirects.saml_sp_redirect_page,
            "/saml2/redirectToIdp.jsf"
        );
        assert_eq!(
            config.auth.redirects.insufficient_auth_url,
            "/marketplace/insufficientAuthorities.jsf"
        );
        assert_eq!(config.auth.redirects.marketplace_start_url, "/marketplace/index.jsf");
        assert_eq!(config.auth.redirects.error_page, "/public/error.jsf");
        assert_eq!(
            config.auth.redirects.marketplace_error_page,
            "/marketplace/logout.jsf"
        );
        assert_eq!(config.auth.session.cookie_name, "MPSSO_SESSION");
        assert!(config.auth.signing.enabled);
        assert!(config.auth.verification.check_in_response_to);
    }

    #[test]
    fn test_full_config() {
        let config = ServiceConfig::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9090

            [auth]
            mode = "saml_sp"

            [auth.sso]
            issuer_id = "https://sp.example.com"
            idp_url = "https://idp.example.com/sso"
            idp_http_method = "GET"

            [auth.verification]
            idp_certificate = "/etc/marketplace/idp.pem"

            [auth.filter]
            exclude_url_pattern = "^/public/.*"

            [[directory.tenants]]
            id = "acme"
            idp_url = "https://login.acme.example/saml"

            [[directory.marketplaces]]
            id = "mp1"
            restricted = true
            organizations = ["org1"]

            [[directory.users]]
            id = "alice"
            organization_id = "org1"

            [observability.logging]
            format = "json"
        "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9090);
        assert!(config.auth.is_saml_sp());
        assert_eq!(config.auth.sso.idp_http_method.as_deref(), Some("GET"));
        assert_eq!(config.directory.tenants[0].id, "acme");
        assert!(config.directory.marketplaces[0].restricted);
        assert_eq!(config.directory.users[0].organization_id, "org1");
        assert_eq!(config.observability.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_mode_accepts_setting_spelling() {
        let config = ServiceConfig::from_str(
            r#"
            [auth]
            mode = "SAML_SP"
            [auth.sso]
            idp_url = "https://idp.example.com/sso"
            [auth.verification]
            idp_certificate = "/etc/marketplace/idp.pem"
        "#,
        )
        .unwrap();
        assert!(config.auth.is_saml_sp());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ServiceConfig::from_str("[auth]\nmod = \"internal\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_invalid_exclude_pattern_rejected() {
        let err = ServiceConfig::from_str(
            r#"
            [auth.filter]
            exclude_url_pattern = "(unclosed"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("exclude_url_pattern")));
    }

    #[test]
    fn test_exclude_pattern_matches_whole_path() {
        let config = ServiceConfig::from_str(
            r#"
            [auth.filter]
            exclude_url_pattern = "/public/.*|/css/.*"
        "#,
        )
        .unwrap();
        let regex = config.exclude_url_regex().unwrap();

        assert!(regex.is_match("/public/error.jsf"));
        assert!(regex.is_match("/css/style.css"));
        assert!(!regex.is_match("/marketplace/public/x"));
    }

    #[test]
    fn test_default_exclude_pattern_covers_sso_endpoints() {
        let regex = ServiceConfig::default().exclude_url_regex().unwrap();

        for path in [
            "/saml2/redirectToIdp.jsf",
            "/saml2/acs",
            "/slogout.jsf",
            "/health",
            "/public/error.jsf",
            "/marketplace/index.jsf",
            "/marketplace/insufficientAuthorities.jsf",
            "/marketplace/css/style.css",
        ] {
            assert!(regex.is_match(path), "{path} should be excluded");
        }
        assert!(!regex.is_match("/marketplace/services.jsf"));
    }

    #[test]
    fn test_saml_mode_requires_idp() {
        let err = ServiceConfig::from_str(
            "[auth]\nmode = \"saml_sp\"\n[auth.verification]\nidp_certificate = \"/idp.pem\"",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("idp_url")));

        ServiceConfig::from_str(
            r#"
            [auth]
            mode = "saml_sp"
            [auth.verification]
            idp_certificate = "/idp.pem"
            [[directory.tenants]]
            id = "acme"
        "#,
        )
        .unwrap();
    }

    #[test]
    fn test_saml_mode_requires_response_verification() {
        let without_certificate = r#"
            [auth]
            mode = "saml_sp"
            [auth.sso]
            idp_url = "https://idp.example.com/sso"
        "#;
        let err = ServiceConfig::from_str(without_certificate).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("idp_certificate")));

        let config = ServiceConfig::from_str(&format!(
            "{without_certificate}\n[auth.verification]\nallow_unsigned_responses = true"
        ))
        .unwrap();
        assert!(config.auth.verification.allow_unsigned_responses);

        // Internal mode never consumes responses
        ServiceConfig::from_str("[auth]\nmode = \"internal\"").unwrap();
    }

    #[rstest::rstest]
    #[case::relative("saml_sp_redirect_page = \"saml2/start\"")]
    #[case::reserved("saml_post_include_page = \"/saml2/acs\"")]
    #[case::same_as_other("saml_post_include_page = \"/saml2/redirectToIdp.jsf\"")]
    fn test_bad_sso_page_paths_rejected(#[case] line: &str) {
        let err = ServiceConfig::from_str(&format!("[auth.redirects]\n{line}\n")).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_duplicate_directory_ids_rejected() {
        let err = ServiceConfig::from_str(
            r#"
            [[directory.marketplaces]]
            id = "mp1"
            [[directory.marketplaces]]
            id = "mp1"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_env_var_expansion() {
        temp_env::with_var("TEST_KEYSTORE_PASS", Some("changeit"), || {
            let config = ServiceConfig::from_str(
                "[auth.sso]\nsigning_keystore_pass = \"${TEST_KEYSTORE_PASS}\"",
            )
            .unwrap();
            assert_eq!(
                config.auth.sso.signing_keystore_pass.as_deref(),
                Some("changeit")
            );
        });
    }

    #[test]
    fn test_missing_env_var_is_error() {
        temp_env::with_var_unset("TEST_MISSING_SSO_VAR", || {
            let err = expand_env_vars("key = \"${TEST_MISSING_SSO_VAR}\"").unwrap_err();
            assert!(matches!(err, ConfigError::EnvVarNotFound(name) if name == "TEST_MISSING_SSO_VAR"));
        });
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        let result = expand_env_vars("# idp_url = \"${NONEXISTENT_VAR}\"").unwrap();
        assert_eq!(result, "# idp_url = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_env_var_after_comment_ignored() {
        let result = expand_env_vars("key = \"value\" # ${NONEXISTENT_VAR}").unwrap();
        assert_eq!(result, "key = \"value\" # ${NONEXISTENT_VAR}");
    }

    #[test]
    fn test_multiline_with_comments() {
        temp_env::with_var("TEST_MULTI", Some("value1"), || {
            let input = r#"key1 = "${TEST_MULTI}"
# key2 = "${NONEXISTENT}"
key3 = "literal""#;
            let result = expand_env_vars(input).unwrap();
            assert_eq!(
                result,
                r#"key1 = "value1"
# key2 = "${NONEXISTENT}"
key3 = "literal""#
            );
        });
    }

    #[test]
    fn test_from_file_missing_is_io_error() {
        let err = ServiceConfig::from_file("/nonexistent/marketplace-sso.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }
}
