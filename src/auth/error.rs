//! SAML single sign-on errors.

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Page users land on when an authentication attempt fails.
pub const DEFAULT_ERROR_PAGE: &str = "/public/error.jsf";

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum SsoError {
    /// Signing failed: missing ID attribute, unsupported key type or a
    /// cryptographic/serialization failure.
    #[error("Unable to sign SAML XML element: {message}")]
    SigningFailure {
        message: String,
        #[source]
        source: Option<Cause>,
    },

    /// An inbound signature did not verify against the trusted certificate.
    #[error("Invalid XML signature: {0}")]
    InvalidSignature(String),

    /// No user identifier could be obtained from a SAML response.
    #[error("User ID not found in SAML response: {reason}")]
    IdentityNotFound {
        reason: String,
        #[source]
        source: Option<Cause>,
    },

    #[error("Unable to generate SAML authentication request: {0}")]
    RequestGenerationFailure(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Malformed identity provider URL '{url}': {source}")]
    MalformedIdpUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

impl SsoError {
    pub fn signing(message: impl Into<String>) -> Self {
        Self::SigningFailure {
            message: message.into(),
            source: None,
        }
    }

    pub fn signing_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SigningFailure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn identity_not_found(reason: impl Into<String>) -> Self {
        Self::IdentityNotFound {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn identity_not_found_with(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::IdentityNotFound {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Stable identifier used in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SigningFailure { .. } => "signing_failure",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::IdentityNotFound { .. } => "identity_not_found",
            Self::RequestGenerationFailure(_) => "request_generation_failure",
            Self::TenantNotFound(_) => "tenant_not_found",
            Self::MalformedIdpUrl { .. } => "malformed_idp_url",
        }
    }
}

impl SsoError {
    /// Log the failure and redirect to `error_page`. The response carries no
    /// error detail.
    pub fn into_redirect(self, error_page: &str) -> Response {
        tracing::warn!(error = %self, code = self.code(), "SAML authentication attempt failed");
        (StatusCode::FOUND, [(header::LOCATION, error_page.to_string())]).into_response()
    }
}

/// Redirects to the generic error page.
impl IntoResponse for SsoError {
    fn into_response(self) -> Response {
        self.into_redirect(DEFAULT_ERROR_PAGE)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_signing_failure_preserves_cause() {
        let cause = std::io::Error::other("bad key");
        let err = SsoError::signing_with("private key unreadable", cause);

        assert_eq!(
            err.to_string(),
            "Unable to sign SAML XML element: private key unreadable"
        );
        assert_eq!(err.source().unwrap().to_string(), "bad key");
        assert_eq!(err.code(), "signing_failure");
    }

    #[test]
    fn test_response_hides_detail() {
        let response = SsoError::TenantNotFound("secret-tenant".into()).into_response();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            DEFAULT_ERROR_PAGE
        );
    }

    #[test]
    fn test_redirect_to_custom_error_page() {
        let response =
            SsoError::identity_not_found("no userid").into_redirect("/marketplace/logout.jsf");

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/marketplace/logout.jsf"
        );
    }
}
