//! Outbound SAML 2.0 `AuthnRequest` generation.

use std::io::Write;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{SecondsFormat, Utc};
use flate2::{Compression, write::DeflateEncoder};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{SAML2_ASSERTION_NS, SAML2_PROTOCOL_NS, SamlSigner, SsoError};
use crate::xml::Element;

pub const HTTP_POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
pub const HTTP_REDIRECT_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";

/// How the request travels to the identity provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// Auto-submitted HTML form carrying the base64 request.
    #[default]
    HttpPost,
    /// Query parameter carrying the deflated, base64, URL-encoded request.
    HttpRedirect,
}

impl Binding {
    /// Binding for a configured HTTP method: `GET` selects HTTP-Redirect,
    /// anything else (including unset) HTTP-POST.
    pub fn from_http_method(method: Option<&str>) -> Self {
        match method {
            Some(method) if method.trim().eq_ignore_ascii_case("GET") => Self::HttpRedirect,
            _ => Self::HttpPost,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::HttpPost => HTTP_POST_BINDING,
            Self::HttpRedirect => HTTP_REDIRECT_BINDING,
        }
    }
}

/// A transport-ready request and the ID to correlate the response with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAuthnRequest {
    pub request_id: String,
    pub binding: Binding,
    /// Value of the `SAMLRequest` parameter. Already URL-encoded for the
    /// redirect binding.
    pub encoded: String,
}

impl EncodedAuthnRequest {
    /// IdP URL with `SAMLRequest` (and `RelayState`) appended, for the
    /// redirect binding.
    pub fn redirect_url(&self, idp_url: &str, relay_state: Option<&str>) -> String {
        let separator = if idp_url.contains('?') { '&' } else { '?' };
        let mut url = format!("{idp_url}{separator}SAMLRequest={}", self.encoded);
        if let Some(relay_state) = relay_state.filter(|r| !r.is_empty()) {
            url.push_str("&RelayState=");
            url.extend(url::form_urlencoded::byte_serialize(relay_state.as_bytes()));
        }
        url
    }
}

/// Builds `AuthnRequest`s, signing them when a signer is attached.
#[derive(Default)]
pub struct AuthnRequestBuilder<'a> {
    binding: Binding,
    signer: Option<SamlSigner<'a>>,
}

impl<'a> AuthnRequestBuilder<'a> {
    pub fn new(binding: Binding) -> Self {
        Self {
            binding,
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: SamlSigner<'a>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Build, optionally sign and encode a request from `issuer`.
    pub fn build(&self, issuer: &str, is_https: bool) -> Result<EncodedAuthnRequest, SsoError> {
        let (mut request, request_id) = self.build_element(issuer, is_https)?;

        if let Some(signer) = &self.signer {
            signer.sign_element(&mut request)?;
        }

        let xml = request.to_xml_string();
        let encoded = match self.binding {
            Binding::HttpPost => STANDARD.encode(xml.as_bytes()),
            Binding::HttpRedirect => {
                let deflated = deflate(xml.as_bytes()).map_err(|e| {
                    SsoError::RequestGenerationFailure(format!(
                        "Failed to compress AuthnRequest: {e}"
                    ))
                })?;
                url::form_urlencoded::byte_serialize(STANDARD.encode(deflated).as_bytes())
                    .collect()
            }
        };

        tracing::debug!(
            request_id = %request_id,
            issuer = %issuer,
            binding = ?self.binding,
            signed = self.signer.is_some(),
            "Generated SAML AuthnRequest"
        );

        Ok(EncodedAuthnRequest {
            request_id,
            binding: self.binding,
            encoded,
        })
    }

    /// Unsigned request element plus its freshly generated ID.
    pub fn build_element(
        &self,
        issuer: &str,
        is_https: bool,
    ) -> Result<(Element, String), SsoError> {
        if issuer.trim().is_empty() {
            return Err(SsoError::RequestGenerationFailure(
                "No issuer set in the configuration settings".into(),
            ));
        }

        let request_id = generate_request_id();
        let mut request = Element::new(Some("samlp"), "AuthnRequest")
            .with_attribute("ID", request_id.as_str())
            .with_attribute("Version", "2.0")
            .with_attribute(
                "IssueInstant",
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .with_attribute("ProtocolBinding", HTTP_POST_BINDING)
            .with_attribute(
                "AssertionConsumerServiceIndex",
                if is_https { "0" } else { "1" },
            )
            .with_child(Element::new(Some("saml"), "Issuer").with_text(issuer.trim()));
        request.declare_namespace(Some("samlp"), SAML2_PROTOCOL_NS);
        request.declare_namespace(Some("saml"), SAML2_ASSERTION_NS);

        Ok((request, request_id))
    }
}

/// `_` followed by 32 hex digits of a random v4 UUID. XML IDs may not start
/// with a digit.
pub fn generate_request_id() -> String {
    format!("_{}", Uuid::new_v4().simple())
}

fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
