//! SAML service-provider side of the single sign-on flow.

pub mod assertion;
pub mod authn_request;
pub mod directory;
mod error;
pub mod keystore;
pub mod session;
pub mod settings;
pub mod signature;

#[cfg(test)]
pub(crate) mod test_support;

pub use assertion::SamlResponseExtractor;
pub use authn_request::{AuthnRequestBuilder, Binding, EncodedAuthnRequest};
pub use directory::{AuthorizationService, MarketplaceDirectory, StaticDirectory, UserDirectory};
pub use error::{DEFAULT_ERROR_PAGE, SsoError};
pub use keystore::IdentityCache;
pub use session::{MemorySessionStore, SessionStore, WebSession};
pub use settings::{AuthenticationMode, AuthenticationSettingsResolver, TenantAuthSettings};
pub use signature::{SamlSigner, SignatureFactory, SigningIdentity};

/// SAML 2.0 protocol namespace.
pub const SAML2_PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
/// SAML 2.0 assertion namespace.
pub const SAML2_ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
/// XML digital signature namespace.
pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
