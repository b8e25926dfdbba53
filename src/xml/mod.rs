//! Minimal owned XML tree used by the SAML protocol code.
//!
//! SAML messages are small, so the whole document is parsed into an owned
//! [`Element`] tree. The tree keeps namespace declarations exactly where they
//! appeared so that [`c14n`] can produce Exclusive XML Canonicalization output
//! for signing and verification.

pub mod c14n;
mod dom;

pub use dom::*;

/// Namespace bound to the reserved `xml` prefix.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Errors raised while parsing XML.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("XML syntax error: {0}")]
    Syntax(#[from] quick_xml::Error),

    #[error("Invalid XML attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),

    #[error("Invalid XML escape sequence: {0}")]
    Escape(#[from] quick_xml::escape::EscapeError),

    #[error("XML content is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Document type declarations are not accepted")]
    DoctypeNotAllowed,

    #[error("Document has no root element")]
    MissingRoot,

    #[error("Unexpected content outside the root element")]
    ContentOutsideRoot,

    #[error("Element <{0}> is never closed")]
    UnclosedElement(String),
}
