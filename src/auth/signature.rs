//! XML digital signatures over SAML protocol elements.
//!
//! Signatures use Exclusive C14N for both the `SignedInfo` canonicalization
//! and the single reference transform, SHA-1 digests, and RSA-SHA1 or
//! DSA-SHA1 depending on the signing key. The reference deliberately carries
//! no enveloped-signature transform; identity providers we interoperate with
//! expect this layout.
//!
//! Ownership: the caller owns the document. [`SamlSigner`] borrows the element
//! mutably for the duration of one call and inserts the `ds:Signature` in place.

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    bn::BigNum,
    dsa::DsaSig,
    hash::{MessageDigest, hash},
    pkey::{Id, PKey, PKeyRef, Private, Public},
    sign::{Signer, Verifier},
    x509::X509,
};

use super::{SsoError, XMLDSIG_NS};
use crate::xml::{Element, NamespaceScope, Node, c14n};

const DS: &str = "ds";

pub const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub const DSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#dsa-sha1";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const DSA_SHA256: &str = "http://www.w3.org/2009/xmldsig11#dsa-sha256";
pub const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

// ─────────────────────────────────────────────────────────────────────────────
// Keys
// ─────────────────────────────────────────────────────────────────────────────

/// Algorithm family of a signing key, resolved once when the key is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Dsa,
    Unsupported,
}

impl KeyKind {
    pub fn of<T>(key: &PKeyRef<T>) -> Self {
        match key.id() {
            Id::RSA => KeyKind::Rsa,
            Id::DSA => KeyKind::Dsa,
            _ => KeyKind::Unsupported,
        }
    }
}

/// Private key plus the optional public material published in `KeyInfo`.
pub struct SigningIdentity {
    private_key: PKey<Private>,
    kind: KeyKind,
    public_key: Option<PKey<Public>>,
    certificate: Option<X509>,
}

impl SigningIdentity {
    pub fn new(private_key: PKey<Private>) -> Self {
        let kind = KeyKind::of(&private_key);
        Self {
            private_key,
            kind,
            public_key: None,
            certificate: None,
        }
    }

    pub fn with_public_key(mut self, public_key: PKey<Public>) -> Self {
        self.public_key = Some(public_key);
        self
    }

    pub fn with_certificate(mut self, certificate: X509) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn certificate(&self) -> Option<&X509> {
        self.certificate.as_ref()
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("kind", &self.kind)
            .field("has_public_key", &self.public_key.is_some())
            .field("has_certificate", &self.certificate.is_some())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Algorithms
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    pub fn uri(self) -> &'static str {
        match self {
            Self::Sha1 => DIGEST_SHA1,
            Self::Sha256 => DIGEST_SHA256,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            DIGEST_SHA1 => Some(Self::Sha1),
            DIGEST_SHA256 => Some(Self::Sha256),
            _ => None,
        }
    }

    fn message_digest(self) -> MessageDigest {
        match self {
            Self::Sha1 => MessageDigest::sha1(),
            Self::Sha256 => MessageDigest::sha256(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RsaSha1,
    DsaSha1,
    RsaSha256,
    DsaSha256,
}

impl SignatureAlgorithm {
    /// Algorithm used when signing with a key of the given kind.
    pub fn for_key(kind: KeyKind) -> Option<Self> {
        match kind {
            KeyKind::Rsa => Some(Self::RsaSha1),
            KeyKind::Dsa => Some(Self::DsaSha1),
            KeyKind::Unsupported => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::RsaSha1 => RSA_SHA1,
            Self::DsaSha1 => DSA_SHA1,
            Self::RsaSha256 => RSA_SHA256,
            Self::DsaSha256 => DSA_SHA256,
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            RSA_SHA1 => Some(Self::RsaSha1),
            DSA_SHA1 => Some(Self::DsaSha1),
            RSA_SHA256 => Some(Self::RsaSha256),
            DSA_SHA256 => Some(Self::DsaSha256),
            _ => None,
        }
    }

    fn key_kind(self) -> KeyKind {
        match self {
            Self::RsaSha1 | Self::RsaSha256 => KeyKind::Rsa,
            Self::DsaSha1 | Self::DsaSha256 => KeyKind::Dsa,
        }
    }

    fn message_digest(self) -> MessageDigest {
        match self {
            Self::RsaSha1 | Self::DsaSha1 => MessageDigest::sha1(),
            Self::RsaSha256 | Self::DsaSha256 => MessageDigest::sha256(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signable elements
// ─────────────────────────────────────────────────────────────────────────────

/// SAML elements that may carry a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignableKind {
    Request,
    Response,
    Assertion,
}

impl SignableKind {
    /// SAML 1.1 `Request`/`Response`/`Assertion` and their SAML 2.0
    /// protocol counterparts (`AuthnRequest`, `LogoutResponse`, ...).
    pub fn of(element: &Element) -> Option<Self> {
        let name = element.local_name.as_str();
        if name == "Assertion" {
            Some(Self::Assertion)
        } else if name.ends_with("Response") {
            Some(Self::Response)
        } else if name.ends_with("Request") {
            Some(Self::Request)
        } else {
            None
        }
    }

    /// ID attribute names in lookup order: SAML 1.1 first, then SAML 2.0.
    pub fn id_attributes(self) -> &'static [&'static str] {
        match self {
            Self::Request => &["RequestID", "ID"],
            Self::Response => &["ResponseID", "ID"],
            Self::Assertion => &["AssertionID", "ID"],
        }
    }
}

/// Value of the ID attribute a signature reference points at.
pub fn reference_id(element: &Element) -> Result<&str, SsoError> {
    let name = &element.local_name;
    let kind = SignableKind::of(element)
        .ok_or_else(|| SsoError::signing(format!("Unsupported element to be signed: <{name}>")))?;

    let id = kind
        .id_attributes()
        .iter()
        .find_map(|attr| element.attribute(attr))
        .ok_or_else(|| {
            SsoError::signing(format!(
                "ID Attribute of element <{name}> (to be signed) not found"
            ))
        })?;

    if id.trim().is_empty() {
        return Err(SsoError::signing(format!(
            "ID Attribute of element <{name}> (to be signed) is empty"
        )));
    }
    Ok(id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────────────────────────────

/// Signature parameters shared by every signing and verification call.
///
/// Built once at startup and handed around behind an `Arc`.
#[derive(Debug, Clone)]
pub struct SignatureFactory {
    canonicalization: &'static str,
    reference_transform: &'static str,
    digest: DigestAlgorithm,
    embed_key_value: bool,
}

impl Default for SignatureFactory {
    fn default() -> Self {
        Self {
            canonicalization: c14n::EXCLUSIVE_C14N,
            reference_transform: c14n::EXCLUSIVE_C14N,
            digest: DigestAlgorithm::Sha1,
            embed_key_value: false,
        }
    }
}

impl SignatureFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the raw public key as `ds:KeyValue` when the identity has no
    /// certificate. A certificate always takes precedence.
    pub fn with_key_value_embedding(mut self, enabled: bool) -> Self {
        self.embed_key_value = enabled;
        self
    }

    pub fn signer<'a>(&'a self, identity: &'a SigningIdentity) -> SamlSigner<'a> {
        SamlSigner {
            factory: self,
            identity,
        }
    }

    /// Verify the first `ds:Signature` in `document` against `certificate`.
    ///
    /// On success returns the ID of the signed element and its node path below
    /// `document`, so callers can check that the data they trust is covered.
    pub fn verify(
        &self,
        document: &Element,
        certificate: &X509,
    ) -> Result<VerifiedReference, SsoError> {
        let result = verify_signature(document, certificate);
        match &result {
            Ok(verified) => {
                tracing::debug!(reference = %verified.id, "XML signature verified");
            }
            Err(e) => {
                tracing::warn!(error = %e, "XML signature verification failed");
            }
        }
        result
    }
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedReference {
    pub id: String,
    pub path: Vec<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Signing
// ─────────────────────────────────────────────────────────────────────────────

pub struct SamlSigner<'a> {
    factory: &'a SignatureFactory,
    identity: &'a SigningIdentity,
}

impl SamlSigner<'_> {
    /// Sign `element` and place the signature inside it: before its
    /// `Extensions` (or else `Status`) child when present, otherwise last.
    ///
    /// `element` is canonicalized as a standalone subtree, so it must declare
    /// every namespace it uses.
    pub fn sign_element(&self, element: &mut Element) -> Result<(), SsoError> {
        let signature = self.build_signature(element, &NamespaceScope::new())?;
        insert_signature(element, signature);
        Ok(())
    }

    /// Sign the child element at node index `index` of `parent` and place the
    /// signature inside `parent`: before its `Extensions` (or else `Status`)
    /// child when present, otherwise last.
    pub fn sign_child_element(&self, parent: &mut Element, index: usize) -> Result<(), SsoError> {
        let scope = NamespaceScope::new().enter(parent);
        let signature = match parent.children.get(index) {
            Some(Node::Element(child)) => self.build_signature(child, &scope)?,
            _ => {
                return Err(SsoError::signing(format!(
                    "No element at position {index} of <{}>",
                    parent.qualified_name()
                )));
            }
        };
        insert_signature(parent, signature);
        Ok(())
    }

    fn build_signature(
        &self,
        element: &Element,
        scope: &NamespaceScope,
    ) -> Result<Element, SsoError> {
        let algorithm = SignatureAlgorithm::for_key(self.identity.kind)
            .ok_or_else(|| SsoError::signing("Unsupported key type"))?;
        let id = reference_id(element)?;
        let factory = self.factory;

        let canonical = c14n::canonicalize(element, scope, &[]);
        let digest = hash(factory.digest.message_digest(), canonical.as_bytes()).map_err(|e| {
            SsoError::signing_with(format!("Failed to digest <{}>", element.local_name), e)
        })?;

        let transforms = ds("Transforms")
            .with_child(ds("Transform").with_attribute("Algorithm", factory.reference_transform));
        let reference = ds("Reference")
            .with_attribute("URI", format!("#{id}"))
            .with_child(transforms)
            .with_child(ds("DigestMethod").with_attribute("Algorithm", factory.digest.uri()))
            .with_child(ds("DigestValue").with_text(STANDARD.encode(&digest)));
        let signed_info = ds("SignedInfo")
            .with_child(
                ds("CanonicalizationMethod").with_attribute("Algorithm", factory.canonicalization),
            )
            .with_child(ds("SignatureMethod").with_attribute("Algorithm", algorithm.uri()))
            .with_child(reference);

        let mut signature = ds("Signature");
        signature.declare_namespace(Some(DS), XMLDSIG_NS);

        let signature_scope = NamespaceScope::new().enter(&signature);
        let canonical_signed_info = c14n::canonicalize(&signed_info, &signature_scope, &[]);
        let value = self.sign_bytes(algorithm, canonical_signed_info.as_bytes())?;

        signature.push_child(signed_info);
        signature.push_child(ds("SignatureValue").with_text(STANDARD.encode(&value)));
        if let Some(key_info) = self.key_info()? {
            signature.push_child(key_info);
        }

        tracing::debug!(
            element = %element.local_name,
            reference = %id,
            algorithm = algorithm.uri(),
            "Signed SAML element"
        );
        Ok(signature)
    }

    fn sign_bytes(&self, algorithm: SignatureAlgorithm, data: &[u8]) -> Result<Vec<u8>, SsoError> {
        let key = &self.identity.private_key;
        let mut signer = Signer::new(algorithm.message_digest(), key)
            .map_err(|e| SsoError::signing_with("Failed to create signer", e))?;
        signer
            .update(data)
            .map_err(|e| SsoError::signing_with("Failed to update signer", e))?;
        let der = signer
            .sign_to_vec()
            .map_err(|e| SsoError::signing_with("Failed to sign", e))?;

        match algorithm.key_kind() {
            KeyKind::Dsa => {
                let q_len = key
                    .dsa()
                    .map(|dsa| dsa.q().num_bytes())
                    .map_err(|e| SsoError::signing_with("Failed to read DSA parameters", e))?;
                dsa_der_to_raw(&der, q_len)
                    .map_err(|e| SsoError::signing_with("Failed to encode DSA signature", e))
            }
            _ => Ok(der),
        }
    }

    fn key_info(&self) -> Result<Option<Element>, SsoError> {
        if let Some(certificate) = &self.identity.certificate {
            let der = certificate
                .to_der()
                .map_err(|e| SsoError::signing_with("Failed to encode certificate", e))?;
            return Ok(Some(ds("KeyInfo").with_child(
                ds("X509Data").with_child(ds("X509Certificate").with_text(STANDARD.encode(der))),
            )));
        }

        match &self.identity.public_key {
            Some(public_key) if self.factory.embed_key_value => key_value(public_key)
                .map(|value| Some(ds("KeyInfo").with_child(value)))
                .map_err(|e| SsoError::signing_with("Failed to encode public key", e)),
            _ => Ok(None),
        }
    }
}

fn ds(local_name: &str) -> Element {
    Element::new(Some(DS), local_name)
}

fn insert_signature(target: &mut Element, signature: Element) {
    let position = target
        .child_position("Extensions")
        .or_else(|| target.child_position("Status"));
    match position {
        Some(index) => target.children.insert(index, Node::Element(signature)),
        None => target.push_child(signature),
    }
}

fn key_value(public_key: &PKey<Public>) -> Result<Element, openssl::error::ErrorStack> {
    let b64 = |n: &openssl::bn::BigNumRef| STANDARD.encode(n.to_vec());
    let inner = match KeyKind::of(public_key) {
        KeyKind::Dsa => {
            let dsa = public_key.dsa()?;
            ds("DSAKeyValue")
                .with_child(ds("P").with_text(b64(dsa.p())))
                .with_child(ds("Q").with_text(b64(dsa.q())))
                .with_child(ds("G").with_text(b64(dsa.g())))
                .with_child(ds("Y").with_text(b64(dsa.pub_key())))
        }
        _ => {
            let rsa = public_key.rsa()?;
            ds("RSAKeyValue")
                .with_child(ds("Modulus").with_text(b64(rsa.n())))
                .with_child(ds("Exponent").with_text(b64(rsa.e())))
        }
    };
    Ok(ds("KeyValue").with_child(inner))
}

/// DER `Dss-Sig-Value` to the XML-DSig `r || s` form, each half padded to
/// the length of `q`.
fn dsa_der_to_raw(der: &[u8], q_len: i32) -> Result<Vec<u8>, openssl::error::ErrorStack> {
    let sig = DsaSig::from_der(der)?;
    let mut raw = sig.r().to_vec_padded(q_len)?;
    raw.extend(sig.s().to_vec_padded(q_len)?);
    Ok(raw)
}

fn dsa_raw_to_der(raw: &[u8]) -> Result<Vec<u8>, openssl::error::ErrorStack> {
    let (r, s) = raw.split_at(raw.len() / 2);
    DsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?.to_der()
}

// ─────────────────────────────────────────────────────────────────────────────
// Verification
// ─────────────────────────────────────────────────────────────────────────────

fn invalid(message: impl Into<String>) -> SsoError {
    SsoError::InvalidSignature(message.into())
}

fn decode_base64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(compact)
}

fn required_child<'a>(parent: &'a Element, local_name: &str) -> Result<&'a Element, SsoError> {
    parent
        .child(local_name)
        .ok_or_else(|| invalid(format!("<{}> has no <{local_name}>", parent.local_name)))
}

fn algorithm_of(element: &Element) -> Result<&str, SsoError> {
    element
        .attribute("Algorithm")
        .ok_or_else(|| invalid(format!("<{}> has no Algorithm", element.local_name)))
}

/// `PrefixList` of an `InclusiveNamespaces` child, if any.
fn inclusive_prefixes(method: &Element) -> Vec<String> {
    method
        .child("InclusiveNamespaces")
        .and_then(|ns| ns.attribute("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn has_id(element: &Element, id: &str) -> bool {
    ["ID", "ResponseID", "AssertionID", "RequestID"]
        .iter()
        .any(|attr| element.attribute(attr) == Some(id))
}

fn verify_signature(document: &Element, certificate: &X509) -> Result<VerifiedReference, SsoError> {
    let signature_path = document
        .find_path(&|e: &Element| e.local_name == "Signature" && e.child("SignedInfo").is_some())
        .ok_or_else(|| invalid("document carries no signature"))?;
    let signature = document
        .element_at(&signature_path)
        .ok_or_else(|| invalid("signature element disappeared"))?;
    let signature_scope = NamespaceScope::above(document, &signature_path).enter(signature);
    if signature_scope.element_namespace(signature) != Some(XMLDSIG_NS) {
        return Err(invalid("<Signature> is not in the XML-DSig namespace"));
    }

    let signed_info = required_child(signature, "SignedInfo")?;
    let c14n_method = required_child(signed_info, "CanonicalizationMethod")?;
    if algorithm_of(c14n_method)? != c14n::EXCLUSIVE_C14N {
        return Err(invalid(format!(
            "unsupported canonicalization {}",
            algorithm_of(c14n_method)?
        )));
    }
    let algorithm_uri = algorithm_of(required_child(signed_info, "SignatureMethod")?)?;
    let algorithm = SignatureAlgorithm::from_uri(algorithm_uri)
        .ok_or_else(|| invalid(format!("unsupported signature method {algorithm_uri}")))?;

    let references: Vec<&Element> = signed_info
        .child_elements()
        .filter(|e| e.local_name == "Reference")
        .collect();
    let [reference] = references.as_slice() else {
        return Err(invalid(format!(
            "expected exactly one <Reference>, found {}",
            references.len()
        )));
    };

    let id = reference
        .attribute("URI")
        .and_then(|uri| uri.strip_prefix('#'))
        .filter(|id| !id.is_empty())
        .ok_or_else(|| invalid("reference URI must point at an element ID"))?;

    let mut reference_prefixes = Vec::new();
    if let Some(transforms) = reference.child("Transforms") {
        for transform in transforms.child_elements() {
            match algorithm_of(transform)? {
                ENVELOPED_SIGNATURE => {}
                c14n::EXCLUSIVE_C14N => reference_prefixes = inclusive_prefixes(transform),
                other => return Err(invalid(format!("unsupported transform {other}"))),
            }
        }
    }

    // Duplicate IDs would let an attacker point the reference at a decoy.
    let mut matches = Vec::new();
    if has_id(document, id) {
        matches.push(document);
    }
    document.descendants_matching(&|e: &Element| has_id(e, id), &mut matches);
    if matches.len() != 1 {
        return Err(invalid(format!(
            "reference #{id} must match exactly one element, found {}",
            matches.len()
        )));
    }
    let target_path = document
        .find_path(&|e: &Element| has_id(e, id))
        .ok_or_else(|| invalid(format!("reference #{id} not found")))?;
    let target = document
        .element_at(&target_path)
        .ok_or_else(|| invalid(format!("reference #{id} not found")))?;

    // The signature under verification never contributes to its own digest.
    let mut subject = target.clone();
    if let Some(relative) = signature_path.strip_prefix(target_path.as_slice())
        && let Some((last, parent_path)) = relative.split_last()
        && let Some(parent) = subject.element_at_mut(parent_path)
    {
        parent.children.remove(*last);
    }

    let digest_algorithm_uri = algorithm_of(required_child(reference, "DigestMethod")?)?;
    let digest_algorithm = DigestAlgorithm::from_uri(digest_algorithm_uri)
        .ok_or_else(|| invalid(format!("unsupported digest method {digest_algorithm_uri}")))?;
    let canonical = c14n::canonicalize(
        &subject,
        &NamespaceScope::above(document, &target_path),
        &reference_prefixes,
    );
    let computed = hash(digest_algorithm.message_digest(), canonical.as_bytes())
        .map_err(|e| invalid(format!("digest computation failed: {e}")))?;
    let expected = decode_base64(&required_child(reference, "DigestValue")?.text())
        .map_err(|e| invalid(format!("malformed DigestValue: {e}")))?;
    if computed[..] != expected[..] {
        return Err(invalid(format!("digest mismatch for #{id}")));
    }

    let public_key = certificate
        .public_key()
        .map_err(|e| invalid(format!("unusable certificate: {e}")))?;
    if KeyKind::of(&public_key) != algorithm.key_kind() {
        return Err(invalid(format!(
            "certificate key does not match signature method {algorithm_uri}"
        )));
    }

    let canonical_signed_info =
        c14n::canonicalize(signed_info, &signature_scope, &inclusive_prefixes(c14n_method));
    let mut value = decode_base64(&required_child(signature, "SignatureValue")?.text())
        .map_err(|e| invalid(format!("malformed SignatureValue: {e}")))?;
    if algorithm.key_kind() == KeyKind::Dsa {
        value = dsa_raw_to_der(&value)
            .map_err(|e| invalid(format!("malformed DSA signature: {e}")))?;
    }

    let mut verifier = Verifier::new(algorithm.message_digest(), &public_key)
        .map_err(|e| invalid(format!("failed to create verifier: {e}")))?;
    verifier
        .update(canonical_signed_info.as_bytes())
        .map_err(|e| invalid(format!("failed to update verifier: {e}")))?;
    // OpenSSL reports a malformed signature as an error rather than `false`.
    if !verifier.verify(&value).unwrap_or(false) {
        return Err(invalid("signature value does not match"));
    }

    Ok(VerifiedReference {
        id: id.to_string(),
        path: target_path,
    })
}
