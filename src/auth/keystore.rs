//! Loading signing keys and trusted certificates from disk.
//!
//! `.p12`/`.pfx` files are read as PKCS#12 keystores protected by the
//! configured password. Anything else is treated as a PEM bundle holding a
//! private key (optionally encrypted) and, optionally, its certificate.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use openssl::{
    pkcs12::Pkcs12,
    pkey::{PKey, Private},
    x509::X509,
};
use thiserror::Error;
use tokio::sync::RwLock;

use super::{SigningIdentity, SsoError};

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("Failed to read keystore {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse keystore {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: openssl::error::ErrorStack,
    },

    #[error("Keystore {0} contains no private key")]
    MissingPrivateKey(PathBuf),
}

impl From<KeystoreError> for SsoError {
    fn from(err: KeystoreError) -> Self {
        SsoError::signing_with("signing keystore unavailable", err)
    }
}

fn is_pkcs12(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("p12") || ext.eq_ignore_ascii_case("pfx"))
}

fn read(path: &Path) -> Result<Vec<u8>, KeystoreError> {
    std::fs::read(path).map_err(|source| KeystoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the signing identity referenced by a tenant's settings.
///
/// The alias only selects between entries in multi-entry stores, which
/// neither format supports here; it is logged so operators can match it
/// against their keystore inventory.
pub fn load_signing_identity(
    path: &Path,
    alias: Option<&str>,
    password: Option<&str>,
) -> Result<SigningIdentity, KeystoreError> {
    let bytes = read(path)?;
    let parse_err = |source| KeystoreError::Parse {
        path: path.to_path_buf(),
        source,
    };

    let (private_key, certificate): (PKey<Private>, Option<X509>) = if is_pkcs12(path) {
        let parsed = Pkcs12::from_der(&bytes)
            .and_then(|p12| p12.parse2(password.unwrap_or_default()))
            .map_err(parse_err)?;
        let key = parsed
            .pkey
            .ok_or_else(|| KeystoreError::MissingPrivateKey(path.to_path_buf()))?;
        (key, parsed.cert)
    } else {
        let key = match password {
            Some(password) => PKey::private_key_from_pem_passphrase(&bytes, password.as_bytes()),
            None => PKey::private_key_from_pem(&bytes),
        }
        .map_err(parse_err)?;
        (key, X509::from_pem(&bytes).ok())
    };

    let public_key = private_key
        .public_key_to_der()
        .and_then(|der| PKey::public_key_from_der(&der))
        .map_err(parse_err)?;

    let mut identity = SigningIdentity::new(private_key).with_public_key(public_key);
    if let Some(certificate) = certificate {
        identity = identity.with_certificate(certificate);
    }

    tracing::info!(
        path = %path.display(),
        alias = alias.unwrap_or("-"),
        key_kind = ?identity.kind(),
        has_certificate = identity.certificate().is_some(),
        "Loaded SAML signing identity"
    );
    Ok(identity)
}

/// Load a trusted certificate in PEM or DER form.
pub fn load_certificate(path: &Path) -> Result<X509, KeystoreError> {
    let bytes = read(path)?;
    X509::from_pem(&bytes)
        .or_else(|_| X509::from_der(&bytes))
        .map_err(|source| KeystoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Signing identities loaded so far, keyed by keystore path and alias.
///
/// Keystores are read once per process; rotating a key requires a restart.
#[derive(Default)]
pub struct IdentityCache {
    entries: RwLock<HashMap<(PathBuf, Option<String>), Arc<SigningIdentity>>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_load(
        &self,
        path: &Path,
        alias: Option<&str>,
        password: Option<&str>,
    ) -> Result<Arc<SigningIdentity>, KeystoreError> {
        let key = (path.to_path_buf(), alias.map(str::to_string));
        if let Some(identity) = self.entries.read().await.get(&key) {
            return Ok(identity.clone());
        }

        let identity = Arc::new(load_signing_identity(path, alias, password)?);
        self.entries.write().await.insert(key, identity.clone());
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::auth::{
        signature::KeyKind,
        test_support::{rsa_key, self_signed_certificate},
    };

    fn write_temp(suffix: &str, bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn test_load_pem_bundle_with_certificate() {
        let key = rsa_key();
        let cert = self_signed_certificate(&key, "sp.example.com");
        let mut pem = key.private_key_to_pem_pkcs8().unwrap();
        pem.extend(cert.to_pem().unwrap());
        let file = write_temp(".pem", &pem);

        let identity = load_signing_identity(file.path(), Some("sp"), None).unwrap();
        assert_eq!(identity.kind(), KeyKind::Rsa);
        assert!(identity.certificate().is_some());
    }

    #[test]
    fn test_load_pem_key_without_certificate() {
        let key = rsa_key();
        let file = write_temp(".pem", &key.private_key_to_pem_pkcs8().unwrap());

        let identity = load_signing_identity(file.path(), None, None).unwrap();
        assert!(identity.certificate().is_none());
    }

    #[test]
    fn test_load_pkcs12_with_password() {
        let key = rsa_key();
        let cert = self_signed_certificate(&key, "sp.example.com");
        let p12 = Pkcs12::builder()
            .name("sp")
            .pkey(&key)
            .cert(&cert)
            .build2("changeit")
            .unwrap();
        let file = write_temp(".p12", &p12.to_der().unwrap());

        let identity = load_signing_identity(file.path(), Some("sp"), Some("changeit")).unwrap();
        assert_eq!(identity.kind(), KeyKind::Rsa);
        assert!(identity.certificate().is_some());

        let err = load_signing_identity(file.path(), Some("sp"), Some("wrong")).unwrap_err();
        assert!(matches!(err, KeystoreError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_signing_identity(Path::new("/nonexistent/keystore.p12"), None, None)
            .unwrap_err();
        assert!(matches!(err, KeystoreError::Io { .. }));

        let sso: SsoError = err.into();
        assert!(matches!(sso, SsoError::SigningFailure { .. }));
    }

    #[tokio::test]
    async fn test_identity_cache_loads_once() {
        let key = rsa_key();
        let file = write_temp(".pem", &key.private_key_to_pem_pkcs8().unwrap());
        let cache = IdentityCache::new();

        let first = cache.get_or_load(file.path(), None, None).await.unwrap();
        std::fs::remove_file(file.path()).unwrap();
        let second = cache.get_or_load(file.path(), None, None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        assert!(cache.get_or_load(file.path(), Some("other"), None).await.is_err());
    }

    #[test]
    fn test_load_certificate_pem_and_der() {
        let key = rsa_key();
        let cert = self_signed_certificate(&key, "idp.example.com");

        let pem = write_temp(".pem", &cert.to_pem().unwrap());
        let der = write_temp(".der", &cert.to_der().unwrap());

        assert_eq!(
            load_certificate(pem.path()).unwrap().to_der().unwrap(),
            cert.to_der().unwrap()
        );
        assert_eq!(
            load_certificate(der.path()).unwrap().to_der().unwrap(),
            cert.to_der().unwrap()
        );
    }
}
