//! Root CA management for TLS interception.
//!
//! The proxy signs per-host leaf certificates on the fly with a root CA
//! kept as a PEM pair in the CA directory. Missing material is generated on
//! first run; unreadable or unparsable material is fatal at server start.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

pub use crate::error::CaManagerError;

const CA_CERT_FILENAME: &str = "wayfarer-ca.crt";
const CA_KEY_FILENAME: &str = "wayfarer-ca.key";
const CA_COMMON_NAME: &str = "Wayfarer Root CA";

/// How many leaf certificates the authority keeps cached.
const LEAF_CACHE_SIZE: u64 = 1000;

/// Manages the root CA PEM pair for the MITM proxy.
#[derive(Debug, Clone)]
pub struct CaManager {
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a CA manager rooted at the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Creates a CA manager under the default Wayfarer data directory.
    pub fn with_default_dir() -> Result<Self, CaManagerError> {
        let project_dirs = directories::ProjectDirs::from("com", "wayfarer", "Wayfarer")
            .ok_or_else(|| CaManagerError::Generation("failed to resolve project dirs".into()))?;
        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    /// Path to the CA certificate PEM.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Path to the CA private key PEM.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// True when both halves of the PEM pair exist.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Loads the CA, generating a fresh pair first if none exists.
    ///
    /// This is the only CA entry point the server uses; any failure here is
    /// fatal at server start.
    pub fn ensure_ca(&self) -> Result<RcgenAuthority, CaManagerError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Generates and writes a new self-signed root pair.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;
        let cert = ca_params()
            .map_err(|e| CaManagerError::Generation(e.to_string()))?
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("generated root CA at {:?}", self.cert_path());
        Ok(())
    }

    /// Loads the PEM pair into a hudsucker signing authority.
    pub fn load_authority(&self) -> Result<RcgenAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(RcgenAuthority::new(issuer, LEAF_CACHE_SIZE, default_provider()))
    }

    /// Reads the CA certificate as DER bytes, for trust-store installation.
    pub fn read_cert_der(&self) -> Result<Vec<u8>, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let parsed =
            pem::parse(&cert_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        Ok(parsed.contents().to_vec())
    }
}

/// Certificate parameters for the root: a constrained CA with signing key
/// usages, good for server and client auth chains.
fn ca_params() -> Result<CertificateParams, hudsucker::rcgen::Error> {
    let mut params = CertificateParams::new(vec![CA_COMMON_NAME.to_string()])?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    Ok(params)
}
