//! Certificate authority and leaf factory.
//!
//! On first run a self-signed CA is generated under one of the built-in
//! disguise profiles and persisted to the certificate directory (key, cert,
//! and combined PEM, plus a metadata sidecar). Existing CA files are never
//! overwritten; when several generations exist the newest one is active.
//!
//! Leaves are minted per SNI on demand: CN = SNI, single SAN (dNSName, or
//! iPAddress for literal IPs), 30-day validity, random serial, SHA-256
//! signature. Minting for the same SNI is coalesced and results are kept in
//! an LRU cache.
//!
//! All key material is RSA-2048. rcgen only generates EC/Ed25519 keys
//! itself, so keys come from the rsa crate and are imported as
//! externally-generated PKCS#8 with RSA-SHA256 as the signature algorithm.

use lru::LruCache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::pki_types::PrivatePkcs8KeyDer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Leaf cache capacity.
pub const LEAF_CACHE_SIZE: usize = 1000;

/// Leaf validity window.
const LEAF_VALIDITY_DAYS: i64 = 30;

/// CA validity window (10 years).
const CA_VALIDITY_DAYS: i64 = 3650;

/// RSA modulus size for CA and leaf keys.
const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("unknown disguise profile: {0}")]
    UnknownProfile(String),
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("key generation failed: {0}")]
    Key(String),
    #[error("certificate file {0} already exists, refusing to overwrite")]
    WouldOverwrite(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored certificate: {0}")]
    BadStored(String),
}

/// Fresh RSA-2048 keypair, imported into rcgen for RSA-SHA256 signing.
fn generate_rsa_keypair() -> Result<KeyPair, CaError> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| CaError::Key(e.to_string()))?;
    let der = key
        .to_pkcs8_der()
        .map_err(|e| CaError::Key(e.to_string()))?;
    let pkcs8 = PrivatePkcs8KeyDer::from(der.as_bytes());
    Ok(KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &PKCS_RSA_SHA256)?)
}

/// Subject fields for one disguise profile.
#[derive(Debug, Clone)]
pub struct CertProfile {
    pub id: &'static str,
    pub common_name: &'static str,
    pub organization: &'static str,
    pub organizational_unit: &'static str,
    pub country: &'static str,
    pub state: &'static str,
    pub locality: &'static str,
    pub description: &'static str,
}

/// Built-in disguise profile table.
pub const CERT_PROFILES: &[CertProfile] = &[
    CertProfile {
        id: "wifi_security",
        common_name: "WiFi Security Certificate",
        organization: "Network Security Services",
        organizational_unit: "WiFi Protection",
        country: "US",
        state: "California",
        locality: "San Jose",
        description: "Generic WiFi security certificate",
    },
    CertProfile {
        id: "network_optimizer",
        common_name: "Network Optimization Services",
        organization: "ISP Network Services",
        organizational_unit: "Performance Optimization",
        country: "US",
        state: "New York",
        locality: "New York",
        description: "ISP optimization service",
    },
    CertProfile {
        id: "home_router",
        common_name: "Home Router Security Gateway",
        organization: "Router Services",
        organizational_unit: "Gateway Security",
        country: "US",
        state: "Texas",
        locality: "Austin",
        description: "Home router security gateway",
    },
    CertProfile {
        id: "lan_filter",
        common_name: "LAN Content Filter CA",
        organization: "Local Network Services",
        organizational_unit: "Content Filtering",
        country: "US",
        state: "Washington",
        locality: "Seattle",
        description: "Local network content filter",
    },
];

pub fn profile(id: &str) -> Option<&'static CertProfile> {
    CERT_PROFILES.iter().find(|p| p.id == id)
}

/// Sidecar entry describing one generated CA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaMetadata {
    pub profile: String,
    pub common_name: String,
    pub organization: String,
    pub created_at: String,
    pub expires_at: String,
    /// SHA-256 fingerprint of the DER certificate, lowercase hex.
    pub fingerprint: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub pem_path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataFile {
    generations: Vec<CaMetadata>,
}

/// A minted leaf certificate, cached by SNI.
#[derive(Debug)]
pub struct LeafCert {
    pub sni: String,
    /// Leaf certificate, DER.
    pub cert_der: Vec<u8>,
    /// PKCS#8 private key, DER.
    pub key_der: Vec<u8>,
    /// Unix seconds.
    pub not_after: u64,
}

impl LeafCert {
    fn expired(&self) -> bool {
        crate::types::now() >= self.not_after
    }
}

/// The certificate authority.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    /// DER of the on-disk CA certificate (what targets install).
    ca_der: Vec<u8>,
    ca_pem: String,
    metadata: CaMetadata,
    cache: Mutex<LruCache<String, Arc<LeafCert>>>,
    /// Per-SNI gates so concurrent misses coalesce on one generation.
    mint_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CertificateAuthority {
    /// Load the newest CA generation from `cert_dir`, or generate one under
    /// `profile_id` if none exists.
    pub fn open(cert_dir: &Path, profile_id: &str) -> Result<Self, CaError> {
        std::fs::create_dir_all(cert_dir)?;
        let sidecar = cert_dir.join("cert_metadata.json");
        let mut file: MetadataFile = match std::fs::read_to_string(&sidecar) {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| CaError::BadStored(format!("metadata sidecar: {e}")))?,
            Err(_) => MetadataFile::default(),
        };

        // Newest generation is active; older files stay on disk untouched.
        file.generations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(meta) = file.generations.last() {
            match Self::load(meta.clone()) {
                Ok(ca) => {
                    info!(
                        "loaded CA generation {} ({})",
                        meta.created_at, meta.fingerprint
                    );
                    return Ok(ca);
                }
                Err(e) => {
                    return Err(CaError::BadStored(format!(
                        "active CA {:?} unusable: {e}",
                        meta.cert_path
                    )))
                }
            }
        }

        let ca = Self::generate(cert_dir, profile_id)?;
        file.generations.push(ca.metadata.clone());
        std::fs::write(
            &sidecar,
            serde_json::to_string_pretty(&file).map_err(std::io::Error::other)?,
        )?;
        Ok(ca)
    }

    fn generate(cert_dir: &Path, profile_id: &str) -> Result<Self, CaError> {
        let profile =
            profile(profile_id).ok_or_else(|| CaError::UnknownProfile(profile_id.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let expires = now + Duration::days(CA_VALIDITY_DAYS);

        let key = generate_rsa_keypair()?;
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, profile.country);
        dn.push(DnType::StateOrProvinceName, profile.state);
        dn.push(DnType::LocalityName, profile.locality);
        dn.push(DnType::OrganizationName, profile.organization);
        dn.push(DnType::OrganizationalUnitName, profile.organizational_unit);
        dn.push(DnType::CommonName, profile.common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = now - Duration::minutes(1);
        params.not_after = expires;
        params.serial_number = Some(random_serial());

        let cert = params.self_signed(&key)?;
        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();
        let der = cert.der().to_vec();
        let fingerprint = hex::encode(Sha256::digest(&der));

        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let base = format!("{profile_id}_{stamp}");
        let cert_path = cert_dir.join(format!("{base}.crt"));
        let key_path = cert_dir.join(format!("{base}.key"));
        let pem_path = cert_dir.join(format!("{base}.pem"));
        for path in [&cert_path, &key_path, &pem_path] {
            if path.exists() {
                return Err(CaError::WouldOverwrite(path.clone()));
            }
        }
        std::fs::write(&cert_path, &cert_pem)?;
        std::fs::write(&key_path, &key_pem)?;
        // Combined key+cert for proxy use.
        std::fs::write(&pem_path, format!("{key_pem}{cert_pem}"))?;

        let metadata = CaMetadata {
            profile: profile_id.to_string(),
            common_name: profile.common_name.to_string(),
            organization: profile.organization.to_string(),
            created_at: crate::types::now_rfc3339(),
            expires_at: format!("{expires}"),
            fingerprint: fingerprint.clone(),
            cert_path,
            key_path,
            pem_path,
        };
        info!(
            "generated CA for profile {} (fingerprint {})",
            profile_id, fingerprint
        );

        Ok(Self {
            ca_cert: cert,
            ca_key: key,
            ca_der: der,
            ca_pem: cert_pem,
            metadata,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(LEAF_CACHE_SIZE).unwrap())),
            mint_gates: Mutex::new(HashMap::new()),
        })
    }

    fn load(metadata: CaMetadata) -> Result<Self, CaError> {
        let cert_pem = std::fs::read_to_string(&metadata.cert_path)?;
        let key_pem = std::fs::read_to_string(&metadata.key_path)?;
        let key = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        // Re-signing with the same key and subject reproduces a usable
        // issuer; the installed on-disk DER stays authoritative for export.
        let cert = params.self_signed(&key)?;

        let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::BadStored("no certificate in PEM".to_string()))?
            .map_err(|e| CaError::BadStored(e.to_string()))?
            .to_vec();

        Ok(Self {
            ca_cert: cert,
            ca_key: key,
            ca_der: der,
            ca_pem: cert_pem,
            metadata,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(LEAF_CACHE_SIZE).unwrap())),
            mint_gates: Mutex::new(HashMap::new()),
        })
    }

    pub fn metadata(&self) -> &CaMetadata {
        &self.metadata
    }

    /// CA certificate in PEM, for the installer landing page.
    pub fn export_pem(&self) -> &str {
        &self.ca_pem
    }

    /// CA certificate in DER, for mobile installation.
    pub fn export_der(&self) -> &[u8] {
        &self.ca_der
    }

    /// Combined key+cert PEM path for external proxy consumers.
    pub fn combined_pem_path(&self) -> &Path {
        &self.metadata.pem_path
    }

    /// Leaf for an SNI: cached, or minted with concurrent misses coalesced.
    pub fn leaf_for(&self, sni: &str) -> Result<Arc<LeafCert>, CaError> {
        if let Some(leaf) = self.cache_get(sni) {
            return Ok(leaf);
        }

        let gate = {
            let mut gates = self.mint_gates.lock().unwrap();
            gates
                .entry(sni.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().unwrap();

        // A coalesced waiter finds the winner's leaf here.
        if let Some(leaf) = self.cache_get(sni) {
            return Ok(leaf);
        }

        let leaf = Arc::new(self.mint(sni)?);
        self.cache.lock().unwrap().put(sni.to_string(), leaf.clone());
        self.mint_gates.lock().unwrap().remove(sni);
        debug!("minted leaf certificate for {}", sni);
        Ok(leaf)
    }

    fn cache_get(&self, sni: &str) -> Option<Arc<LeafCert>> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(sni) {
            Some(leaf) if !leaf.expired() => Some(leaf.clone()),
            Some(_) => {
                cache.pop(sni);
                None
            }
            None => None,
        }
    }

    fn mint(&self, sni: &str) -> Result<LeafCert, CaError> {
        let now = OffsetDateTime::now_utc();
        let not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        // RSA leaves, matching the CA's key material.
        let key = generate_rsa_keypair()?;
        // rcgen maps a literal-IP SNI to an iPAddress SAN, hostnames to
        // dNSName.
        let mut params = CertificateParams::new(vec![sni.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, sni);
        params.distinguished_name = dn;
        params.not_before = now - Duration::minutes(1);
        params.not_after = not_after;
        params.serial_number = Some(random_serial());

        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;
        Ok(LeafCert {
            sni: sni.to_string(),
            cert_der: cert.der().to_vec(),
            key_der: key.serialize_der(),
            not_after: not_after.unix_timestamp().max(0) as u64,
        })
    }

    /// Number of cached leaves (tests and status).
    pub fn cached_leaves(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

fn random_serial() -> SerialNumber {
    let bytes: [u8; 16] = rand::random();
    SerialNumber::from(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> (tempfile::TempDir, CertificateAuthority) {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::open(dir.path(), "wifi_security").unwrap();
        (dir, ca)
    }

    #[test]
    fn test_generate_writes_three_files_and_sidecar() {
        let (dir, ca) = test_ca();
        assert!(ca.metadata().cert_path.exists());
        assert!(ca.metadata().key_path.exists());
        assert!(ca.metadata().pem_path.exists());
        assert!(dir.path().join("cert_metadata.json").exists());
        assert_eq!(ca.metadata().fingerprint.len(), 64);
        // Combined PEM holds key then cert.
        let combined = std::fs::read_to_string(&ca.metadata().pem_path).unwrap();
        assert!(combined.contains("PRIVATE KEY"));
        assert!(combined.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_reopen_loads_same_generation() {
        let (dir, ca) = test_ca();
        let fingerprint = ca.metadata().fingerprint.clone();
        drop(ca);
        let again = CertificateAuthority::open(dir.path(), "wifi_security").unwrap();
        assert_eq!(again.metadata().fingerprint, fingerprint);
        // The exported DER equals the on-disk generation, byte for byte.
        let pem = std::fs::read_to_string(&again.metadata().cert_path).unwrap();
        let der = rustls_pemfile::certs(&mut pem.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(again.export_der(), der.as_ref());
    }

    #[test]
    fn test_unknown_profile() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CertificateAuthority::open(dir.path(), "no_such_profile"),
            Err(CaError::UnknownProfile(_))
        ));
    }

    #[test]
    fn test_leaf_mint_and_cache_reuse() {
        let (_dir, ca) = test_ca();
        let a = ca.leaf_for("example.com").unwrap();
        let b = ca.leaf_for("example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b), "second lookup must reuse the cache");
        assert_eq!(ca.cached_leaves(), 1);
        assert_eq!(a.sni, "example.com");
        assert!(!a.cert_der.is_empty());
        assert!(!a.key_der.is_empty());
    }

    #[test]
    fn test_distinct_snis_get_distinct_leaves() {
        let (_dir, ca) = test_ca();
        let a = ca.leaf_for("a.example.com").unwrap();
        let b = ca.leaf_for("b.example.com").unwrap();
        assert_ne!(a.cert_der, b.cert_der);
    }

    #[test]
    fn test_ip_literal_sni() {
        let (_dir, ca) = test_ca();
        let leaf = ca.leaf_for("93.184.216.34").unwrap();
        assert_eq!(leaf.sni, "93.184.216.34");
    }

    #[test]
    fn test_leaf_validity_window() {
        let (_dir, ca) = test_ca();
        let leaf = ca.leaf_for("example.com").unwrap();
        let now = crate::types::now();
        let thirty_days = 30 * 24 * 60 * 60;
        assert!(leaf.not_after > now + thirty_days - 3600);
        assert!(leaf.not_after < now + thirty_days + 3600);
    }

    #[test]
    fn test_lru_eviction_is_least_recently_used() {
        let (_dir, ca) = test_ca();
        // Shrink the cache to make eviction observable.
        *ca.cache.lock().unwrap() = LruCache::new(NonZeroUsize::new(2).unwrap());

        ca.leaf_for("one.test").unwrap();
        ca.leaf_for("two.test").unwrap();
        // Touch "one" so "two" becomes least recently used.
        ca.leaf_for("one.test").unwrap();
        ca.leaf_for("three.test").unwrap();

        let mut cache = ca.cache.lock().unwrap();
        assert!(cache.contains("one.test"));
        assert!(cache.contains("three.test"));
        assert!(!cache.contains("two.test"), "LRU entry must be the one evicted");
    }

    #[test]
    fn test_profiles_table() {
        assert!(profile("wifi_security").is_some());
        assert!(profile("network_optimizer").is_some());
        assert!(profile("bogus").is_none());
    }
}
