//! Certificate Authority (CA) management
//!
//! The root authority is created once per process (or reloaded from disk)
//! and signs short-lived leaf certificates for every intercepted host. Leaf
//! certificates are cached per canonical hostname and re-verified against
//! the root on every hit.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, PublicKeyData, SanType, SerialNumber,
  PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{
  CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use tokio_rustls::rustls::server::ParsedCertificate;
use tokio_rustls::rustls::RootCertStore;

/// Upper bound on cached leaf certificates
const CACHE_CAPACITY: u64 = 1000;
/// Serial numbers are at most 20 octets (160 bits)
const SERIAL_LEN: usize = 20;
/// Modulus size of the root key
const ROOT_KEY_BITS: usize = 2048;

/// Crypto provider shared by every rustls config in the crate
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Random positive serial number of up to 160 bits
fn random_serial() -> Vec<u8> {
  let mut serial = [0u8; SERIAL_LEN];
  rand::thread_rng().fill(&mut serial[..]);
  // keep it positive once DER encoded
  serial[0] &= 0x7f;
  if serial[0] == 0 {
    serial[0] = 1;
  }
  serial.to_vec()
}

/// Fresh RSA root key, signing with SHA-256
fn generate_root_key() -> Result<KeyPair> {
  let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), ROOT_KEY_BITS)
    .map_err(|e| Error::certificate_error(format!("Failed to generate RSA key: {}", e)))?;
  let der = private_key
    .to_pkcs8_der()
    .map_err(|e| Error::certificate_error(format!("Failed to encode RSA key: {}", e)))?;
  let pkcs8 = PrivatePkcs8KeyDer::from(der.as_bytes().to_vec());
  KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &PKCS_RSA_SHA256)
    .map_err(|e| Error::certificate_error(format!("Failed to load RSA key: {}", e)))
}

fn to_time(duration: Duration) -> time::Duration {
  time::Duration::seconds(duration.as_secs() as i64)
}

/// Strip the port, lower-case and drop a trailing dot.
///
/// `Example.COM.:443` becomes `example.com`, `[::1]:8443` becomes `::1`.
pub fn canonical_host(host: &str) -> String {
  let host = host.trim();
  let host = if let Some(rest) = host.strip_prefix('[') {
    rest.split(']').next().unwrap_or(rest)
  } else if host.matches(':').count() == 1 {
    host.split(':').next().unwrap_or(host)
  } else {
    host
  };
  host.trim_end_matches('.').to_ascii_lowercase()
}

/// Root authority that signs every leaf certificate
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  cert_path: PathBuf,
  organization: String,
}

impl CertificateAuthority {
  /// Load the authority from `cert_path` / `key_path`, or create and persist
  /// a new one when either file is missing, unparsable, expired or the key
  /// does not belong to the certificate.
  ///
  /// Failing to persist a new authority is fatal: without a root there is
  /// nothing to intercept TLS with.
  pub async fn load_or_create(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    validity: Duration,
    organization: &str,
  ) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();
    if cert_path.exists() && key_path.exists() {
      match Self::load(cert_path, key_path, organization).await {
        Ok(ca) => {
          tracing::info!("Loaded root certificate from {}", cert_path.display());
          return Ok(ca);
        }
        Err(e) => {
          tracing::warn!(
            "Root certificate at {} is unusable ({}), generating a new one",
            cert_path.display(),
            e
          );
        }
      }
    }
    let ca = Self::generate(cert_path, key_path, validity, organization).await?;
    tracing::info!("Generated root certificate at {}", cert_path.display());
    Ok(ca)
  }

  /// Load existing CA certificate and key
  async fn load(cert_path: &Path, key_path: &Path, organization: &str) -> Result<Self> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))?;

    {
      let (_, parsed) = x509_parser::parse_x509_certificate(&cert_der)
        .map_err(|e| Error::certificate_error(format!("Failed to parse CA cert: {}", e)))?;
      if parsed.public_key().subject_public_key.data.as_ref() != key_pair.der_bytes() {
        return Err(Error::certificate_error(
          "CA key does not match the CA certificate",
        ));
      }
      if !parsed.validity().is_valid() {
        return Err(Error::certificate_error("CA certificate is expired"));
      }
      if !parsed.is_ca() {
        return Err(Error::certificate_error("Certificate is not a CA"));
      }
    }

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;

    Ok(Self {
      issuer,
      ca_cert_der: cert_der,
      ca_cert_pem: cert_pem,
      cert_path: cert_path.to_path_buf(),
      organization: organization.to_string(),
    })
  }

  /// Generate a new CA certificate and key and write both to disk
  async fn generate(
    cert_path: &Path,
    key_path: &Path,
    validity: Duration,
    organization: &str,
  ) -> Result<Self> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from(random_serial()));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("{} Root CA", organization));
    dn.push(DnType::OrganizationName, organization);
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyEncipherment,
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - to_time(validity);
    params.not_after = now + to_time(validity);

    let key_pair = generate_root_key()?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    for path in [cert_path, key_path] {
      if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
          fs::create_dir_all(parent).await.map_err(|e| {
            Error::certificate_error(format!("Failed to create {}: {}", parent.display(), e))
          })?;
        }
      }
    }
    Self::write_file(cert_path, &cert_pem).await?;
    Self::write_file(key_path, &key_pem).await?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to create issuer: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der: cert_der,
      ca_cert_pem: cert_pem,
      cert_path: cert_path.to_path_buf(),
      organization: organization.to_string(),
    })
  }

  async fn write_file(path: &Path, contents: &str) -> Result<()> {
    let mut file = fs::File::create(path)
      .await
      .map_err(|e| Error::certificate_error(format!("Failed to write {}: {}", path.display(), e)))?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;
    Ok(())
  }

  /// Root certificate in DER
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Root certificate in PEM, for client installation
  pub fn cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Where the root certificate lives on disk
  pub fn cert_path(&self) -> &Path {
    &self.cert_path
  }

  /// Trust store containing only this root
  pub fn root_store(&self) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.add(self.ca_cert_der.clone())?;
    Ok(roots)
  }

  /// Sign a leaf for `host` carrying `key`'s public half
  fn sign_leaf(&self, host: &str, key: &KeyPair, validity: Duration) -> Result<LeafCertificate> {
    let mut params = CertificateParams::default();
    let serial = random_serial();
    params.serial_number = Some(SerialNumber::from(serial.clone()));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, self.organization.as_str());
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", host))
      })?)]
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.key_identifier_method = KeyIdMethod::Sha256;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - to_time(validity);
    params.not_after = now + to_time(validity);

    let cert = params
      .signed_by(key, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign server cert: {}", e)))?;

    Ok(LeafCertificate {
      host: host.to_string(),
      chain: vec![
        CertificateDer::from(cert.der().to_vec()),
        self.ca_cert_der.clone(),
      ],
      serial,
    })
  }
}

/// A minted leaf and the chain presented to clients
#[derive(Debug, Clone)]
pub struct LeafCertificate {
  /// Canonical hostname the leaf was issued for
  pub host: String,
  /// `[leaf, root]`
  pub chain: Vec<CertificateDer<'static>>,
  /// Serial number as encoded in the certificate
  pub serial: Vec<u8>,
}

impl LeafCertificate {
  /// The end-entity certificate
  pub fn leaf(&self) -> &CertificateDer<'static> {
    &self.chain[0]
  }
}

/// Per-host leaf certificate cache
///
/// All leaves share one signing key generated when the cache is built.
/// Concurrent misses for the same host may both mint a certificate; the
/// last insert wins and both results are valid.
pub struct CertificateCache {
  ca: Arc<CertificateAuthority>,
  signing_key: KeyPair,
  roots: Arc<RootCertStore>,
  provider: Arc<CryptoProvider>,
  validity: Duration,
  entries: Cache<String, Arc<LeafCertificate>>,
}

impl CertificateCache {
  /// Create a cache issuing leaves valid for `validity` around their creation
  pub fn new(ca: Arc<CertificateAuthority>, validity: Duration) -> Result<Self> {
    let signing_key = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;
    let roots = Arc::new(ca.root_store()?);
    let entries = Cache::builder().max_capacity(CACHE_CAPACITY).build();
    Ok(Self {
      ca,
      signing_key,
      roots,
      provider: crypto_provider(),
      validity,
      entries,
    })
  }

  /// The root authority behind this cache
  pub fn authority(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }

  /// Private key matching every leaf this cache hands out
  pub fn private_key(&self) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::try_from(self.signing_key.serialize_der())
      .map_err(|_| Error::certificate_error("Failed to serialize leaf key"))
  }

  /// Return a verified leaf for `hostname`, minting one on miss or when the
  /// cached entry no longer verifies.
  pub async fn get_or_create(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
    let host = canonical_host(hostname);
    if host.is_empty() {
      return Err(Error::certificate_error(format!(
        "Invalid hostname: {:?}",
        hostname
      )));
    }
    if let Some(cached) = self.entries.get(&host).await {
      if self.verify(&host, &cached) {
        return Ok(cached);
      }
      tracing::debug!("Cached certificate for {} failed verification", host);
    }
    let leaf = Arc::new(self.ca.sign_leaf(&host, &self.signing_key, self.validity)?);
    self.entries.insert(host.clone(), leaf.clone()).await;
    tracing::debug!("Minted certificate for {}", host);
    Ok(leaf)
  }

  /// Chain and name check against the root
  fn verify(&self, host: &str, leaf: &LeafCertificate) -> bool {
    let Ok(cert) = ParsedCertificate::try_from(leaf.leaf()) else {
      return false;
    };
    let chained = rustls::client::verify_server_cert_signed_by_trust_anchor(
      &cert,
      &self.roots,
      &[],
      UnixTime::now(),
      self.provider.signature_verification_algorithms.all,
    );
    if chained.is_err() {
      return false;
    }
    match ServerName::try_from(host.to_string()) {
      Ok(name) => rustls::client::verify_server_name(&cert, &name).is_ok(),
      Err(_) => false,
    }
  }
}
