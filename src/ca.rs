//! Certificate authority and leaf cache for TLS interception.
//!
//! The root pair lives on disk under a configured directory and is
//! generated on first use. Leaves are minted per name-set, signed by the
//! root, and cached in memory only; concurrent misses for the same name
//! set collapse to a single mint.

use crate::errors::{Error, Result, TlsCode};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use sha1::{Digest, Sha1};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Leaf validity period in seconds (1 year).
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cache time-to-live in seconds (half the leaf validity).
const CACHE_TTL: u64 = (TTL_SECS / 2) as u64;
/// Offset for not_before to absorb clock skew (60 seconds).
const NOT_BEFORE_OFFSET: i64 = 60;
/// Bound on cached leaves; evicted entries are reissued on demand.
const CACHE_CAPACITY: u64 = 1000;

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// The root pair and the ability to mint leaves under it.
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Loads the root pair from `storage_path`, generating and persisting a
  /// new one when absent. The private key file is written with mode 0600.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }
    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);

    let (issuer, ca_cert_der) = if cert_path.exists() && key_path.exists() {
      Self::load_root(&cert_path, &key_path).await?
    } else {
      Self::generate_root(&cert_path, &key_path).await?
    };

    Ok(Self {
      issuer,
      ca_cert_der,
      storage_path,
    })
  }

  async fn load_root(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem).map_err(|error| {
      tracing::error!("failed to parse CA key: {}", error);
      Error::from(TlsCode::CertificateStoreError)
    })?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|error| {
      tracing::error!("failed to load CA certificate: {}", error);
      Error::from(TlsCode::CertificateStoreError)
    })?;
    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or(TlsCode::CertificateStoreError)?
      .map_err(|_| TlsCode::CertificateStoreError)?;
    Ok((issuer, cert_der))
  }

  async fn generate_root(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Snare Proxy CA");
    dn.push(DnType::OrganizationName, "Snare");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate().map_err(|error| {
      tracing::error!("failed to generate CA key pair: {}", error);
      Error::from(TlsCode::CertificateCreationError)
    })?;
    let cert = params.self_signed(&key_pair).map_err(|error| {
      tracing::error!("failed to self-sign CA certificate: {}", error);
      Error::from(TlsCode::CertificateCreationError)
    })?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;

    let mut key_file = fs::File::create(key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|_| TlsCode::CertificateStoreError)?;
    Ok((issuer, cert_der))
  }

  /// Mints a leaf covering `names`, CN set to `primary`, signed by the
  /// root. Returns the chain `[leaf, root]` and the leaf key.
  pub fn mint_leaf(
    &self,
    primary: &str,
    names: &BTreeSet<String>,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, primary);
    params.distinguished_name = dn;

    let mut sans = Vec::new();
    for name in names {
      if let Ok(ip) = name.parse::<IpAddr>() {
        sans.push(SanType::IpAddress(ip));
        // Some clients check dNSName even for IP targets; carrying both
        // maximizes compatibility for local addresses.
        if let Ok(dns) = name.as_str().try_into() {
          sans.push(SanType::DnsName(dns));
        }
      } else {
        match name.as_str().try_into() {
          Ok(dns) => sans.push(SanType::DnsName(dns)),
          Err(_) => tracing::debug!("skipping invalid SAN entry: {}", name),
        }
      }
    }
    if sans.is_empty() {
      return Err(TlsCode::CertificateCreationError.into());
    }
    params.subject_alt_names = sans;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair =
      KeyPair::generate().map_err(|_| Error::from(TlsCode::CertificateCreationError))?;
    let cert = params.signed_by(&key_pair, &self.issuer).map_err(|error| {
      tracing::error!("failed to sign leaf for {}: {}", primary, error);
      Error::from(TlsCode::CertificateCreationError)
    })?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| TlsCode::CertificateCreationError)?;
    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der))
  }

  /// The root certificate in PEM form, for installation in client trust
  /// stores.
  pub fn ca_cert_pem(&self) -> Result<String> {
    std::fs::read_to_string(self.ca_cert_path()).map_err(|error| {
      tracing::error!("failed to read CA certificate: {}", error);
      TlsCode::CertificateStoreError.into()
    })
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }
}

struct MintedLeaf {
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

/// Process-wide cache of CA-signed leaves, keyed by the fingerprint of the
/// sorted name set.
pub struct CertificateStore {
  ca: CertificateAuthority,
  cache: Cache<String, Arc<MintedLeaf>>,
}

impl CertificateStore {
  /// Opens or creates the CA under `storage_path` and an empty leaf cache.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::new(storage_path).await?;
    let cache = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();
    Ok(Self { ca, cache })
  }

  /// Returns the cached leaf for this name set, minting it on a miss.
  /// Concurrent misses for the same key produce exactly one mint; nothing
  /// is inserted when minting fails.
  pub async fn leaf_for(
    &self,
    primary: &str,
    names: &BTreeSet<String>,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let key = Self::fingerprint(primary, names);
    let leaf = self
      .cache
      .try_get_with(key, async {
        self
          .ca
          .mint_leaf(primary, names)
          .map(|(chain, key)| Arc::new(MintedLeaf { chain, key }))
      })
      .await
      .map_err(|error: Arc<Error>| *error)?;
    Ok((leaf.chain.clone(), leaf.key.clone_key()))
  }

  /// `(primary-name, sorted-SAN-hash)` cache key.
  fn fingerprint(primary: &str, names: &BTreeSet<String>) -> String {
    let mut hasher = Sha1::new();
    for name in names {
      hasher.update(name.as_bytes());
      hasher.update([0u8]);
    }
    format!("{}|{:x}", primary, hasher.finalize())
  }

  /// The root certificate in PEM form.
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.ca.ca_cert_pem()
  }

  /// Path of the persisted root certificate.
  pub fn ca_cert_path(&self) -> PathBuf {
    self.ca.ca_cert_path()
  }
}
