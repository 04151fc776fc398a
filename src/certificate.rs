//! Certificate handling for the TLS listener
//! Generates self-signed server certificates and loads operator-supplied PEM files

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, SubjectPublicKeyInfo};
use x509_parser::parse_x509_certificate;

/// Organization recorded in the subject of generated certificates
pub const ORGANIZATION: &str = "Fictitious Co";

/// Lifetime of a generated certificate
pub const VALIDITY_DAYS: i64 = 365;

/// Serial numbers carry this many random bytes (128 bits)
const SERIAL_NUMBER_BYTES: usize = 16;

/// Errors raised while producing a certificate bundle
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate identity must not be empty")]
    InvalidIdentity,

    #[error("failed to generate private key: {0}")]
    KeyGeneration(#[source] rcgen::Error),

    #[error("failed to generate serial number: {0}")]
    SerialNumber(#[source] rand::Error),

    #[error("failed to generate self-signed certificate: {0}")]
    CertificateEncoding(#[source] rcgen::Error),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no PEM certificate found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no PEM private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("unsupported private key in {}: {source}", path.display())]
    UnsupportedKey {
        path: PathBuf,
        #[source]
        source: rcgen::Error,
    },

    #[error("private key in {} does not match the certificate's public key", .0.display())]
    KeyMismatch(PathBuf),
}

/// Where a bundle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateOrigin {
    Generated,
    Loaded,
}

/// A certificate chain (leaf first) and the private key of the leaf
#[derive(Debug)]
pub struct CertificateBundle {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    origin: CertificateOrigin,
}

impl CertificateBundle {
    /// Generate a fresh self-signed server certificate for `identity`.
    ///
    /// An identity that parses as an IP address is recorded as an IP SAN,
    /// anything else as a DNS SAN. The certificate is valid from now for
    /// exactly [`VALIDITY_DAYS`] days and is signed with its own key.
    pub fn generate_self_signed(identity: &str) -> Result<Self, CertificateError> {
        if identity.is_empty() {
            return Err(CertificateError::InvalidIdentity);
        }

        let key_pair =
            KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(CertificateError::KeyGeneration)?;

        let params = Self::server_params(identity, random_serial()?)?;

        let cert = params
            .self_signed(&key_pair)
            .map_err(CertificateError::CertificateEncoding)?;

        debug!("Generated certificate for {} ({} bytes)", identity, cert.der().len());

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        Ok(Self {
            chain: vec![cert.der().clone()],
            key,
            origin: CertificateOrigin::Generated,
        })
    }

    /// Load a PEM certificate chain and private key verbatim
    pub fn load_pem<P: AsRef<Path>, Q: AsRef<Path>>(
        cert_path: P,
        key_path: Q,
    ) -> Result<Self, CertificateError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let mut reader = open_pem(cert_path)?;
        let chain = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| CertificateError::Read {
                path: cert_path.to_path_buf(),
                source,
            })?;
        if chain.is_empty() {
            return Err(CertificateError::NoCertificates(cert_path.to_path_buf()));
        }

        let mut reader = open_pem(key_path)?;
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|source| CertificateError::Read {
                path: key_path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| CertificateError::NoPrivateKey(key_path.to_path_buf()))?;

        check_key_matches(&chain[0], &key, key_path)?;

        info!(
            "Loaded certificate chain of {} from {}",
            chain.len(),
            cert_path.display()
        );

        Ok(Self {
            chain,
            key,
            origin: CertificateOrigin::Loaded,
        })
    }

    /// Build the template for a leaf server certificate
    fn server_params(
        identity: &str,
        serial: SerialNumber,
    ) -> Result<CertificateParams, CertificateError> {
        let mut params = CertificateParams::default();

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = distinguished_name;

        params.serial_number = Some(serial);
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = params.not_before + Duration::days(VALIDITY_DAYS);

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::ExplicitNoCa;

        let san = match identity.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                identity
                    .try_into()
                    .map_err(CertificateError::CertificateEncoding)?,
            ),
        };
        params.subject_alt_names = vec![san];

        Ok(params)
    }

    /// The leaf certificate
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    pub fn origin(&self) -> CertificateOrigin {
        self.origin
    }

    /// Split into the owned chain and key for the TLS stack
    pub fn into_parts(self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        (self.chain, self.key)
    }
}

fn random_serial() -> Result<SerialNumber, CertificateError> {
    let mut bytes = [0u8; SERIAL_NUMBER_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(CertificateError::SerialNumber)?;
    Ok(SerialNumber::from_slice(&bytes))
}

/// The leaf's public key must be the one derived from `key`
fn check_key_matches(
    leaf: &CertificateDer<'_>,
    key: &PrivateKeyDer<'_>,
    key_path: &Path,
) -> Result<(), CertificateError> {
    let key_pair = KeyPair::try_from(key).map_err(|source| CertificateError::UnsupportedKey {
        path: key_path.to_path_buf(),
        source,
    })?;
    let derived_spki = key_pair.public_key_der();

    let leaf_key = parse_x509_certificate(leaf.as_ref())
        .ok()
        .map(|(_, cert)| cert.public_key().subject_public_key.data.to_vec());
    let derived_key = SubjectPublicKeyInfo::from_der(&derived_spki)
        .ok()
        .map(|(_, spki)| spki.subject_public_key.data.to_vec());

    match (leaf_key, derived_key) {
        (Some(leaf_key), Some(derived_key)) if leaf_key == derived_key => Ok(()),
        _ => Err(CertificateError::KeyMismatch(key_path.to_path_buf())),
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>, CertificateError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use x509_parser::extensions::GeneralName;

    fn sans(der: &[u8]) -> (Vec<String>, Vec<Vec<u8>>) {
        let (_, cert) = parse_x509_certificate(der).unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();

        let mut dns = Vec::new();
        let mut ips = Vec::new();
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(n) => dns.push(n.to_string()),
                GeneralName::IPAddress(ip) => ips.push(ip.to_vec()),
                _ => {}
            }
        }
        (dns, ips)
    }

    #[test]
    fn test_localhost_certificate() {
        let bundle = CertificateBundle::generate_self_signed("localhost").unwrap();
        assert_eq!(bundle.origin(), CertificateOrigin::Generated);
        assert_eq!(bundle.chain().len(), 1);

        let (dns, ips) = sans(bundle.certificate());
        assert_eq!(dns, vec!["localhost".to_string()]);
        assert!(ips.is_empty());

        let (_, cert) = parse_x509_certificate(bundle.certificate()).unwrap();
        let org = cert.subject().iter_organization().next().unwrap();
        assert_eq!(org.as_str().unwrap(), "Fictitious Co");

        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.server_auth);
        assert!(!eku.value.client_auth);

        let key_usage = cert.key_usage().unwrap().unwrap();
        assert!(key_usage.value.digital_signature());
        assert!(key_usage.value.key_encipherment());
        assert!(!key_usage.value.key_cert_sign());

        let constraints = cert.basic_constraints().unwrap().unwrap();
        assert!(!constraints.value.ca);
    }

    #[test]
    fn test_ipv4_identity() {
        let bundle = CertificateBundle::generate_self_signed("127.0.0.1").unwrap();

        let (dns, ips) = sans(bundle.certificate());
        assert!(dns.is_empty());
        assert_eq!(ips, vec![vec![127, 0, 0, 1]]);
    }

    #[test]
    fn test_ipv6_identity() {
        let bundle = CertificateBundle::generate_self_signed("::1").unwrap();

        let (dns, ips) = sans(bundle.certificate());
        assert!(dns.is_empty());
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0], "::1".parse::<std::net::Ipv6Addr>().unwrap().octets().to_vec());
    }

    #[test]
    fn test_hostname_identity() {
        let bundle = CertificateBundle::generate_self_signed("proxy.example.com").unwrap();

        let (dns, ips) = sans(bundle.certificate());
        assert_eq!(dns, vec!["proxy.example.com".to_string()]);
        assert!(ips.is_empty());
    }

    #[test]
    fn test_validity_is_one_year() {
        let bundle = CertificateBundle::generate_self_signed("localhost").unwrap();
        let (_, cert) = parse_x509_certificate(bundle.certificate()).unwrap();

        let validity = cert.validity();
        let span = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert_eq!(span, 365 * 24 * 60 * 60);

        let now = OffsetDateTime::now_utc().unix_timestamp();
        assert!((validity.not_before.timestamp() - now).abs() < 60);
    }

    #[test]
    fn test_generation_is_not_deterministic() {
        let first = CertificateBundle::generate_self_signed("localhost").unwrap();
        let second = CertificateBundle::generate_self_signed("localhost").unwrap();

        let (_, a) = parse_x509_certificate(first.certificate()).unwrap();
        let (_, b) = parse_x509_certificate(second.certificate()).unwrap();

        assert_ne!(a.raw_serial(), b.raw_serial());
        assert_ne!(a.public_key().raw, b.public_key().raw);
        assert_ne!(
            first.private_key().secret_der(),
            second.private_key().secret_der()
        );
    }

    #[test]
    fn test_certificate_is_self_signed() {
        let bundle = CertificateBundle::generate_self_signed("localhost").unwrap();
        let other = CertificateBundle::generate_self_signed("localhost").unwrap();

        let (_, cert) = parse_x509_certificate(bundle.certificate()).unwrap();
        let (_, unrelated) = parse_x509_certificate(other.certificate()).unwrap();

        assert_eq!(cert.issuer().to_string(), cert.subject().to_string());
        assert!(cert.verify_signature(None).is_ok());
        assert!(cert.verify_signature(Some(unrelated.public_key())).is_err());
    }

    #[test]
    fn test_empty_identity_rejected() {
        let result = CertificateBundle::generate_self_signed("");
        assert!(matches!(result, Err(CertificateError::InvalidIdentity)));
    }

    #[test]
    fn test_non_ascii_hostname_rejected() {
        let result = CertificateBundle::generate_self_signed("bücher.example");
        assert!(matches!(
            result,
            Err(CertificateError::CertificateEncoding(_))
        ));
    }

    #[test]
    fn test_load_pem_files() {
        let dir = tempdir().unwrap();
        let issued = rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        let cert_path = dir.path().join("example.com.crt");
        let key_path = dir.path().join("example.com.key");
        fs::write(&cert_path, issued.cert.pem()).unwrap();
        fs::write(&key_path, issued.key_pair.serialize_pem()).unwrap();

        let bundle = CertificateBundle::load_pem(&cert_path, &key_path).unwrap();

        assert_eq!(bundle.origin(), CertificateOrigin::Loaded);
        assert_eq!(bundle.certificate().as_ref(), issued.cert.der().as_ref());
        assert_eq!(
            bundle.private_key().secret_der(),
            issued.key_pair.serialize_der().as_slice()
        );
    }

    #[test]
    fn test_load_pem_rejects_foreign_key() {
        let dir = tempdir().unwrap();
        let first = rcgen::generate_simple_self_signed(vec!["a.example".to_string()]).unwrap();
        let second = rcgen::generate_simple_self_signed(vec!["b.example".to_string()]).unwrap();
        let cert_path = dir.path().join("a.crt");
        let key_path = dir.path().join("b.key");
        fs::write(&cert_path, first.cert.pem()).unwrap();
        fs::write(&key_path, second.key_pair.serialize_pem()).unwrap();

        let result = CertificateBundle::load_pem(&cert_path, &key_path);

        match result {
            Err(CertificateError::KeyMismatch(path)) => assert_eq!(path, key_path),
            other => panic!("expected key mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_generated_key_matches_certificate() {
        let bundle = CertificateBundle::generate_self_signed("localhost").unwrap();
        check_key_matches(
            bundle.certificate(),
            bundle.private_key(),
            Path::new("generated"),
        )
        .unwrap();
    }

    #[test]
    fn test_load_pem_missing_file() {
        let dir = tempdir().unwrap();
        let result = CertificateBundle::load_pem(dir.path().join("nope.crt"), dir.path().join("nope.key"));
        assert!(matches!(result, Err(CertificateError::Read { .. })));
    }

    #[test]
    fn test_load_pem_key_file_without_key() {
        let dir = tempdir().unwrap();
        let issued = rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        let cert_path = dir.path().join("example.com.crt");
        fs::write(&cert_path, issued.cert.pem()).unwrap();

        // A certificate is not a key
        let result = CertificateBundle::load_pem(&cert_path, &cert_path);
        assert!(matches!(result, Err(CertificateError::NoPrivateKey(_))));
    }

    #[test]
    fn test_load_pem_empty_certificate_file() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("empty.crt");
        fs::write(&cert_path, "").unwrap();

        let result = CertificateBundle::load_pem(&cert_path, &cert_path);
        assert!(matches!(result, Err(CertificateError::NoCertificates(_))));
    }
}
