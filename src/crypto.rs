//! Cryptography provider.
//!
//! Everything that touches key material goes through here: key generation
//! per algorithm, public-half derivation, CSR construction and signing,
//! X.509 issuance from a CSR, and the checksum used to detect artefact
//! changes. The rest of the daemon only ever sees PEM byte buffers.

use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509Name, X509NameBuilder, X509Req, X509ReqBuilder, X509};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::error::{Error, Result};
use crate::resources::DistinguishedName;

// X509 version 3 is represented by 2, CSR version 1 by 0.
const X509_VERSION_3: i32 = 2;
const CSR_VERSION_1: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    #[serde(rename = "rsa")]
    Rsa,
    #[serde(rename = "ecdsa")]
    Ecdsa,
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        KeyAlgorithm::Rsa
    }
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KeyAlgorithm::Rsa => "rsa",
            KeyAlgorithm::Ecdsa => "ecdsa",
            KeyAlgorithm::Ed25519 => "ed25519",
        };
        f.write_str(name)
    }
}

/// Options applied when signing a CSR into a certificate.
#[derive(Debug, Clone)]
pub struct CertificateOptions {
    pub serial: i64,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    pub ca_length: u32,
}

/// Check an algorithm/length combination before any key is generated.
pub fn validate_key_spec(algorithm: KeyAlgorithm, bits: u32) -> Result<()> {
    match algorithm {
        KeyAlgorithm::Rsa => {
            if !(1024..=32768).contains(&bits) {
                return Err(Error::LengthOutOfBounds);
            }
        }
        KeyAlgorithm::Ecdsa => {
            curve_for(bits)?;
        }
        KeyAlgorithm::Ed25519 => {
            if bits != 256 {
                return Err(Error::WrongKeyLengthEd25519);
            }
        }
    }
    Ok(())
}

fn curve_for(bits: u32) -> Result<Nid> {
    match bits {
        224 => Ok(Nid::SECP224R1),
        256 => Ok(Nid::X9_62_PRIME256V1),
        384 => Ok(Nid::SECP384R1),
        521 => Ok(Nid::SECP521R1),
        _ => Err(Error::WrongKeyLength),
    }
}

/// Generate a fresh private key and return it as PKCS#8 PEM.
pub fn generate_key(algorithm: KeyAlgorithm, bits: u32) -> Result<Vec<u8>> {
    validate_key_spec(algorithm, bits)?;
    let key = match algorithm {
        KeyAlgorithm::Rsa => PKey::from_rsa(Rsa::generate(bits)?)?,
        KeyAlgorithm::Ecdsa => {
            let group = EcGroup::from_curve_name(curve_for(bits)?)?;
            PKey::from_ec_key(EcKey::generate(&group)?)?
        }
        KeyAlgorithm::Ed25519 => PKey::generate_ed25519()?,
    };
    Ok(key.private_key_to_pem_pkcs8()?)
}

pub fn load_private_key(pem: &[u8]) -> Result<PKey<Private>> {
    Ok(PKey::private_key_from_pem(pem)?)
}

/// Derive the PEM-encoded public half of a private key.
pub fn public_key_pem(key: &PKey<Private>) -> Result<Vec<u8>> {
    Ok(key.public_key_to_pem()?)
}

pub fn parse_certificate(pem: &[u8]) -> Result<X509> {
    Ok(X509::from_pem(pem)?)
}

// Ed25519 is a one-shot signature scheme; openssl requires the null digest
// for it, everything else signs over SHA-256.
fn digest_for(key: &PKeyRef<Private>) -> MessageDigest {
    if key.id() == Id::ED25519 {
        MessageDigest::null()
    } else {
        MessageDigest::sha256()
    }
}

fn build_name(subject: &DistinguishedName) -> Result<X509Name> {
    let mut builder = X509NameBuilder::new()?;
    if !subject.serial.is_empty() {
        builder.append_entry_by_nid(Nid::SERIALNUMBER, &subject.serial)?;
    }
    if !subject.common_name.is_empty() {
        builder.append_entry_by_nid(Nid::COMMONNAME, &subject.common_name)?;
    }
    for value in &subject.country {
        builder.append_entry_by_nid(Nid::COUNTRYNAME, value)?;
    }
    for value in &subject.organization {
        builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, value)?;
    }
    for value in &subject.organizational_unit {
        builder.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, value)?;
    }
    for value in &subject.locality {
        builder.append_entry_by_nid(Nid::LOCALITYNAME, value)?;
    }
    for value in &subject.province {
        builder.append_entry_by_nid(Nid::STATEORPROVINCENAME, value)?;
    }
    for value in &subject.street_address {
        builder.append_entry_by_nid(Nid::STREETADDRESS, value)?;
    }
    for value in &subject.postal_code {
        builder.append_entry_by_nid(Nid::POSTALCODE, value)?;
    }
    Ok(builder.build())
}

/// Build and sign a certificate sign request, returned as PEM.
pub fn build_request(
    key: &PKey<Private>,
    subject: &DistinguishedName,
    dns_names: &[String],
    email_addresses: &[String],
    ip_addresses: &[IpAddr],
) -> Result<Vec<u8>> {
    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(CSR_VERSION_1)?;
    let name = build_name(subject)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;

    if !dns_names.is_empty() || !email_addresses.is_empty() || !ip_addresses.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for dns in dns_names {
            san.dns(dns);
        }
        for mail in email_addresses {
            san.email(mail);
        }
        for ip in ip_addresses {
            san.ip(&ip.to_string());
        }
        let extension = san.build(&builder.x509v3_context(None))?;
        let mut extensions = Stack::new()?;
        extensions.push(extension)?;
        builder.add_extensions(&extensions)?;
    }

    builder.sign(key, digest_for(key))?;
    Ok(builder.build().to_pem()?)
}

/// Sign a CSR into a certificate. With `issuer = None` the certificate is
/// self-signed and the issuer name is taken from the request itself.
pub fn sign_request(
    csr_pem: &[u8],
    signer: &PKey<Private>,
    issuer: Option<&X509>,
    opts: &CertificateOptions,
) -> Result<Vec<u8>> {
    let request = X509Req::from_pem(csr_pem)?;
    let request_key = request.public_key()?;
    if !request.verify(&request_key)? {
        return Err(Error::BadRequestSignature);
    }

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;

    let serial = BigNum::from_dec_str(&opts.serial.to_string())?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;

    builder.set_subject_name(request.subject_name())?;
    match issuer {
        Some(cert) => builder.set_issuer_name(cert.subject_name())?,
        None => builder.set_issuer_name(request.subject_name())?,
    }
    builder.set_pubkey(&request_key)?;

    let not_before = Asn1Time::from_unix(opts.not_before.timestamp())?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::from_unix(opts.not_after.timestamp())?;
    builder.set_not_after(&not_after)?;

    if opts.is_ca {
        let mut constraints = BasicConstraints::new();
        constraints.critical().ca().pathlen(opts.ca_length);
        builder.append_extension(constraints.build()?)?;
        let mut usage = KeyUsage::new();
        usage.critical().key_cert_sign().crl_sign().digital_signature();
        builder.append_extension(usage.build()?)?;
    } else {
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
    }

    builder.sign(signer, digest_for(signer))?;
    Ok(builder.build().to_pem()?)
}

/// SHA-512 of the PEM bytes, rendered as standard base64.
pub fn checksum(pem: &[u8]) -> String {
    BASE64.encode(Sha512::digest(pem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn subject(cn: &str) -> DistinguishedName {
        DistinguishedName {
            common_name: cn.to_string(),
            organization: vec!["example".to_string()],
            ..DistinguishedName::default()
        }
    }

    #[test]
    fn key_spec_bounds() {
        assert!(validate_key_spec(KeyAlgorithm::Rsa, 1024).is_ok());
        assert!(validate_key_spec(KeyAlgorithm::Rsa, 512).is_err());
        assert!(validate_key_spec(KeyAlgorithm::Rsa, 65536).is_err());
        assert!(validate_key_spec(KeyAlgorithm::Ecdsa, 256).is_ok());
        assert!(validate_key_spec(KeyAlgorithm::Ecdsa, 255).is_err());
        assert!(validate_key_spec(KeyAlgorithm::Ed25519, 256).is_ok());
        assert!(validate_key_spec(KeyAlgorithm::Ed25519, 512).is_err());
    }

    #[test]
    fn generated_keys_round_trip() {
        for (algorithm, bits) in [
            (KeyAlgorithm::Ecdsa, 256),
            (KeyAlgorithm::Ed25519, 256),
            (KeyAlgorithm::Rsa, 1024),
        ] {
            let pem = generate_key(algorithm, bits).unwrap();
            let key = load_private_key(&pem).unwrap();
            let public = public_key_pem(&key).unwrap();
            assert!(public.starts_with(b"-----BEGIN PUBLIC KEY-----"));
        }
    }

    #[test]
    fn request_and_self_signed_certificate() {
        let pem = generate_key(KeyAlgorithm::Ecdsa, 256).unwrap();
        let key = load_private_key(&pem).unwrap();
        let csr = build_request(
            &key,
            &subject("server.example"),
            &["server.example".to_string()],
            &[],
            &["127.0.0.1".parse().unwrap()],
        )
        .unwrap();

        let now = Utc::now();
        let cert_pem = sign_request(
            &csr,
            &key,
            None,
            &CertificateOptions {
                serial: 42,
                not_before: now,
                not_after: now + Duration::days(1),
                is_ca: true,
                ca_length: 0,
            },
        )
        .unwrap();

        let cert = parse_certificate(&cert_pem).unwrap();
        assert_eq!(
            cert.issued(&cert),
            openssl::x509::X509VerifyResult::OK,
            "self-signed certificate must be its own issuer"
        );
    }

    #[test]
    fn ed25519_signs_requests() {
        let pem = generate_key(KeyAlgorithm::Ed25519, 256).unwrap();
        let key = load_private_key(&pem).unwrap();
        let csr = build_request(&key, &subject("ed.example"), &[], &[], &[]).unwrap();
        assert!(csr.starts_with(b"-----BEGIN CERTIFICATE REQUEST-----"));
    }

    #[test]
    fn checksum_is_stable_base64() {
        let sum = checksum(b"hello");
        assert_eq!(sum, checksum(b"hello"));
        assert_ne!(sum, checksum(b"world"));
        // SHA-512 is 64 bytes, base64 of which is 88 characters.
        assert_eq!(sum.len(), 88);
    }
}
