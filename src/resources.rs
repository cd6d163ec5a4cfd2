//! Typed resource model.
//!
//! The graph is made of eight resource variants sharing one capability set:
//! identity, dependency declaration, refresh, refresh interval, PEM output
//! and checksum. The variants are kept as a sum type (`Resource`) because
//! persistence, lookup and removal all dispatch on the type tag anyway; the
//! borrowed view (`ResourceRef`) serves lookups that must not move a node
//! out of its table.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::{self, CertificateOptions, KeyAlgorithm};
use crate::error::{Error, Result};
use crate::storage::Storage;

/// Upper bound on random draws before a serial generator gives up.
const MAX_SERIAL_DRAWS: u32 = 1024;

// ============================================================================
// Identity
// ============================================================================

/// The closed set of resource types. `Unknown` only ever shows up when a
/// client sends a request without (or with a bogus) type tag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ResourceType {
    #[serde(rename = "private")]
    PrivateKey,
    #[serde(rename = "public")]
    PublicKey,
    #[serde(rename = "csr")]
    Csr,
    #[serde(rename = "cert")]
    Certificate,
    #[serde(rename = "location")]
    Location,
    #[serde(rename = "serial")]
    Serial,
    #[serde(rename = "subject")]
    Subject,
    #[serde(rename = "ca")]
    Ca,
    #[serde(rename = "unknown")]
    #[default]
    Unknown,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::PrivateKey => "private",
            ResourceType::PublicKey => "public",
            ResourceType::Csr => "csr",
            ResourceType::Certificate => "cert",
            ResourceType::Location => "location",
            ResourceType::Serial => "serial",
            ResourceType::Subject => "subject",
            ResourceType::Ca => "ca",
            ResourceType::Unknown => "unknown",
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        match input {
            "private" => Ok(ResourceType::PrivateKey),
            "public" => Ok(ResourceType::PublicKey),
            "csr" => Ok(ResourceType::Csr),
            "cert" => Ok(ResourceType::Certificate),
            "location" => Ok(ResourceType::Location),
            "serial" => Ok(ResourceType::Serial),
            "subject" => Ok(ResourceType::Subject),
            "ca" => Ok(ResourceType::Ca),
            _ => Err(Error::UnknownType),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identity of a resource. The canonical string form `<type>/<id>`
/// keys the dependency index and names dependencies on the wire.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ResourceName {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub rtype: ResourceType,
}

impl ResourceName {
    pub fn new(rtype: ResourceType, id: impl Into<String>) -> Self {
        ResourceName {
            id: id.into(),
            rtype,
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let (rtype, id) = input.split_once('/').ok_or(Error::UnknownType)?;
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        Ok(ResourceName::new(ResourceType::parse(rtype)?, id))
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rtype, self.id)
    }
}

// ============================================================================
// Refresh intervals
// ============================================================================

/// Timing information used by the scheduler to decide when a resource is
/// due. A `refresh_after` of zero means the resource is never due.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Interval {
    pub created: DateTime<Utc>,
    pub last_refresh: DateTime<Utc>,
    /// Seconds between refreshes; zero disables scheduling.
    pub refresh_after: i64,
    /// Seconds after which the artefact is considered invalid.
    pub invalid_after: i64,
}

impl Interval {
    pub fn never() -> Self {
        Interval::default()
    }

    pub fn starting_now(refresh_after: i64, invalid_after: i64) -> Self {
        Interval {
            created: Utc::now(),
            last_refresh: DateTime::<Utc>::default(),
            refresh_after,
            invalid_after,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.refresh_after > 0
    }

    pub fn next_due(&self) -> DateTime<Utc> {
        self.last_refresh + Duration::try_seconds(self.refresh_after).unwrap_or_else(Duration::zero)
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Utc::now();
    }
}

// base64-encoded byte blobs, the shape the persisted document carries PEM
// caches in.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Subject
// ============================================================================

/// An X.509 distinguished name, stored field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DistinguishedName {
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub country: Vec<String>,
    #[serde(default)]
    pub organization: Vec<String>,
    #[serde(default)]
    pub organizational_unit: Vec<String>,
    #[serde(default)]
    pub locality: Vec<String>,
    #[serde(default)]
    pub province: Vec<String>,
    #[serde(default)]
    pub street_address: Vec<String>,
    #[serde(default)]
    pub postal_code: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub data: DistinguishedName,
}

impl Subject {
    pub fn new(id: &str, data: DistinguishedName) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        Ok(Subject {
            id: id.to_string(),
            data,
        })
    }

    pub fn name(&self) -> ResourceName {
        ResourceName::new(ResourceType::Subject, &self.id)
    }

    // Subjects are pure data; there is nothing to derive.
    pub fn refresh(&mut self, _store: &mut Storage) -> Result<()> {
        Ok(())
    }

    pub fn depends_on(&self) -> Vec<ResourceName> {
        Vec::new()
    }
}

// ============================================================================
// Serial generator
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Serial {
    pub id: String,
    pub min: i64,
    pub max: i64,
    #[serde(default)]
    pub issued: BTreeSet<i64>,
}

impl Serial {
    pub fn new(id: &str, min: i64, max: i64) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        if max - min < 1 {
            return Err(Error::LengthTooSmall);
        }
        Ok(Serial {
            id: id.to_string(),
            min,
            max,
            issued: BTreeSet::new(),
        })
    }

    pub fn name(&self) -> ResourceName {
        ResourceName::new(ResourceType::Serial, &self.id)
    }

    pub fn refresh(&mut self, _store: &mut Storage) -> Result<()> {
        // Depending resources pull fresh numbers themselves.
        Ok(())
    }

    pub fn depends_on(&self) -> Vec<ResourceName> {
        Vec::new()
    }

    /// Draw a serial number from `[min, max)` that was never handed out
    /// before. Gives up after a bounded number of draws so a nearly
    /// exhausted range fails instead of spinning.
    pub fn generate(&mut self) -> Result<i64> {
        let span = self.max - self.min;
        if span < 1 {
            return Err(Error::LengthTooSmall);
        }
        for _ in 0..MAX_SERIAL_DRAWS {
            let candidate = self.min + OsRng.gen_range(0..span);
            if self.issued.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::SerialExhausted)
    }
}

// ============================================================================
// Private key
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateKey {
    pub id: String,
    pub algorithm: KeyAlgorithm,
    pub bits: u32,
    #[serde(with = "base64_bytes", default)]
    key: Vec<u8>,
}

impl PrivateKey {
    pub fn new(id: &str, algorithm: KeyAlgorithm, bits: u32) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        crypto::validate_key_spec(algorithm, bits)?;
        Ok(PrivateKey {
            id: id.to_string(),
            algorithm,
            bits,
            key: Vec::new(),
        })
    }

    pub fn name(&self) -> ResourceName {
        ResourceName::new(ResourceType::PrivateKey, &self.id)
    }

    /// Regenerate the key material. Any refresh replaces the key, which is
    /// what invalidates everything derived from it.
    pub fn refresh(&mut self, _store: &mut Storage) -> Result<()> {
        self.key = crypto::generate_key(self.algorithm, self.bits)?;
        info!("generated {} key for 'private/{}'", self.algorithm, self.id);
        Ok(())
    }

    pub fn depends_on(&self) -> Vec<ResourceName> {
        Vec::new()
    }

    pub fn pem(&self) -> &[u8] {
        &self.key
    }

    pub fn checksum(&self) -> String {
        crypto::checksum(&self.key)
    }

    pub fn key(&self) -> Result<openssl::pkey::PKey<openssl::pkey::Private>> {
        crypto::load_private_key(&self.key)
    }
}

// ============================================================================
// Public key
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKey {
    pub id: String,
    pub private_key: ResourceName,
    /// Algorithm of the originating private key, recorded on refresh.
    pub algorithm: Option<KeyAlgorithm>,
    #[serde(with = "base64_bytes", default)]
    key: Vec<u8>,
    pub interval: Interval,
}

impl PublicKey {
    pub fn new(id: &str, private_key: ResourceName, refresh_after: i64, invalid_after: i64) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        Ok(PublicKey {
            id: id.to_string(),
            private_key,
            algorithm: None,
            key: Vec::new(),
            interval: Interval::starting_now(refresh_after, invalid_after),
        })
    }

    pub fn name(&self) -> ResourceName {
        ResourceName::new(ResourceType::PublicKey, &self.id)
    }

    pub fn refresh(&mut self, store: &mut Storage) -> Result<()> {
        let private = store.private_key(&self.private_key.id)?;
        self.algorithm = Some(private.algorithm);
        let key = private.key()?;
        self.key = crypto::public_key_pem(&key)?;
        self.interval.mark_refreshed();
        Ok(())
    }

    pub fn depends_on(&self) -> Vec<ResourceName> {
        vec![self.private_key.clone()]
    }

    pub fn pem(&self) -> &[u8] {
        &self.key
    }

    pub fn checksum(&self) -> String {
        crypto::checksum(&self.key)
    }
}

// ============================================================================
// Certificate sign request
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Csr {
    pub id: String,
    pub private_key: ResourceName,
    pub subject: ResourceName,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub email_addresses: Vec<String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddr>,
    #[serde(with = "base64_bytes", default)]
    data: Vec<u8>,
    pub interval: Interval,
}

impl Csr {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: &str,
        private_key: ResourceName,
        subject: ResourceName,
        dns_names: Vec<String>,
        email_addresses: Vec<String>,
        ip_addresses: Vec<IpAddr>,
        refresh_after: i64,
        invalid_after: i64,
    ) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        Ok(Csr {
            id: id.to_string(),
            private_key,
            subject,
            dns_names,
            email_addresses,
            ip_addresses,
            data: Vec::new(),
            interval: Interval::starting_now(refresh_after, invalid_after),
        })
    }

    pub fn name(&self) -> ResourceName {
        ResourceName::new(ResourceType::Csr, &self.id)
    }

    pub fn refresh(&mut self, store: &mut Storage) -> Result<()> {
        let key = store.private_key(&self.private_key.id)?.key()?;
        let subject = store.subject(&self.subject.id)?.data.clone();
        self.data = crypto::build_request(
            &key,
            &subject,
            &self.dns_names,
            &self.email_addresses,
            &self.ip_addresses,
        )?;
        self.interval.mark_refreshed();
        Ok(())
    }

    pub fn depends_on(&self) -> Vec<ResourceName> {
        vec![self.private_key.clone(), self.subject.clone()]
    }

    pub fn pem(&self) -> &[u8] {
        &self.data
    }

    pub fn checksum(&self) -> String {
        crypto::checksum(&self.data)
    }
}

// ============================================================================
// Certificate
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    /// Self-signed when true; the named CA is ignored then.
    pub is_ca: bool,
    /// Validity in seconds from the moment of each refresh.
    pub duration: i64,
    pub created: DateTime<Utc>,
    pub private_key: ResourceName,
    pub serial: ResourceName,
    pub csr: ResourceName,
    pub ca: ResourceName,
    #[serde(with = "base64_bytes", default)]
    data: Vec<u8>,
}

impl Certificate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: &str,
        private_key: ResourceName,
        serial: ResourceName,
        csr: ResourceName,
        ca: ResourceName,
        self_sign: bool,
        duration: i64,
    ) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        Ok(Certificate {
            id: id.to_string(),
            is_ca: self_sign,
            duration,
            created: Utc::now(),
            private_key,
            serial,
            csr,
            ca,
            data: Vec::new(),
        })
    }

    pub fn name(&self) -> ResourceName {
        ResourceName::new(ResourceType::Certificate, &self.id)
    }

    pub fn refresh(&mut self, store: &mut Storage) -> Result<()> {
        let serial = store.serial_mut(&self.serial.id)?.generate()?;
        let not_before = Utc::now();
        let validity = Duration::try_seconds(self.duration).ok_or(Error::InvalidDuration)?;
        let opts = CertificateOptions {
            serial,
            not_before,
            not_after: not_before + validity,
            is_ca: self.is_ca,
            ca_length: 0,
        };
        self.data = if self.is_ca {
            Ca::self_sign(store, &self.csr, &opts)?
        } else {
            let ca = store.ca(&self.ca.id)?;
            ca.sign(store, &self.csr, &opts)?
        };
        Ok(())
    }

    pub fn depends_on(&self) -> Vec<ResourceName> {
        let mut deps = vec![
            self.private_key.clone(),
            self.serial.clone(),
            self.csr.clone(),
        ];
        if !self.is_ca {
            deps.push(self.ca.clone());
        }
        deps
    }

    pub fn pem(&self) -> &[u8] {
        &self.data
    }

    pub fn checksum(&self) -> String {
        crypto::checksum(&self.data)
    }
}

// ============================================================================
// Certificate authority
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaKind {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "letsencrypt")]
    LetsEncrypt,
}

impl Default for CaKind {
    fn default() -> Self {
        CaKind::Local
    }
}

/// A CA signs CSRs with the private key of the certificate it references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ca {
    pub id: String,
    pub kind: CaKind,
    pub certificate: ResourceName,
}

impl Ca {
    pub fn new(id: &str, kind: CaKind, certificate: ResourceName) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        Ok(Ca {
            id: id.to_string(),
            kind,
            certificate,
        })
    }

    pub fn name(&self) -> ResourceName {
        ResourceName::new(ResourceType::Ca, &self.id)
    }

    pub fn refresh(&mut self, _store: &mut Storage) -> Result<()> {
        Ok(())
    }

    pub fn depends_on(&self) -> Vec<ResourceName> {
        vec![self.certificate.clone()]
    }

    /// Sign the given CSR with this CA's key material.
    pub fn sign(&self, store: &Storage, csr: &ResourceName, opts: &CertificateOptions) -> Result<Vec<u8>> {
        if self.kind == CaKind::LetsEncrypt {
            return Err(Error::UnsupportedCa);
        }
        let request = store.csr(&csr.id)?;
        let ca_cert = store.certificate(&self.certificate.id)?;
        let issuer = crypto::parse_certificate(ca_cert.pem())?;
        let signer = store.private_key(&ca_cert.private_key.id)?.key()?;
        info!(
            "ca '{}' signing csr '{}' using cert '{}'",
            self.id, request.id, ca_cert.id
        );
        crypto::sign_request(request.pem(), &signer, Some(&issuer), opts)
    }

    /// Sign the CSR with its own private key, producing a self-signed
    /// certificate. This is the sentinel path for `is_ca` certificates.
    pub fn self_sign(store: &Storage, csr: &ResourceName, opts: &CertificateOptions) -> Result<Vec<u8>> {
        let request = store.csr(&csr.id)?;
        let signer = store.private_key(&request.private_key.id)?.key()?;
        info!("self-signing csr '{}'", request.id);
        crypto::sign_request(request.pem(), &signer, None, opts)
    }
}

// ============================================================================
// Location
// ============================================================================

/// A file export: the concatenated PEM of the dependencies, written to
/// `path` with mode 0600, bracketed by the optional pre/post commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub pre_command: String,
    #[serde(default)]
    pub post_command: String,
    #[serde(default)]
    pub dependencies: Vec<ResourceName>,
}

impl Location {
    pub fn new(
        id: &str,
        path: PathBuf,
        pre_command: String,
        post_command: String,
        dependencies: Vec<ResourceName>,
    ) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        if path.as_os_str().is_empty() {
            return Err(Error::NoPathGiven);
        }
        reject_location_deps(&dependencies)?;
        Ok(Location {
            id: id.to_string(),
            path,
            pre_command,
            post_command,
            dependencies,
        })
    }

    pub fn name(&self) -> ResourceName {
        ResourceName::new(ResourceType::Location, &self.id)
    }

    pub fn refresh(&mut self, store: &mut Storage) -> Result<()> {
        let mut raw = Vec::new();
        for rn in &self.dependencies {
            let resource = store.get(rn)?;
            raw.extend_from_slice(resource.pem());
        }
        if !self.pre_command.is_empty() {
            info!(
                "location '{}' is updating '{}' - pre '{}'",
                self.id,
                self.path.display(),
                self.pre_command
            );
            run_hook(&self.pre_command, &self.path)?;
        }
        info!("location '{}' is updating '{}'", self.id, self.path.display());
        write_export(&self.path, &raw)?;
        if !self.post_command.is_empty() {
            info!(
                "location '{}' is updating '{}' - post '{}'",
                self.id,
                self.path.display(),
                self.post_command
            );
            run_hook(&self.post_command, &self.path)?;
        }
        Ok(())
    }

    pub fn depends_on(&self) -> Vec<ResourceName> {
        self.dependencies.clone()
    }
}

/// Locations carry no PEM themselves, so nothing may depend on one.
pub fn reject_location_deps(dependencies: &[ResourceName]) -> Result<()> {
    if dependencies.iter().any(|rn| rn.rtype == ResourceType::Location) {
        return Err(Error::LocationDependency);
    }
    Ok(())
}

pub(crate) fn run_hook(command: &str, path: &Path) -> Result<()> {
    let status = Command::new(command).arg(path).status().map_err(|err| Error::HookFailed {
        command: command.to_string(),
        status: err.to_string(),
    })?;
    if !status.success() {
        return Err(Error::HookFailed {
            command: command.to_string(),
            status: status.to_string(),
        });
    }
    Ok(())
}

fn write_export(path: &Path, raw: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(raw)?;
    // The mode above only applies on creation; pin it for existing files.
    let mut perms = file.metadata()?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

// ============================================================================
// Dispatch
// ============================================================================

/// An owned resource, used when a node has to leave its table (refresh,
/// removal).
#[derive(Debug, Clone)]
pub enum Resource {
    PrivateKey(PrivateKey),
    PublicKey(PublicKey),
    Subject(Subject),
    Serial(Serial),
    Csr(Csr),
    Certificate(Certificate),
    Location(Location),
    Ca(Ca),
}

impl Resource {
    pub fn name(&self) -> ResourceName {
        match self {
            Resource::PrivateKey(r) => r.name(),
            Resource::PublicKey(r) => r.name(),
            Resource::Subject(r) => r.name(),
            Resource::Serial(r) => r.name(),
            Resource::Csr(r) => r.name(),
            Resource::Certificate(r) => r.name(),
            Resource::Location(r) => r.name(),
            Resource::Ca(r) => r.name(),
        }
    }

    pub fn depends_on(&self) -> Vec<ResourceName> {
        match self {
            Resource::PrivateKey(r) => r.depends_on(),
            Resource::PublicKey(r) => r.depends_on(),
            Resource::Subject(r) => r.depends_on(),
            Resource::Serial(r) => r.depends_on(),
            Resource::Csr(r) => r.depends_on(),
            Resource::Certificate(r) => r.depends_on(),
            Resource::Location(r) => r.depends_on(),
            Resource::Ca(r) => r.depends_on(),
        }
    }

    /// Rebuild the cached artefact from the current inputs.
    pub fn refresh(&mut self, store: &mut Storage) -> Result<()> {
        match self {
            Resource::PrivateKey(r) => r.refresh(store),
            Resource::PublicKey(r) => r.refresh(store),
            Resource::Subject(r) => r.refresh(store),
            Resource::Serial(r) => r.refresh(store),
            Resource::Csr(r) => r.refresh(store),
            Resource::Certificate(r) => r.refresh(store),
            Resource::Location(r) => r.refresh(store),
            Resource::Ca(r) => r.refresh(store),
        }
    }
}

/// A borrowed view into a node, for lookups that only read.
#[derive(Debug, Clone, Copy)]
pub enum ResourceRef<'a> {
    PrivateKey(&'a PrivateKey),
    PublicKey(&'a PublicKey),
    Subject(&'a Subject),
    Serial(&'a Serial),
    Csr(&'a Csr),
    Certificate(&'a Certificate),
    Location(&'a Location),
    Ca(&'a Ca),
}

impl ResourceRef<'_> {
    pub fn name(&self) -> ResourceName {
        match self {
            ResourceRef::PrivateKey(r) => r.name(),
            ResourceRef::PublicKey(r) => r.name(),
            ResourceRef::Subject(r) => r.name(),
            ResourceRef::Serial(r) => r.name(),
            ResourceRef::Csr(r) => r.name(),
            ResourceRef::Certificate(r) => r.name(),
            ResourceRef::Location(r) => r.name(),
            ResourceRef::Ca(r) => r.name(),
        }
    }

    pub fn depends_on(&self) -> Vec<ResourceName> {
        match self {
            ResourceRef::PrivateKey(r) => r.depends_on(),
            ResourceRef::PublicKey(r) => r.depends_on(),
            ResourceRef::Subject(r) => r.depends_on(),
            ResourceRef::Serial(r) => r.depends_on(),
            ResourceRef::Csr(r) => r.depends_on(),
            ResourceRef::Certificate(r) => r.depends_on(),
            ResourceRef::Location(r) => r.depends_on(),
            ResourceRef::Ca(r) => r.depends_on(),
        }
    }

    /// PEM output of the node; subjects, serials, locations and CAs carry
    /// none and yield an empty buffer.
    pub fn pem(&self) -> &[u8] {
        match self {
            ResourceRef::PrivateKey(r) => r.pem(),
            ResourceRef::PublicKey(r) => r.pem(),
            ResourceRef::Csr(r) => r.pem(),
            ResourceRef::Certificate(r) => r.pem(),
            ResourceRef::Subject(_)
            | ResourceRef::Serial(_)
            | ResourceRef::Location(_)
            | ResourceRef::Ca(_) => &[],
        }
    }

    pub fn checksum(&self) -> String {
        match self {
            ResourceRef::PrivateKey(r) => r.checksum(),
            ResourceRef::PublicKey(r) => r.checksum(),
            ResourceRef::Csr(r) => r.checksum(),
            ResourceRef::Certificate(r) => r.checksum(),
            ResourceRef::Subject(_)
            | ResourceRef::Serial(_)
            | ResourceRef::Location(_)
            | ResourceRef::Ca(_) => String::new(),
        }
    }

    pub fn refresh_interval(&self) -> Interval {
        match self {
            ResourceRef::PublicKey(r) => r.interval.clone(),
            ResourceRef::Csr(r) => r.interval.clone(),
            _ => Interval::never(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names_render_canonically() {
        let name = ResourceName::new(ResourceType::PrivateKey, "server");
        assert_eq!(name.to_string(), "private/server");
        assert_eq!(ResourceName::parse("private/server").unwrap(), name);
        assert!(ResourceName::parse("private/").is_err());
        assert!(ResourceName::parse("nonsense/x").is_err());
        assert!(ResourceName::parse("flat").is_err());
    }

    #[test]
    fn serial_draws_stay_in_range_and_unique() {
        let mut serial = Serial::new("sr", 10, 20).unwrap();
        let mut seen = BTreeSet::new();
        for _ in 0..10 {
            let value = serial.generate().unwrap();
            assert!((10..20).contains(&value));
            assert!(seen.insert(value), "serial {value} issued twice");
        }
        // All ten values of the range are gone now.
        assert!(matches!(serial.generate(), Err(Error::SerialExhausted)));
    }

    #[test]
    fn serial_rejects_empty_range() {
        assert!(matches!(Serial::new("sr", 5, 5), Err(Error::LengthTooSmall)));
        assert!(matches!(Serial::new("", 0, 10), Err(Error::NoIdGiven)));
    }

    #[test]
    fn private_key_validates_parameters() {
        assert!(PrivateKey::new("k", KeyAlgorithm::Rsa, 2048).is_ok());
        assert!(matches!(
            PrivateKey::new("k", KeyAlgorithm::Rsa, 100),
            Err(Error::LengthOutOfBounds)
        ));
        assert!(matches!(
            PrivateKey::new("k", KeyAlgorithm::Ecdsa, 512),
            Err(Error::WrongKeyLength)
        ));
        assert!(matches!(
            PrivateKey::new("", KeyAlgorithm::Rsa, 2048),
            Err(Error::NoIdGiven)
        ));
    }

    #[test]
    fn location_refuses_location_dependencies() {
        let deps = vec![ResourceName::new(ResourceType::Location, "other")];
        assert!(matches!(
            Location::new("l", PathBuf::from("/tmp/out"), String::new(), String::new(), deps),
            Err(Error::LocationDependency)
        ));
    }

    #[test]
    fn interval_schedules_only_positive_refresh() {
        assert!(!Interval::never().is_scheduled());
        assert!(Interval::starting_now(60, 0).is_scheduled());
        let interval = Interval::starting_now(60, 0);
        assert_eq!(interval.next_due(), interval.last_refresh + Duration::seconds(60));
    }

    #[test]
    fn certificate_dependency_set_tracks_self_sign() {
        let cert = Certificate::new(
            "c",
            ResourceName::new(ResourceType::PrivateKey, "k"),
            ResourceName::new(ResourceType::Serial, "sr"),
            ResourceName::new(ResourceType::Csr, "r"),
            ResourceName::new(ResourceType::Ca, "ca"),
            true,
            3600,
        )
        .unwrap();
        assert_eq!(cert.depends_on().len(), 3);
        let mut signed = cert.clone();
        signed.is_ca = false;
        assert_eq!(signed.depends_on().len(), 4);
    }
}
