//! Wire types for the Unix-socket protocol.
//!
//! One JSON object per line in both directions. Requests are adjacently
//! tagged as `{"method": ..., "params": ...}`; every method of the protocol
//! maps to one `Request` variant. Replies carry a `Result` payload
//! (`has_error` / `error` / `message`) and, for queries, the matching list
//! of resource views.

use std::fmt::Display;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::crypto::KeyAlgorithm;
use crate::resources::{CaKind, DistinguishedName, ResourceName};

// ============================================================================
// Result envelope
// ============================================================================

/// Outcome of an operation as reported to the client. The transport itself
/// only ever fails on framing problems; everything else lands here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OpResult {
    pub has_error: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: String,
}

impl OpResult {
    pub fn ok() -> Self {
        OpResult::default()
    }

    pub fn failure(err: impl Display, message: impl Into<String>) -> Self {
        OpResult {
            has_error: true,
            error: err.to_string(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Resource views
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SerialView {
    pub id: String,
    #[serde(default)]
    pub min: i64,
    #[serde(default)]
    pub max: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubjectView {
    pub id: String,
    #[serde(default)]
    pub name: DistinguishedName,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrivateKeyView {
    pub id: String,
    #[serde(rename = "type", default)]
    pub algorithm: KeyAlgorithm,
    #[serde(default)]
    pub bits: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PublicKeyView {
    pub id: String,
    #[serde(default)]
    pub private_key: ResourceName,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<KeyAlgorithm>,
    /// Seconds between scheduled refreshes; zero disables scheduling.
    #[serde(default)]
    pub refresh_after: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CsrView {
    pub id: String,
    #[serde(default)]
    pub private_key: ResourceName,
    #[serde(default)]
    pub subject: ResourceName,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub email_addresses: Vec<String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddr>,
    #[serde(default)]
    pub refresh_after: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CertificateView {
    pub id: String,
    #[serde(default)]
    pub is_ca: bool,
    /// Validity in seconds from each refresh.
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub private_key: ResourceName,
    #[serde(default)]
    pub serial: ResourceName,
    #[serde(default)]
    pub csr: ResourceName,
    #[serde(default)]
    pub ca: ResourceName,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CaView {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: CaKind,
    #[serde(default)]
    pub certificate: ResourceName,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LocationView {
    pub id: String,
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub dependencies: Vec<ResourceName>,
    #[serde(default)]
    pub pre_command: String,
    #[serde(default)]
    pub post_command: String,
}

// ============================================================================
// Change envelopes
// ============================================================================

// A Set request ships the full resource plus the list of fields to apply;
// everything outside the field list is ignored.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialChange {
    pub serial: SerialView,
    #[serde(default)]
    pub field_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectChange {
    pub subject: SubjectView,
    #[serde(default)]
    pub field_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateKeyChange {
    pub private_key: PrivateKeyView,
    #[serde(default)]
    pub field_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyChange {
    pub public_key: PublicKeyView,
    #[serde(default)]
    pub field_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsrChange {
    pub csr: CsrView,
    #[serde(default)]
    pub field_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateChange {
    pub certificate: CertificateView,
    #[serde(default)]
    pub field_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaChange {
    pub ca: CaView,
    #[serde(default)]
    pub field_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationChange {
    pub location: LocationView,
    #[serde(default)]
    pub field_list: Vec<String>,
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    List,

    CreateSerial(SerialView),
    SetSerial(SerialChange),
    DeleteSerial(ResourceName),
    ShowSerial(ResourceName),
    ListSerial,

    CreateSubject(SubjectView),
    SetSubject(SubjectChange),
    DeleteSubject(ResourceName),
    ShowSubject(ResourceName),
    ListSubject,

    CreatePrivateKey(PrivateKeyView),
    SetPrivateKey(PrivateKeyChange),
    DeletePrivateKey(ResourceName),
    ShowPrivateKey(ResourceName),
    ListPrivateKey,

    CreatePublicKey(PublicKeyView),
    SetPublicKey(PublicKeyChange),
    DeletePublicKey(ResourceName),
    ShowPublicKey(ResourceName),
    ListPublicKey,

    CreateCSR(CsrView),
    SetCSR(CsrChange),
    DeleteCSR(ResourceName),
    ShowCSR(ResourceName),
    ListCSR,

    CreateCertificate(CertificateView),
    SetCertificate(CertificateChange),
    DeleteCertificate(ResourceName),
    ShowCertificate(ResourceName),
    ListCertificate,

    CreateCA(CaView),
    SetCA(CaChange),
    DeleteCA(ResourceName),
    ShowCA(ResourceName),
    ListCA,

    CreateLocation(LocationView),
    SetLocation(LocationChange),
    DeleteLocation(ResourceName),
    ShowLocation(ResourceName),
    ListLocation,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum Response {
    Result(OpResult),
    Resources {
        result: OpResult,
        resources: Vec<ResourceName>,
    },
    Serials {
        result: OpResult,
        serials: Vec<SerialView>,
    },
    Subjects {
        result: OpResult,
        subjects: Vec<SubjectView>,
    },
    PrivateKeys {
        result: OpResult,
        private_keys: Vec<PrivateKeyView>,
    },
    PublicKeys {
        result: OpResult,
        public_keys: Vec<PublicKeyView>,
    },
    Csrs {
        result: OpResult,
        csrs: Vec<CsrView>,
    },
    Certificates {
        result: OpResult,
        certificates: Vec<CertificateView>,
    },
    Cas {
        result: OpResult,
        cas: Vec<CaView>,
    },
    Locations {
        result: OpResult,
        locations: Vec<LocationView>,
    },
}

impl Response {
    pub fn failure(err: impl Display, message: impl Into<String>) -> Self {
        Response::Result(OpResult::failure(err, message))
    }

    /// The result payload of any reply variant.
    pub fn result(&self) -> &OpResult {
        match self {
            Response::Result(result) => result,
            Response::Resources { result, .. }
            | Response::Serials { result, .. }
            | Response::Subjects { result, .. }
            | Response::PrivateKeys { result, .. }
            | Response::PublicKeys { result, .. }
            | Response::Csrs { result, .. }
            | Response::Certificates { result, .. }
            | Response::Cas { result, .. }
            | Response::Locations { result, .. } => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceType;

    #[test]
    fn requests_round_trip_as_tagged_json() {
        let request = Request::CreateSerial(SerialView {
            id: "sr".to_string(),
            min: 1,
            max: 100,
        });
        let encoded = serde_json::to_string(&request).unwrap();
        assert!(encoded.contains(r#""method":"CreateSerial""#));
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Request::CreateSerial(view) => assert_eq!(view.max, 100),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unit_methods_need_no_params() {
        let decoded: Request = serde_json::from_str(r#"{"method":"List"}"#).unwrap();
        assert!(matches!(decoded, Request::List));
    }

    #[test]
    fn delete_takes_a_resource_name() {
        let decoded: Request = serde_json::from_str(
            r#"{"method":"DeletePrivateKey","params":{"id":"k1","type":"private"}}"#,
        )
        .unwrap();
        match decoded {
            Request::DeletePrivateKey(name) => {
                assert_eq!(name, ResourceName::new(ResourceType::PrivateKey, "k1"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn result_payload_reachable_from_any_reply() {
        let reply = Response::Serials {
            result: OpResult::failure("boom", "context"),
            serials: vec![],
        };
        assert!(reply.result().has_error);
        assert_eq!(reply.result().error, "boom");
    }

    #[test]
    fn missing_optional_fields_default() {
        let change: SerialChange =
            serde_json::from_str(r#"{"serial":{"id":"sr"}}"#).unwrap();
        assert!(change.field_list.is_empty());
        assert_eq!(change.serial.min, 0);
    }
}
