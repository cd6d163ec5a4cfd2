//! End-to-end scenarios driven through the request handler, covering the
//! full lifecycle: self-signed issuance, downstream invalidation, file
//! exports with hooks, and persistence across a restart.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use pkiadm::api::{
    CertificateView, CsrView, LocationChange, LocationView, PrivateKeyChange, PrivateKeyView,
    PublicKeyView, Request, Response, SerialView, SubjectView,
};
use pkiadm::crypto::{self, KeyAlgorithm};
use pkiadm::resources::{DistinguishedName, ResourceName, ResourceType};
use pkiadm::server::Handler;
use pkiadm::storage::Storage;

struct Daemon {
    handler: Handler,
    storage: Arc<Mutex<Storage>>,
}

fn daemon(db: &std::path::Path) -> Daemon {
    let storage = Arc::new(Mutex::new(Storage::open(db.to_path_buf()).unwrap()));
    let handler = Handler::new(storage.clone(), Arc::new(Notify::new()));
    Daemon { handler, storage }
}

impl Daemon {
    async fn ok(&self, request: Request) -> Response {
        let reply = self.handler.dispatch(request).await;
        assert!(
            !reply.result().has_error,
            "unexpected error: {:?}",
            reply.result()
        );
        reply
    }

    async fn checksum(&self, rtype: ResourceType, id: &str) -> String {
        let storage = self.storage.lock().await;
        storage
            .get(&ResourceName::new(rtype, id))
            .unwrap()
            .checksum()
    }

    async fn pem(&self, rtype: ResourceType, id: &str) -> Vec<u8> {
        let storage = self.storage.lock().await;
        storage
            .get(&ResourceName::new(rtype, id))
            .unwrap()
            .pem()
            .to_vec()
    }
}

#[tokio::test]
async fn full_lifecycle() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("pkiadm.db");
    let daemon = daemon(&db);

    // --- Scenario 1: self-signed certificate -------------------------------

    daemon
        .ok(Request::CreateSubject(SubjectView {
            id: "s1".to_string(),
            name: DistinguishedName {
                common_name: "ca".to_string(),
                ..DistinguishedName::default()
            },
        }))
        .await;
    daemon
        .ok(Request::CreateSerial(SerialView {
            id: "sr".to_string(),
            min: 1,
            max: 100_000,
        }))
        .await;
    daemon
        .ok(Request::CreatePrivateKey(PrivateKeyView {
            id: "k1".to_string(),
            algorithm: KeyAlgorithm::Rsa,
            bits: 2048,
            checksum: String::new(),
        }))
        .await;
    daemon
        .ok(Request::CreateCSR(CsrView {
            id: "c1".to_string(),
            private_key: ResourceName::new(ResourceType::PrivateKey, "k1"),
            subject: ResourceName::new(ResourceType::Subject, "s1"),
            ..CsrView::default()
        }))
        .await;
    daemon
        .ok(Request::CreateCertificate(CertificateView {
            id: "cert1".to_string(),
            is_ca: true,
            duration: 30 * 24 * 3600,
            private_key: ResourceName::new(ResourceType::PrivateKey, "k1"),
            serial: ResourceName::new(ResourceType::Serial, "sr"),
            csr: ResourceName::new(ResourceType::Csr, "c1"),
            ..CertificateView::default()
        }))
        .await;

    let reply = daemon
        .handler
        .dispatch(Request::ShowCertificate(ResourceName::new(
            ResourceType::Certificate,
            "cert1",
        )))
        .await;
    let shown_checksum = match reply {
        Response::Certificates { result, certificates } => {
            assert!(!result.has_error);
            certificates[0].checksum.clone()
        }
        other => panic!("wrong reply: {other:?}"),
    };
    assert!(!shown_checksum.is_empty());

    // The checksum law: SHA-512/base64 of the PEM bytes.
    let cert_pem = daemon.pem(ResourceType::Certificate, "cert1").await;
    assert_eq!(shown_checksum, crypto::checksum(&cert_pem));

    // Issuer equals subject on a self-signed certificate.
    let cert = openssl::x509::X509::from_pem(&cert_pem).unwrap();
    assert_eq!(cert.issued(&cert), openssl::x509::X509VerifyResult::OK);

    // --- Scenario 2: downstream invalidation -------------------------------

    let key_sum = daemon.checksum(ResourceType::PrivateKey, "k1").await;
    let csr_sum = daemon.checksum(ResourceType::Csr, "c1").await;
    let cert_sum = daemon.checksum(ResourceType::Certificate, "cert1").await;

    daemon
        .ok(Request::SetPrivateKey(PrivateKeyChange {
            private_key: PrivateKeyView {
                id: "k1".to_string(),
                algorithm: KeyAlgorithm::Rsa,
                bits: 4096,
                checksum: String::new(),
            },
            field_list: vec!["bits".to_string()],
        }))
        .await;

    assert_ne!(daemon.checksum(ResourceType::PrivateKey, "k1").await, key_sum);
    assert_ne!(daemon.checksum(ResourceType::Csr, "c1").await, csr_sum);
    assert_ne!(daemon.checksum(ResourceType::Certificate, "cert1").await, cert_sum);

    // --- Scenario 3: location export ---------------------------------------

    let export = dir.path().join("out.pem");
    daemon
        .ok(Request::CreatePublicKey(PublicKeyView {
            id: "p1".to_string(),
            private_key: ResourceName::new(ResourceType::PrivateKey, "k1"),
            ..PublicKeyView::default()
        }))
        .await;
    daemon
        .ok(Request::CreateLocation(LocationView {
            id: "loc1".to_string(),
            path: export.clone(),
            dependencies: vec![
                ResourceName::new(ResourceType::PublicKey, "p1"),
                ResourceName::new(ResourceType::Certificate, "cert1"),
            ],
            ..LocationView::default()
        }))
        .await;

    let written = std::fs::read(&export).unwrap();
    let mut expected = daemon.pem(ResourceType::PublicKey, "p1").await;
    expected.extend(daemon.pem(ResourceType::Certificate, "cert1").await);
    assert_eq!(written, expected);
    let mode = std::fs::metadata(&export).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    // --- Scenario 4: hook failure ------------------------------------------

    let before = std::fs::read(&export).unwrap();
    let reply = daemon
        .handler
        .dispatch(Request::SetLocation(LocationChange {
            location: LocationView {
                id: "loc1".to_string(),
                pre_command: "/bin/false".to_string(),
                ..LocationView::default()
            },
            field_list: vec!["pre-cmd".to_string()],
        }))
        .await;
    assert!(reply.result().has_error, "failing pre hook must fail the set");
    assert_eq!(std::fs::read(&export).unwrap(), before, "file must not be rewritten");

    // --- Scenario 5: persistence round-trip --------------------------------

    let names_before = {
        let storage = daemon.storage.lock().await;
        storage.list()
    };
    let sums_before = vec![
        daemon.checksum(ResourceType::PrivateKey, "k1").await,
        daemon.checksum(ResourceType::PublicKey, "p1").await,
        daemon.checksum(ResourceType::Csr, "c1").await,
        daemon.checksum(ResourceType::Certificate, "cert1").await,
    ];
    drop(daemon);

    let restarted = daemon_reopen(&db);
    let names_after = {
        let storage = restarted.storage.lock().await;
        storage.list()
    };
    let mut sorted_before = names_before.clone();
    let mut sorted_after = names_after.clone();
    sorted_before.sort();
    sorted_after.sort();
    assert_eq!(sorted_before, sorted_after);

    let sums_after = vec![
        restarted.checksum(ResourceType::PrivateKey, "k1").await,
        restarted.checksum(ResourceType::PublicKey, "p1").await,
        restarted.checksum(ResourceType::Csr, "c1").await,
        restarted.checksum(ResourceType::Certificate, "cert1").await,
    ];
    assert_eq!(sums_before, sums_after);

    // --- Scenario 6: unknown field -----------------------------------------

    let key_sum = restarted.checksum(ResourceType::PrivateKey, "k1").await;
    let reply = restarted
        .handler
        .dispatch(Request::SetPrivateKey(PrivateKeyChange {
            private_key: PrivateKeyView {
                id: "k1".to_string(),
                ..PrivateKeyView::default()
            },
            field_list: vec!["nonsense".to_string()],
        }))
        .await;
    assert!(reply.result().has_error);
    assert_eq!(reply.result().error, "unknown field");
    assert!(reply.result().message.contains("nonsense"));
    assert_eq!(
        restarted.checksum(ResourceType::PrivateKey, "k1").await,
        key_sum,
        "a rejected set must leave the resource unchanged"
    );
}

fn daemon_reopen(db: &std::path::Path) -> Daemon {
    daemon(db)
}

#[tokio::test]
async fn deleted_resources_disappear_completely() {
    let dir = tempfile::TempDir::new().unwrap();
    let daemon = daemon(&dir.path().join("pkiadm.db"));

    daemon
        .ok(Request::CreatePrivateKey(PrivateKeyView {
            id: "k1".to_string(),
            algorithm: KeyAlgorithm::Ecdsa,
            bits: 256,
            checksum: String::new(),
        }))
        .await;
    daemon
        .ok(Request::CreatePublicKey(PublicKeyView {
            id: "p1".to_string(),
            private_key: ResourceName::new(ResourceType::PrivateKey, "k1"),
            ..PublicKeyView::default()
        }))
        .await;

    // The private key is still referenced.
    let reply = daemon
        .handler
        .dispatch(Request::DeletePrivateKey(ResourceName::new(
            ResourceType::PrivateKey,
            "k1",
        )))
        .await;
    assert!(reply.result().has_error);
    assert!(reply.result().error.contains("still referenced"));

    daemon
        .ok(Request::DeletePublicKey(ResourceName::new(
            ResourceType::PublicKey,
            "p1",
        )))
        .await;
    daemon
        .ok(Request::DeletePrivateKey(ResourceName::new(
            ResourceType::PrivateKey,
            "k1",
        )))
        .await;

    let storage = daemon.storage.lock().await;
    assert!(storage.list().is_empty());
    assert!(storage
        .dependants(&ResourceName::new(ResourceType::PrivateKey, "k1"))
        .is_empty());
}

#[tokio::test]
async fn location_delete_removes_the_export() {
    let dir = tempfile::TempDir::new().unwrap();
    let daemon = daemon(&dir.path().join("pkiadm.db"));
    let export = dir.path().join("bundle.pem");

    daemon
        .ok(Request::CreatePrivateKey(PrivateKeyView {
            id: "k1".to_string(),
            algorithm: KeyAlgorithm::Ed25519,
            bits: 256,
            checksum: String::new(),
        }))
        .await;
    daemon
        .ok(Request::CreatePublicKey(PublicKeyView {
            id: "p1".to_string(),
            private_key: ResourceName::new(ResourceType::PrivateKey, "k1"),
            ..PublicKeyView::default()
        }))
        .await;
    daemon
        .ok(Request::CreateLocation(LocationView {
            id: "loc1".to_string(),
            path: export.clone(),
            dependencies: vec![ResourceName::new(ResourceType::PublicKey, "p1")],
            ..LocationView::default()
        }))
        .await;
    assert!(export.exists());

    daemon
        .ok(Request::DeleteLocation(ResourceName::new(
            ResourceType::Location,
            "loc1",
        )))
        .await;
    assert!(!export.exists());
}

#[tokio::test]
async fn signed_certificates_chain_to_their_ca() {
    let dir = tempfile::TempDir::new().unwrap();
    let daemon = daemon(&dir.path().join("pkiadm.db"));

    daemon
        .ok(Request::CreateSubject(SubjectView {
            id: "root".to_string(),
            name: DistinguishedName {
                common_name: "root ca".to_string(),
                ..DistinguishedName::default()
            },
        }))
        .await;
    daemon
        .ok(Request::CreateSubject(SubjectView {
            id: "leaf".to_string(),
            name: DistinguishedName {
                common_name: "server.example".to_string(),
                ..DistinguishedName::default()
            },
        }))
        .await;
    daemon
        .ok(Request::CreateSerial(SerialView {
            id: "sr".to_string(),
            min: 1,
            max: 100_000,
        }))
        .await;
    for key in ["root-key", "leaf-key"] {
        daemon
            .ok(Request::CreatePrivateKey(PrivateKeyView {
                id: key.to_string(),
                algorithm: KeyAlgorithm::Ecdsa,
                bits: 256,
                checksum: String::new(),
            }))
            .await;
    }
    daemon
        .ok(Request::CreateCSR(CsrView {
            id: "root-csr".to_string(),
            private_key: ResourceName::new(ResourceType::PrivateKey, "root-key"),
            subject: ResourceName::new(ResourceType::Subject, "root"),
            ..CsrView::default()
        }))
        .await;
    daemon
        .ok(Request::CreateCertificate(CertificateView {
            id: "root-cert".to_string(),
            is_ca: true,
            duration: 30 * 24 * 3600,
            private_key: ResourceName::new(ResourceType::PrivateKey, "root-key"),
            serial: ResourceName::new(ResourceType::Serial, "sr"),
            csr: ResourceName::new(ResourceType::Csr, "root-csr"),
            ..CertificateView::default()
        }))
        .await;
    daemon
        .ok(Request::CreateCA(pkiadm::api::CaView {
            id: "ca1".to_string(),
            certificate: ResourceName::new(ResourceType::Certificate, "root-cert"),
            ..pkiadm::api::CaView::default()
        }))
        .await;
    daemon
        .ok(Request::CreateCSR(CsrView {
            id: "leaf-csr".to_string(),
            private_key: ResourceName::new(ResourceType::PrivateKey, "leaf-key"),
            subject: ResourceName::new(ResourceType::Subject, "leaf"),
            dns_names: vec!["server.example".to_string()],
            ..CsrView::default()
        }))
        .await;
    daemon
        .ok(Request::CreateCertificate(CertificateView {
            id: "leaf-cert".to_string(),
            is_ca: false,
            duration: 7 * 24 * 3600,
            private_key: ResourceName::new(ResourceType::PrivateKey, "leaf-key"),
            serial: ResourceName::new(ResourceType::Serial, "sr"),
            csr: ResourceName::new(ResourceType::Csr, "leaf-csr"),
            ca: ResourceName::new(ResourceType::Ca, "ca1"),
            ..CertificateView::default()
        }))
        .await;

    let root = openssl::x509::X509::from_pem(&daemon.pem(ResourceType::Certificate, "root-cert").await)
        .unwrap();
    let leaf = openssl::x509::X509::from_pem(&daemon.pem(ResourceType::Certificate, "leaf-cert").await)
        .unwrap();
    assert_eq!(root.issued(&leaf), openssl::x509::X509VerifyResult::OK);
    assert_ne!(leaf.issued(&leaf), openssl::x509::X509VerifyResult::OK);
}
