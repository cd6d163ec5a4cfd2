//! Unix-socket server and request handler.
//!
//! Every connection carries newline-delimited JSON requests. All handlers
//! funnel through one `Handler` holding the global mutex; a request takes
//! the lock, performs its graph operation, persists the database when it
//! mutated anything, and releases the lock on the way out. Errors never
//! escape to the transport; they are folded into the reply's result
//! payload.

use std::fs;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};
use tracing::{error, warn};

use crate::api::{
    CaChange, CaView, CertificateChange, CertificateView, CsrChange, CsrView, LocationChange,
    LocationView, OpResult, PrivateKeyChange, PrivateKeyView, PublicKeyChange, PublicKeyView,
    Request, Response, SerialChange, SerialView, SubjectChange, SubjectView,
};
use crate::crypto;
use crate::error::Error;
use crate::resources::{
    reject_location_deps, run_hook, Ca, Certificate, Csr, Location, PrivateKey, PublicKey,
    ResourceName, ResourceType, Serial, Subject,
};
use crate::storage::Storage;

/// Accept loop. Each connection is served on its own task; the shared
/// mutex inside the handler serialises all graph operations regardless.
pub async fn serve(listener: UnixListener, handler: Arc<Handler>) -> io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, handler).await {
                        warn!("error handling client: {err}");
                    }
                });
            }
            Err(err) => warn!("error accepting connection: {err}"),
        }
    }
}

async fn handle_client(stream: UnixStream, handler: Arc<Handler>) -> io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handler.dispatch(request).await,
            Err(err) => Response::failure(&err, "could not parse request"),
        };
        let mut raw = serde_json::to_vec(&response)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        raw.push(b'\n');
        write_half.write_all(&raw).await?;
        write_half.flush().await?;
    }
    Ok(())
}

pub struct Handler {
    storage: Arc<Mutex<Storage>>,
    refresh: Arc<Notify>,
}

impl Handler {
    pub fn new(storage: Arc<Mutex<Storage>>, refresh: Arc<Notify>) -> Self {
        Handler { storage, refresh }
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::List => self.list().await,

            Request::CreateSerial(view) => self.create_serial(view).await,
            Request::SetSerial(change) => self.set_serial(change).await,
            Request::DeleteSerial(name) => self.delete(ResourceType::Serial, name).await,
            Request::ShowSerial(name) => self.show_serial(name).await,
            Request::ListSerial => self.list_serial().await,

            Request::CreateSubject(view) => self.create_subject(view).await,
            Request::SetSubject(change) => self.set_subject(change).await,
            Request::DeleteSubject(name) => self.delete(ResourceType::Subject, name).await,
            Request::ShowSubject(name) => self.show_subject(name).await,
            Request::ListSubject => self.list_subject().await,

            Request::CreatePrivateKey(view) => self.create_private_key(view).await,
            Request::SetPrivateKey(change) => self.set_private_key(change).await,
            Request::DeletePrivateKey(name) => self.delete(ResourceType::PrivateKey, name).await,
            Request::ShowPrivateKey(name) => self.show_private_key(name).await,
            Request::ListPrivateKey => self.list_private_key().await,

            Request::CreatePublicKey(view) => self.create_public_key(view).await,
            Request::SetPublicKey(change) => self.set_public_key(change).await,
            Request::DeletePublicKey(name) => self.delete(ResourceType::PublicKey, name).await,
            Request::ShowPublicKey(name) => self.show_public_key(name).await,
            Request::ListPublicKey => self.list_public_key().await,

            Request::CreateCSR(view) => self.create_csr(view).await,
            Request::SetCSR(change) => self.set_csr(change).await,
            Request::DeleteCSR(name) => self.delete(ResourceType::Csr, name).await,
            Request::ShowCSR(name) => self.show_csr(name).await,
            Request::ListCSR => self.list_csr().await,

            Request::CreateCertificate(view) => self.create_certificate(view).await,
            Request::SetCertificate(change) => self.set_certificate(change).await,
            Request::DeleteCertificate(name) => self.delete(ResourceType::Certificate, name).await,
            Request::ShowCertificate(name) => self.show_certificate(name).await,
            Request::ListCertificate => self.list_certificate().await,

            Request::CreateCA(view) => self.create_ca(view).await,
            Request::SetCA(change) => self.set_ca(change).await,
            Request::DeleteCA(name) => self.delete(ResourceType::Ca, name).await,
            Request::ShowCA(name) => self.show_ca(name).await,
            Request::ListCA => self.list_ca().await,

            Request::CreateLocation(view) => self.create_location(view).await,
            Request::SetLocation(change) => self.set_location(change).await,
            Request::DeleteLocation(name) => self.delete_location(name).await,
            Request::ShowLocation(name) => self.show_location(name).await,
            Request::ListLocation => self.list_location().await,
        }
    }

    /// Persist after a mutation. A storage failure is surfaced to the
    /// client but the in-memory change stands; the scheduler is nudged
    /// either way so it re-arms against the fresh refresh queue.
    fn persist(&self, storage: &mut Storage) -> Response {
        let result = match storage.store() {
            Ok(()) => OpResult::ok(),
            Err(err) => {
                error!("error when storing changes: {err}");
                OpResult::failure(&err, "could not save database")
            }
        };
        self.refresh.notify_one();
        Response::Result(result)
    }

    async fn list(&self) -> Response {
        let storage = self.storage.lock().await;
        Response::Resources {
            result: OpResult::ok(),
            resources: storage.list(),
        }
    }

    /// Deletion shared by every variant without extra teardown. The type
    /// comes from the method, not the client-supplied name.
    async fn delete(&self, rtype: ResourceType, name: ResourceName) -> Response {
        let mut storage = self.storage.lock().await;
        let target = ResourceName::new(rtype, &name.id);
        if let Err(err) = storage.remove(&target) {
            return Response::failure(&err, format!("could not remove '{target}'"));
        }
        self.persist(&mut storage)
    }

    // ========================================================================
    // Serial
    // ========================================================================

    async fn create_serial(&self, view: SerialView) -> Response {
        let mut storage = self.storage.lock().await;
        let serial = match Serial::new(&view.id, view.min, view.max) {
            Ok(serial) => serial,
            Err(err) => {
                return Response::failure(&err, format!("could not create serial '{}'", view.id))
            }
        };
        if let Err(err) = storage.add_serial(serial) {
            return Response::failure(&err, format!("could not add serial '{}'", view.id));
        }
        self.persist(&mut storage)
    }

    async fn set_serial(&self, change: SerialChange) -> Response {
        let mut storage = self.storage.lock().await;
        let id = change.serial.id.clone();
        {
            let serial = match storage.serial_mut(&id) {
                Ok(serial) => serial,
                Err(err) => {
                    return Response::failure(&err, format!("could not find serial '{id}'"))
                }
            };
            let (mut min, mut max) = (serial.min, serial.max);
            for field in &change.field_list {
                match field.as_str() {
                    "min" => min = change.serial.min,
                    "max" => max = change.serial.max,
                    _ => {
                        return Response::failure(
                            Error::UnknownField(field.clone()),
                            format!("unknown field '{field}'"),
                        )
                    }
                }
            }
            if max - min < 1 {
                return Response::failure(
                    Error::LengthTooSmall,
                    format!("could not update serial '{id}'"),
                );
            }
            serial.min = min;
            serial.max = max;
        }
        if let Err(err) = storage.update(&ResourceName::new(ResourceType::Serial, &id)) {
            return Response::failure(&err, format!("could not update serial '{id}'"));
        }
        self.persist(&mut storage)
    }

    async fn show_serial(&self, name: ResourceName) -> Response {
        let storage = self.storage.lock().await;
        match storage.serial(&name.id) {
            Ok(serial) => Response::Serials {
                result: OpResult::ok(),
                serials: vec![serial_view(serial)],
            },
            Err(err) => Response::Serials {
                result: OpResult::failure(&err, format!("could not find serial '{}'", name.id)),
                serials: vec![],
            },
        }
    }

    async fn list_serial(&self) -> Response {
        let storage = self.storage.lock().await;
        Response::Serials {
            result: OpResult::ok(),
            serials: storage.serials().map(serial_view).collect(),
        }
    }

    // ========================================================================
    // Subject
    // ========================================================================

    async fn create_subject(&self, view: SubjectView) -> Response {
        let mut storage = self.storage.lock().await;
        let subject = match Subject::new(&view.id, view.name) {
            Ok(subject) => subject,
            Err(err) => {
                return Response::failure(&err, format!("could not create subject '{}'", view.id))
            }
        };
        if let Err(err) = storage.add_subject(subject) {
            return Response::failure(&err, format!("could not add subject '{}'", view.id));
        }
        self.persist(&mut storage)
    }

    async fn set_subject(&self, change: SubjectChange) -> Response {
        let mut storage = self.storage.lock().await;
        let id = change.subject.id.clone();
        let changes = &change.subject.name;
        {
            let subject = match storage.subject_mut(&id) {
                Ok(subject) => subject,
                Err(err) => {
                    return Response::failure(&err, format!("could not find subject '{id}'"))
                }
            };
            for field in &change.field_list {
                match field.as_str() {
                    "serial" => subject.data.serial = changes.serial.clone(),
                    "common-name" => subject.data.common_name = changes.common_name.clone(),
                    "country" => subject.data.country = changes.country.clone(),
                    "org" => subject.data.organization = changes.organization.clone(),
                    "org-unit" => {
                        subject.data.organizational_unit = changes.organizational_unit.clone()
                    }
                    "locality" => subject.data.locality = changes.locality.clone(),
                    "province" => subject.data.province = changes.province.clone(),
                    "street" => subject.data.street_address = changes.street_address.clone(),
                    "code" => subject.data.postal_code = changes.postal_code.clone(),
                    _ => {
                        return Response::failure(
                            Error::UnknownField(field.clone()),
                            format!("unknown field '{field}'"),
                        )
                    }
                }
            }
        }
        if let Err(err) = storage.update(&ResourceName::new(ResourceType::Subject, &id)) {
            return Response::failure(&err, format!("could not update subject '{id}'"));
        }
        self.persist(&mut storage)
    }

    async fn show_subject(&self, name: ResourceName) -> Response {
        let storage = self.storage.lock().await;
        match storage.subject(&name.id) {
            Ok(subject) => Response::Subjects {
                result: OpResult::ok(),
                subjects: vec![subject_view(subject)],
            },
            Err(err) => Response::Subjects {
                result: OpResult::failure(&err, format!("could not find subject '{}'", name.id)),
                subjects: vec![],
            },
        }
    }

    async fn list_subject(&self) -> Response {
        let storage = self.storage.lock().await;
        Response::Subjects {
            result: OpResult::ok(),
            subjects: storage.subjects().map(subject_view).collect(),
        }
    }

    // ========================================================================
    // Private key
    // ========================================================================

    async fn create_private_key(&self, view: PrivateKeyView) -> Response {
        let mut storage = self.storage.lock().await;
        let private_key = match PrivateKey::new(&view.id, view.algorithm, view.bits) {
            Ok(private_key) => private_key,
            Err(err) => {
                return Response::failure(
                    &err,
                    format!("could not create private key '{}'", view.id),
                )
            }
        };
        if let Err(err) = storage.add_private_key(private_key) {
            return Response::failure(&err, format!("could not add private key '{}'", view.id));
        }
        self.persist(&mut storage)
    }

    async fn set_private_key(&self, change: PrivateKeyChange) -> Response {
        let mut storage = self.storage.lock().await;
        let id = change.private_key.id.clone();
        {
            let private_key = match storage.private_key_mut(&id) {
                Ok(private_key) => private_key,
                Err(err) => {
                    return Response::failure(&err, format!("could not find private key '{id}'"))
                }
            };
            let (mut algorithm, mut bits) = (private_key.algorithm, private_key.bits);
            for field in &change.field_list {
                match field.as_str() {
                    "type" => algorithm = change.private_key.algorithm,
                    "bits" => bits = change.private_key.bits,
                    _ => {
                        return Response::failure(
                            Error::UnknownField(field.clone()),
                            format!("unknown field '{field}'"),
                        )
                    }
                }
            }
            if let Err(err) = crypto::validate_key_spec(algorithm, bits) {
                return Response::failure(&err, format!("could not update private key '{id}'"));
            }
            private_key.algorithm = algorithm;
            private_key.bits = bits;
        }
        if let Err(err) = storage.update(&ResourceName::new(ResourceType::PrivateKey, &id)) {
            return Response::failure(&err, format!("could not update private key '{id}'"));
        }
        self.persist(&mut storage)
    }

    async fn show_private_key(&self, name: ResourceName) -> Response {
        let storage = self.storage.lock().await;
        match storage.private_key(&name.id) {
            Ok(private_key) => Response::PrivateKeys {
                result: OpResult::ok(),
                private_keys: vec![private_key_view(private_key)],
            },
            Err(err) => Response::PrivateKeys {
                result: OpResult::failure(
                    &err,
                    format!("could not find private key '{}'", name.id),
                ),
                private_keys: vec![],
            },
        }
    }

    async fn list_private_key(&self) -> Response {
        let storage = self.storage.lock().await;
        Response::PrivateKeys {
            result: OpResult::ok(),
            private_keys: storage.private_keys().map(private_key_view).collect(),
        }
    }

    // ========================================================================
    // Public key
    // ========================================================================

    async fn create_public_key(&self, view: PublicKeyView) -> Response {
        let mut storage = self.storage.lock().await;
        let private_key = ResourceName::new(ResourceType::PrivateKey, &view.private_key.id);
        let public_key = match PublicKey::new(&view.id, private_key, view.refresh_after, 0) {
            Ok(public_key) => public_key,
            Err(err) => {
                return Response::failure(
                    &err,
                    format!("could not create public key '{}'", view.id),
                )
            }
        };
        if let Err(err) = storage.add_public_key(public_key) {
            return Response::failure(&err, format!("could not add public key '{}'", view.id));
        }
        self.persist(&mut storage)
    }

    async fn set_public_key(&self, change: PublicKeyChange) -> Response {
        let mut storage = self.storage.lock().await;
        let id = change.public_key.id.clone();
        let name = ResourceName::new(ResourceType::PublicKey, &id);
        let previous = match storage.public_key(&id) {
            Ok(public_key) => public_key.depends_on(),
            Err(err) => {
                return Response::failure(&err, format!("could not find public key '{id}'"))
            }
        };

        let mut new_private: Option<ResourceName> = None;
        let mut new_refresh: Option<i64> = None;
        for field in &change.field_list {
            match field.as_str() {
                "private-key" => {
                    new_private = Some(ResourceName::new(
                        ResourceType::PrivateKey,
                        &change.public_key.private_key.id,
                    ))
                }
                "refresh-after" => new_refresh = Some(change.public_key.refresh_after),
                _ => {
                    return Response::failure(
                        Error::UnknownField(field.clone()),
                        format!("unknown field '{field}'"),
                    )
                }
            }
        }
        if let Some(dep) = &new_private {
            if storage.would_cycle(&name, dep) {
                return Response::failure(
                    Error::DependencyCycle(name.to_string()),
                    format!("could not update public key '{id}'"),
                );
            }
        }
        {
            let public_key = match storage.public_key_mut(&id) {
                Ok(public_key) => public_key,
                Err(err) => {
                    return Response::failure(&err, format!("could not find public key '{id}'"))
                }
            };
            if let Some(dep) = new_private {
                public_key.private_key = dep;
            }
            if let Some(seconds) = new_refresh {
                public_key.interval.refresh_after = seconds;
            }
        }
        if let Err(err) = storage.rewire_dependencies(&name, &previous) {
            return Response::failure(&err, format!("could not update public key '{id}'"));
        }
        if let Err(err) = storage.update(&name) {
            return Response::failure(&err, format!("could not update public key '{id}'"));
        }
        self.persist(&mut storage)
    }

    async fn show_public_key(&self, name: ResourceName) -> Response {
        let storage = self.storage.lock().await;
        match storage.public_key(&name.id) {
            Ok(public_key) => Response::PublicKeys {
                result: OpResult::ok(),
                public_keys: vec![public_key_view(public_key)],
            },
            Err(err) => Response::PublicKeys {
                result: OpResult::failure(&err, format!("could not find public key '{}'", name.id)),
                public_keys: vec![],
            },
        }
    }

    async fn list_public_key(&self) -> Response {
        let storage = self.storage.lock().await;
        Response::PublicKeys {
            result: OpResult::ok(),
            public_keys: storage.public_keys().map(public_key_view).collect(),
        }
    }

    // ========================================================================
    // CSR
    // ========================================================================

    async fn create_csr(&self, view: CsrView) -> Response {
        let mut storage = self.storage.lock().await;
        let csr = match Csr::new(
            &view.id,
            ResourceName::new(ResourceType::PrivateKey, &view.private_key.id),
            ResourceName::new(ResourceType::Subject, &view.subject.id),
            view.dns_names,
            view.email_addresses,
            view.ip_addresses,
            view.refresh_after,
            0,
        ) {
            Ok(csr) => csr,
            Err(err) => {
                return Response::failure(&err, format!("could not create CSR '{}'", view.id))
            }
        };
        if let Err(err) = storage.add_csr(csr) {
            return Response::failure(&err, format!("could not add CSR '{}'", view.id));
        }
        self.persist(&mut storage)
    }

    async fn set_csr(&self, change: CsrChange) -> Response {
        let mut storage = self.storage.lock().await;
        let id = change.csr.id.clone();
        let name = ResourceName::new(ResourceType::Csr, &id);
        let previous = match storage.csr(&id) {
            Ok(csr) => csr.depends_on(),
            Err(err) => return Response::failure(&err, format!("could not find CSR '{id}'")),
        };

        let mut new_private: Option<ResourceName> = None;
        let mut new_subject: Option<ResourceName> = None;
        let mut new_ips = None;
        let mut new_dns = None;
        let mut new_mails = None;
        let mut new_refresh: Option<i64> = None;
        for field in &change.field_list {
            match field.as_str() {
                "private-key" => {
                    new_private = Some(ResourceName::new(
                        ResourceType::PrivateKey,
                        &change.csr.private_key.id,
                    ))
                }
                "subject" => {
                    new_subject = Some(ResourceName::new(
                        ResourceType::Subject,
                        &change.csr.subject.id,
                    ))
                }
                "ip" => new_ips = Some(change.csr.ip_addresses.clone()),
                "fqdn" => new_dns = Some(change.csr.dns_names.clone()),
                "mail" => new_mails = Some(change.csr.email_addresses.clone()),
                "refresh-after" => new_refresh = Some(change.csr.refresh_after),
                _ => {
                    return Response::failure(
                        Error::UnknownField(field.clone()),
                        format!("unknown field '{field}'"),
                    )
                }
            }
        }
        for dep in [new_private.as_ref(), new_subject.as_ref()].into_iter().flatten() {
            if storage.would_cycle(&name, dep) {
                return Response::failure(
                    Error::DependencyCycle(name.to_string()),
                    format!("could not update CSR '{id}'"),
                );
            }
        }
        {
            let csr = match storage.csr_mut(&id) {
                Ok(csr) => csr,
                Err(err) => return Response::failure(&err, format!("could not find CSR '{id}'")),
            };
            if let Some(dep) = new_private {
                csr.private_key = dep;
            }
            if let Some(dep) = new_subject {
                csr.subject = dep;
            }
            if let Some(ips) = new_ips {
                csr.ip_addresses = ips;
            }
            if let Some(dns) = new_dns {
                csr.dns_names = dns;
            }
            if let Some(mails) = new_mails {
                csr.email_addresses = mails;
            }
            if let Some(seconds) = new_refresh {
                csr.interval.refresh_after = seconds;
            }
        }
        if let Err(err) = storage.rewire_dependencies(&name, &previous) {
            return Response::failure(&err, format!("could not update CSR '{id}'"));
        }
        if let Err(err) = storage.update(&name) {
            return Response::failure(&err, format!("could not update CSR '{id}'"));
        }
        self.persist(&mut storage)
    }

    async fn show_csr(&self, name: ResourceName) -> Response {
        let storage = self.storage.lock().await;
        match storage.csr(&name.id) {
            Ok(csr) => Response::Csrs {
                result: OpResult::ok(),
                csrs: vec![csr_view(csr)],
            },
            Err(err) => Response::Csrs {
                result: OpResult::failure(&err, format!("could not find CSR '{}'", name.id)),
                csrs: vec![],
            },
        }
    }

    async fn list_csr(&self) -> Response {
        let storage = self.storage.lock().await;
        Response::Csrs {
            result: OpResult::ok(),
            csrs: storage.csrs().map(csr_view).collect(),
        }
    }

    // ========================================================================
    // Certificate
    // ========================================================================

    async fn create_certificate(&self, view: CertificateView) -> Response {
        let mut storage = self.storage.lock().await;
        let certificate = match Certificate::new(
            &view.id,
            ResourceName::new(ResourceType::PrivateKey, &view.private_key.id),
            ResourceName::new(ResourceType::Serial, &view.serial.id),
            ResourceName::new(ResourceType::Csr, &view.csr.id),
            ResourceName::new(ResourceType::Ca, &view.ca.id),
            view.is_ca,
            view.duration,
        ) {
            Ok(certificate) => certificate,
            Err(err) => {
                return Response::failure(
                    &err,
                    format!("could not create certificate '{}'", view.id),
                )
            }
        };
        if let Err(err) = storage.add_certificate(certificate) {
            return Response::failure(&err, format!("could not add certificate '{}'", view.id));
        }
        self.persist(&mut storage)
    }

    async fn set_certificate(&self, change: CertificateChange) -> Response {
        let mut storage = self.storage.lock().await;
        let id = change.certificate.id.clone();
        let name = ResourceName::new(ResourceType::Certificate, &id);
        let previous = match storage.certificate(&id) {
            Ok(certificate) => certificate.depends_on(),
            Err(err) => {
                return Response::failure(&err, format!("could not find certificate '{id}'"))
            }
        };

        let mut new_duration: Option<i64> = None;
        let mut new_private: Option<ResourceName> = None;
        let mut new_csr: Option<ResourceName> = None;
        let mut new_serial: Option<ResourceName> = None;
        let mut new_ca: Option<ResourceName> = None;
        let mut new_self_sign: Option<bool> = None;
        for field in &change.field_list {
            match field.as_str() {
                "duration" => new_duration = Some(change.certificate.duration),
                "private" => {
                    new_private = Some(ResourceName::new(
                        ResourceType::PrivateKey,
                        &change.certificate.private_key.id,
                    ))
                }
                "csr" => {
                    new_csr = Some(ResourceName::new(
                        ResourceType::Csr,
                        &change.certificate.csr.id,
                    ))
                }
                "serial" => {
                    new_serial = Some(ResourceName::new(
                        ResourceType::Serial,
                        &change.certificate.serial.id,
                    ))
                }
                "ca" => {
                    new_ca = Some(ResourceName::new(
                        ResourceType::Ca,
                        &change.certificate.ca.id,
                    ))
                }
                "self-sign" => new_self_sign = Some(change.certificate.is_ca),
                _ => {
                    return Response::failure(
                        Error::UnknownField(field.clone()),
                        format!("unknown field '{field}'"),
                    )
                }
            }
        }
        for dep in [
            new_private.as_ref(),
            new_csr.as_ref(),
            new_serial.as_ref(),
            new_ca.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            if storage.would_cycle(&name, dep) {
                return Response::failure(
                    Error::DependencyCycle(name.to_string()),
                    format!("could not update certificate '{id}'"),
                );
            }
        }
        {
            let certificate = match storage.certificate_mut(&id) {
                Ok(certificate) => certificate,
                Err(err) => {
                    return Response::failure(&err, format!("could not find certificate '{id}'"))
                }
            };
            if let Some(duration) = new_duration {
                certificate.duration = duration;
            }
            if let Some(dep) = new_private {
                certificate.private_key = dep;
            }
            if let Some(dep) = new_csr {
                certificate.csr = dep;
            }
            if let Some(dep) = new_serial {
                certificate.serial = dep;
            }
            if let Some(dep) = new_ca {
                certificate.ca = dep;
            }
            if let Some(self_sign) = new_self_sign {
                certificate.is_ca = self_sign;
            }
        }
        if let Err(err) = storage.rewire_dependencies(&name, &previous) {
            return Response::failure(&err, format!("could not update certificate '{id}'"));
        }
        if let Err(err) = storage.update(&name) {
            return Response::failure(&err, format!("could not update certificate '{id}'"));
        }
        self.persist(&mut storage)
    }

    async fn show_certificate(&self, name: ResourceName) -> Response {
        let storage = self.storage.lock().await;
        match storage.certificate(&name.id) {
            Ok(certificate) => Response::Certificates {
                result: OpResult::ok(),
                certificates: vec![certificate_view(certificate)],
            },
            Err(err) => Response::Certificates {
                result: OpResult::failure(
                    &err,
                    format!("could not find certificate '{}'", name.id),
                ),
                certificates: vec![],
            },
        }
    }

    async fn list_certificate(&self) -> Response {
        let storage = self.storage.lock().await;
        Response::Certificates {
            result: OpResult::ok(),
            certificates: storage.certificates().map(certificate_view).collect(),
        }
    }

    // ========================================================================
    // CA
    // ========================================================================

    async fn create_ca(&self, view: CaView) -> Response {
        let mut storage = self.storage.lock().await;
        let ca = match Ca::new(
            &view.id,
            view.kind,
            ResourceName::new(ResourceType::Certificate, &view.certificate.id),
        ) {
            Ok(ca) => ca,
            Err(err) => {
                return Response::failure(&err, format!("could not create CA '{}'", view.id))
            }
        };
        if let Err(err) = storage.add_ca(ca) {
            return Response::failure(&err, format!("could not add CA '{}'", view.id));
        }
        self.persist(&mut storage)
    }

    async fn set_ca(&self, change: CaChange) -> Response {
        let mut storage = self.storage.lock().await;
        let id = change.ca.id.clone();
        let name = ResourceName::new(ResourceType::Ca, &id);
        let previous = match storage.ca(&id) {
            Ok(ca) => ca.depends_on(),
            Err(err) => return Response::failure(&err, format!("could not find CA '{id}'")),
        };

        let mut new_kind = None;
        let mut new_certificate: Option<ResourceName> = None;
        for field in &change.field_list {
            match field.as_str() {
                "type" => new_kind = Some(change.ca.kind),
                "certificate" => {
                    new_certificate = Some(ResourceName::new(
                        ResourceType::Certificate,
                        &change.ca.certificate.id,
                    ))
                }
                _ => {
                    return Response::failure(
                        Error::UnknownField(field.clone()),
                        format!("unknown field '{field}'"),
                    )
                }
            }
        }
        if let Some(dep) = &new_certificate {
            if storage.would_cycle(&name, dep) {
                return Response::failure(
                    Error::DependencyCycle(name.to_string()),
                    format!("could not update CA '{id}'"),
                );
            }
        }
        {
            let ca = match storage.ca_mut(&id) {
                Ok(ca) => ca,
                Err(err) => return Response::failure(&err, format!("could not find CA '{id}'")),
            };
            if let Some(kind) = new_kind {
                ca.kind = kind;
            }
            if let Some(dep) = new_certificate {
                ca.certificate = dep;
            }
        }
        if let Err(err) = storage.rewire_dependencies(&name, &previous) {
            return Response::failure(&err, format!("could not update CA '{id}'"));
        }
        if let Err(err) = storage.update(&name) {
            return Response::failure(&err, format!("could not update CA '{id}'"));
        }
        self.persist(&mut storage)
    }

    async fn show_ca(&self, name: ResourceName) -> Response {
        let storage = self.storage.lock().await;
        match storage.ca(&name.id) {
            Ok(ca) => Response::Cas {
                result: OpResult::ok(),
                cas: vec![ca_view(ca)],
            },
            Err(err) => Response::Cas {
                result: OpResult::failure(&err, format!("could not find CA '{}'", name.id)),
                cas: vec![],
            },
        }
    }

    async fn list_ca(&self) -> Response {
        let storage = self.storage.lock().await;
        Response::Cas {
            result: OpResult::ok(),
            cas: storage.cas().map(ca_view).collect(),
        }
    }

    // ========================================================================
    // Location
    // ========================================================================

    async fn create_location(&self, view: LocationView) -> Response {
        let mut storage = self.storage.lock().await;
        let location = match Location::new(
            &view.id,
            view.path,
            view.pre_command,
            view.post_command,
            view.dependencies,
        ) {
            Ok(location) => location,
            Err(err) => {
                return Response::failure(&err, format!("could not create location '{}'", view.id))
            }
        };
        if let Err(err) = storage.add_location(location) {
            return Response::failure(&err, format!("could not add location '{}'", view.id));
        }
        self.persist(&mut storage)
    }

    async fn set_location(&self, change: LocationChange) -> Response {
        let mut storage = self.storage.lock().await;
        let id = change.location.id.clone();
        let name = ResourceName::new(ResourceType::Location, &id);
        let previous = match storage.location(&id) {
            Ok(location) => location.depends_on(),
            Err(err) => return Response::failure(&err, format!("could not find location '{id}'")),
        };

        let mut new_path = None;
        let mut new_pre = None;
        let mut new_post = None;
        let mut new_deps: Option<Vec<ResourceName>> = None;
        for field in &change.field_list {
            match field.as_str() {
                "path" => new_path = Some(change.location.path.clone()),
                "pre-cmd" => new_pre = Some(change.location.pre_command.clone()),
                "post-cmd" => new_post = Some(change.location.post_command.clone()),
                "resources" => new_deps = Some(change.location.dependencies.clone()),
                _ => {
                    return Response::failure(
                        Error::UnknownField(field.clone()),
                        format!("unknown field '{field}'"),
                    )
                }
            }
        }
        if let Some(deps) = &new_deps {
            if let Err(err) = reject_location_deps(deps) {
                return Response::failure(&err, format!("could not update location '{id}'"));
            }
        }
        {
            let location = match storage.location_mut(&id) {
                Ok(location) => location,
                Err(err) => {
                    return Response::failure(&err, format!("could not find location '{id}'"))
                }
            };
            if let Some(path) = new_path {
                location.path = path;
            }
            if let Some(pre) = new_pre {
                location.pre_command = pre;
            }
            if let Some(post) = new_post {
                location.post_command = post;
            }
            if let Some(deps) = new_deps {
                location.dependencies = deps;
            }
        }
        if let Err(err) = storage.rewire_dependencies(&name, &previous) {
            return Response::failure(&err, format!("could not update location '{id}'"));
        }
        if let Err(err) = storage.update(&name) {
            return Response::failure(&err, format!("could not update location '{id}'"));
        }
        self.persist(&mut storage)
    }

    /// Deleting a location also removes its export file (already-gone files
    /// are fine) and runs the post-command.
    async fn delete_location(&self, name: ResourceName) -> Response {
        let mut storage = self.storage.lock().await;
        let target = ResourceName::new(ResourceType::Location, &name.id);
        let (path, post_command) = match storage.location(&name.id) {
            Ok(location) => (location.path.clone(), location.post_command.clone()),
            Err(err) => {
                return Response::failure(&err, format!("could not find location '{}'", name.id))
            }
        };
        if let Err(err) = storage.remove(&target) {
            return Response::failure(&err, format!("could not remove location '{}'", name.id));
        }
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Response::failure(
                    &err,
                    format!(
                        "could not remove file '{}' for location '{}'",
                        path.display(),
                        name.id
                    ),
                )
            }
        }
        if !post_command.is_empty() {
            if let Err(err) = run_hook(&post_command, &path) {
                return Response::failure(
                    &err,
                    format!("could not run post command after deleting '{}'", name.id),
                );
            }
        }
        self.persist(&mut storage)
    }

    async fn show_location(&self, name: ResourceName) -> Response {
        let storage = self.storage.lock().await;
        match storage.location(&name.id) {
            Ok(location) => Response::Locations {
                result: OpResult::ok(),
                locations: vec![location_view(location)],
            },
            Err(err) => Response::Locations {
                result: OpResult::failure(&err, format!("could not find location '{}'", name.id)),
                locations: vec![],
            },
        }
    }

    async fn list_location(&self) -> Response {
        let storage = self.storage.lock().await;
        Response::Locations {
            result: OpResult::ok(),
            locations: storage.locations().map(location_view).collect(),
        }
    }
}

// ============================================================================
// View construction
// ============================================================================

fn serial_view(serial: &Serial) -> SerialView {
    SerialView {
        id: serial.id.clone(),
        min: serial.min,
        max: serial.max,
    }
}

fn subject_view(subject: &Subject) -> SubjectView {
    SubjectView {
        id: subject.id.clone(),
        name: subject.data.clone(),
    }
}

fn private_key_view(private_key: &PrivateKey) -> PrivateKeyView {
    PrivateKeyView {
        id: private_key.id.clone(),
        algorithm: private_key.algorithm,
        bits: private_key.bits,
        checksum: private_key.checksum(),
    }
}

fn public_key_view(public_key: &PublicKey) -> PublicKeyView {
    PublicKeyView {
        id: public_key.id.clone(),
        private_key: public_key.private_key.clone(),
        algorithm: public_key.algorithm,
        refresh_after: public_key.interval.refresh_after,
        checksum: public_key.checksum(),
    }
}

fn csr_view(csr: &Csr) -> CsrView {
    CsrView {
        id: csr.id.clone(),
        private_key: csr.private_key.clone(),
        subject: csr.subject.clone(),
        dns_names: csr.dns_names.clone(),
        email_addresses: csr.email_addresses.clone(),
        ip_addresses: csr.ip_addresses.clone(),
        refresh_after: csr.interval.refresh_after,
        checksum: csr.checksum(),
    }
}

fn certificate_view(certificate: &Certificate) -> CertificateView {
    CertificateView {
        id: certificate.id.clone(),
        is_ca: certificate.is_ca,
        duration: certificate.duration,
        private_key: certificate.private_key.clone(),
        serial: certificate.serial.clone(),
        csr: certificate.csr.clone(),
        ca: certificate.ca.clone(),
        checksum: certificate.checksum(),
    }
}

fn ca_view(ca: &Ca) -> CaView {
    CaView {
        id: ca.id.clone(),
        kind: ca.kind,
        certificate: ca.certificate.clone(),
    }
}

fn location_view(location: &Location) -> LocationView {
    LocationView {
        id: location.id.clone(),
        path: location.path.clone(),
        dependencies: location.dependencies.clone(),
        pre_command: location.pre_command.clone(),
        post_command: location.post_command.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyAlgorithm;
    use tempfile::TempDir;

    fn handler(dir: &TempDir) -> Handler {
        let storage = Storage::open(dir.path().join("pkiadm.db")).unwrap();
        Handler::new(Arc::new(Mutex::new(storage)), Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn create_show_round_trip() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);

        let reply = handler
            .dispatch(Request::CreatePrivateKey(PrivateKeyView {
                id: "k1".to_string(),
                algorithm: KeyAlgorithm::Ecdsa,
                bits: 256,
                checksum: String::new(),
            }))
            .await;
        assert!(!reply.result().has_error, "{:?}", reply.result());

        let reply = handler
            .dispatch(Request::ShowPrivateKey(ResourceName::new(
                ResourceType::PrivateKey,
                "k1",
            )))
            .await;
        match reply {
            Response::PrivateKeys { result, private_keys } => {
                assert!(!result.has_error);
                assert_eq!(private_keys.len(), 1);
                assert!(!private_keys[0].checksum.is_empty());
            }
            other => panic!("wrong reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_create_is_reported() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        let view = SerialView {
            id: "sr".to_string(),
            min: 1,
            max: 100,
        };
        let reply = handler.dispatch(Request::CreateSerial(view.clone())).await;
        assert!(!reply.result().has_error);
        let reply = handler.dispatch(Request::CreateSerial(view)).await;
        assert!(reply.result().has_error);
        assert_eq!(reply.result().error, "resource already exists");
    }

    #[tokio::test]
    async fn delete_normalises_the_resource_type() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir);
        handler
            .dispatch(Request::CreateSerial(SerialView {
                id: "sr".to_string(),
                min: 1,
                max: 100,
            }))
            .await;
        // The client may leave the type tag off; the method decides it.
        let reply = handler
            .dispatch(Request::DeleteSerial(ResourceName {
                id: "sr".to_string(),
                rtype: ResourceType::Unknown,
            }))
            .await;
        assert!(!reply.result().has_error, "{:?}", reply.result());
    }
}
