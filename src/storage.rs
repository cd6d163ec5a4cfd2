//! Resource graph storage.
//!
//! One `Storage` owns the eight variant tables, the reverse dependency
//! index and the refresh queue. It is the only shared mutable state of the
//! daemon and always lives behind the request handler's mutex.
//!
//! # Persistence
//!
//! The whole graph serialises to a single JSON document (one object member
//! per variant map, PEM caches and used-serial sets embedded) so a restart
//! restores every artefact byte for byte. The reverse index and the refresh
//! queue are derived state and are rebuilt on load. Writes go to a sibling
//! temp file first and are moved into place, so a crash mid-write cannot
//! truncate the database.
//!
//! # Updates
//!
//! `update` performs the transitive refresh: breadth-first over the reverse
//! index starting at the changed node, visiting every dependant once, in an
//! order that guarantees upstreams refresh before their dependants. The
//! first refresh error aborts the fan-out.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::resources::{
    Ca, Certificate, Csr, Location, PrivateKey, PublicKey, Resource, ResourceName, ResourceRef,
    ResourceType, Serial, Subject,
};

/// One entry of the refresh queue: a scheduled resource and the time it is
/// next due.
#[derive(Debug, Clone)]
pub struct RefreshEntry {
    pub name: ResourceName,
    pub due: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Storage {
    #[serde(skip)]
    path: PathBuf,
    #[serde(rename = "PrivateKeys", default)]
    private_keys: BTreeMap<String, PrivateKey>,
    #[serde(rename = "PublicKeys", default)]
    public_keys: BTreeMap<String, PublicKey>,
    #[serde(rename = "Locations", default)]
    locations: BTreeMap<String, Location>,
    #[serde(rename = "Certificates", default)]
    certificates: BTreeMap<String, Certificate>,
    #[serde(rename = "CSRs", default)]
    csrs: BTreeMap<String, Csr>,
    #[serde(rename = "Serials", default)]
    serials: BTreeMap<String, Serial>,
    #[serde(rename = "Subjects", default)]
    subjects: BTreeMap<String, Subject>,
    #[serde(rename = "CAs", default)]
    cas: BTreeMap<String, Ca>,
    /// Reverse adjacency: resource name string to the set of resources
    /// depending on it. Derived, never persisted.
    #[serde(skip)]
    dependencies: BTreeMap<String, BTreeSet<ResourceName>>,
    /// Scheduled resources ordered by due time. Derived, never persisted.
    #[serde(skip)]
    refresh_queue: Vec<RefreshEntry>,
}

impl Storage {
    /// Load the storage from `path`, tolerating a missing file (fresh
    /// database). Rebuilds the dependency index and the refresh queue.
    pub fn open(path: PathBuf) -> Result<Storage> {
        let mut storage = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<Storage>(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Storage::default(),
            Err(err) => return Err(err.into()),
        };
        storage.path = path;
        storage.reindex_dependencies();
        storage.scan_for_refresh();
        Ok(storage)
    }

    /// Write the full graph to disk: temp file with mode 0600, then rename
    /// over the database path.
    pub fn store(&self) -> Result<()> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let raw = serde_json::to_vec_pretty(self)?;
        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(&raw)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    // ========================================================================
    // Dependency index
    // ========================================================================

    /// Rebuild the reverse index from scratch. Broken upstream references
    /// are logged and skipped; a half-broken database must still load.
    fn reindex_dependencies(&mut self) {
        self.dependencies.clear();
        let mut edges = Vec::new();
        for (name, deps) in self.all_nodes() {
            for dep in deps {
                edges.push((name.clone(), dep));
            }
        }
        for (dependant, upstream) in edges {
            if self.get(&upstream).is_err() {
                warn!(
                    "problem with dependency '{}' of '{}': resource not found",
                    upstream, dependant
                );
                continue;
            }
            self.dependencies
                .entry(upstream.to_string())
                .or_default()
                .insert(dependant);
        }
    }

    fn all_nodes(&self) -> Vec<(ResourceName, Vec<ResourceName>)> {
        let mut nodes = Vec::new();
        nodes.extend(self.serials.values().map(|r| (r.name(), r.depends_on())));
        nodes.extend(self.subjects.values().map(|r| (r.name(), r.depends_on())));
        nodes.extend(self.private_keys.values().map(|r| (r.name(), r.depends_on())));
        nodes.extend(self.public_keys.values().map(|r| (r.name(), r.depends_on())));
        nodes.extend(self.csrs.values().map(|r| (r.name(), r.depends_on())));
        nodes.extend(self.certificates.values().map(|r| (r.name(), r.depends_on())));
        nodes.extend(self.locations.values().map(|r| (r.name(), r.depends_on())));
        nodes.extend(self.cas.values().map(|r| (r.name(), r.depends_on())));
        nodes
    }

    /// Register a node under each of its upstreams. Every upstream must
    /// resolve; this is what catches dangling references at add time.
    fn register_dependencies(&mut self, name: &ResourceName, deps: &[ResourceName]) -> Result<()> {
        for upstream in deps {
            self.get(upstream)?;
        }
        for upstream in deps {
            self.dependencies
                .entry(upstream.to_string())
                .or_default()
                .insert(name.clone());
        }
        Ok(())
    }

    fn unregister_dependencies(&mut self, name: &ResourceName, deps: &[ResourceName]) {
        for upstream in deps {
            let key = upstream.to_string();
            let now_empty = match self.dependencies.get_mut(&key) {
                Some(set) => {
                    set.remove(name);
                    set.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.dependencies.remove(&key);
            }
        }
    }

    /// Re-derive a node's index edges after a `Set` changed its references.
    pub fn rewire_dependencies(
        &mut self,
        name: &ResourceName,
        previous: &[ResourceName],
    ) -> Result<()> {
        self.unregister_dependencies(name, previous);
        let current = self.get(name)?.depends_on();
        self.register_dependencies(name, &current)
    }

    /// Direct dependants of a name, for diagnostics and deletion checks.
    pub fn dependants(&self, name: &ResourceName) -> Vec<ResourceName> {
        self.dependencies
            .get(&name.to_string())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Would adding an edge `node -> new_dep` close a cycle? Walks the
    /// forward dependency chains from `new_dep`; missing nodes end a chain.
    pub fn would_cycle(&self, node: &ResourceName, new_dep: &ResourceName) -> bool {
        if node == new_dep {
            return true;
        }
        let mut frontier = vec![new_dep.clone()];
        let mut seen = BTreeSet::new();
        while let Some(next) = frontier.pop() {
            if !seen.insert(next.to_string()) {
                continue;
            }
            if &next == node {
                return true;
            }
            if let Ok(resource) = self.get(&next) {
                frontier.extend(resource.depends_on());
            }
        }
        false
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Resolve a resource name to a borrowed view of the node.
    pub fn get(&self, name: &ResourceName) -> Result<ResourceRef<'_>> {
        if name.id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        let missing = || Error::NotFound(name.to_string());
        match name.rtype {
            ResourceType::Serial => {
                self.serials.get(&name.id).map(ResourceRef::Serial).ok_or_else(missing)
            }
            ResourceType::Subject => {
                self.subjects.get(&name.id).map(ResourceRef::Subject).ok_or_else(missing)
            }
            ResourceType::PrivateKey => self
                .private_keys
                .get(&name.id)
                .map(ResourceRef::PrivateKey)
                .ok_or_else(missing),
            ResourceType::PublicKey => self
                .public_keys
                .get(&name.id)
                .map(ResourceRef::PublicKey)
                .ok_or_else(missing),
            ResourceType::Csr => self.csrs.get(&name.id).map(ResourceRef::Csr).ok_or_else(missing),
            ResourceType::Certificate => self
                .certificates
                .get(&name.id)
                .map(ResourceRef::Certificate)
                .ok_or_else(missing),
            ResourceType::Location => self
                .locations
                .get(&name.id)
                .map(ResourceRef::Location)
                .ok_or_else(missing),
            ResourceType::Ca => self.cas.get(&name.id).map(ResourceRef::Ca).ok_or_else(missing),
            ResourceType::Unknown => Err(Error::UnknownType),
        }
    }

    fn take(&mut self, name: &ResourceName) -> Result<Resource> {
        if name.id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        let missing = || Error::NotFound(name.to_string());
        match name.rtype {
            ResourceType::Serial => {
                self.serials.remove(&name.id).map(Resource::Serial).ok_or_else(missing)
            }
            ResourceType::Subject => {
                self.subjects.remove(&name.id).map(Resource::Subject).ok_or_else(missing)
            }
            ResourceType::PrivateKey => self
                .private_keys
                .remove(&name.id)
                .map(Resource::PrivateKey)
                .ok_or_else(missing),
            ResourceType::PublicKey => self
                .public_keys
                .remove(&name.id)
                .map(Resource::PublicKey)
                .ok_or_else(missing),
            ResourceType::Csr => self.csrs.remove(&name.id).map(Resource::Csr).ok_or_else(missing),
            ResourceType::Certificate => self
                .certificates
                .remove(&name.id)
                .map(Resource::Certificate)
                .ok_or_else(missing),
            ResourceType::Location => self
                .locations
                .remove(&name.id)
                .map(Resource::Location)
                .ok_or_else(missing),
            ResourceType::Ca => self.cas.remove(&name.id).map(Resource::Ca).ok_or_else(missing),
            ResourceType::Unknown => Err(Error::UnknownType),
        }
    }

    fn put_back(&mut self, resource: Resource) {
        match resource {
            Resource::Serial(r) => {
                self.serials.insert(r.id.clone(), r);
            }
            Resource::Subject(r) => {
                self.subjects.insert(r.id.clone(), r);
            }
            Resource::PrivateKey(r) => {
                self.private_keys.insert(r.id.clone(), r);
            }
            Resource::PublicKey(r) => {
                self.public_keys.insert(r.id.clone(), r);
            }
            Resource::Csr(r) => {
                self.csrs.insert(r.id.clone(), r);
            }
            Resource::Certificate(r) => {
                self.certificates.insert(r.id.clone(), r);
            }
            Resource::Location(r) => {
                self.locations.insert(r.id.clone(), r);
            }
            Resource::Ca(r) => {
                self.cas.insert(r.id.clone(), r);
            }
        }
    }

    pub fn serial(&self, id: &str) -> Result<&Serial> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.serials
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("serial/{id}")))
    }

    pub fn serial_mut(&mut self, id: &str) -> Result<&mut Serial> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.serials
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("serial/{id}")))
    }

    pub fn subject(&self, id: &str) -> Result<&Subject> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.subjects
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("subject/{id}")))
    }

    pub fn subject_mut(&mut self, id: &str) -> Result<&mut Subject> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.subjects
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("subject/{id}")))
    }

    pub fn private_key(&self, id: &str) -> Result<&PrivateKey> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.private_keys
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("private/{id}")))
    }

    pub fn private_key_mut(&mut self, id: &str) -> Result<&mut PrivateKey> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.private_keys
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("private/{id}")))
    }

    pub fn public_key(&self, id: &str) -> Result<&PublicKey> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.public_keys
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("public/{id}")))
    }

    pub fn public_key_mut(&mut self, id: &str) -> Result<&mut PublicKey> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.public_keys
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("public/{id}")))
    }

    pub fn csr(&self, id: &str) -> Result<&Csr> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.csrs.get(id).ok_or_else(|| Error::NotFound(format!("csr/{id}")))
    }

    pub fn csr_mut(&mut self, id: &str) -> Result<&mut Csr> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.csrs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("csr/{id}")))
    }

    pub fn certificate(&self, id: &str) -> Result<&Certificate> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.certificates
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("cert/{id}")))
    }

    pub fn certificate_mut(&mut self, id: &str) -> Result<&mut Certificate> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.certificates
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("cert/{id}")))
    }

    pub fn ca(&self, id: &str) -> Result<&Ca> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.cas.get(id).ok_or_else(|| Error::NotFound(format!("ca/{id}")))
    }

    pub fn ca_mut(&mut self, id: &str) -> Result<&mut Ca> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.cas.get_mut(id).ok_or_else(|| Error::NotFound(format!("ca/{id}")))
    }

    pub fn location(&self, id: &str) -> Result<&Location> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.locations
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("location/{id}")))
    }

    pub fn location_mut(&mut self, id: &str) -> Result<&mut Location> {
        if id.is_empty() {
            return Err(Error::NoIdGiven);
        }
        self.locations
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("location/{id}")))
    }

    pub fn serials(&self) -> impl Iterator<Item = &Serial> {
        self.serials.values()
    }

    pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.values()
    }

    pub fn private_keys(&self) -> impl Iterator<Item = &PrivateKey> {
        self.private_keys.values()
    }

    pub fn public_keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.public_keys.values()
    }

    pub fn csrs(&self) -> impl Iterator<Item = &Csr> {
        self.csrs.values()
    }

    pub fn certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.values()
    }

    pub fn cas(&self) -> impl Iterator<Item = &Ca> {
        self.cas.values()
    }

    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        self.locations.values()
    }

    /// Every registered resource name, across all variant tables.
    pub fn list(&self) -> Vec<ResourceName> {
        self.all_nodes().into_iter().map(|(name, _)| name).collect()
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    pub fn add_serial(&mut self, mut serial: Serial) -> Result<()> {
        if self.serials.contains_key(&serial.id) {
            return Err(Error::AlreadyExists);
        }
        serial.refresh(self)?;
        self.register_dependencies(&serial.name(), &serial.depends_on())?;
        self.serials.insert(serial.id.clone(), serial);
        self.scan_for_refresh();
        Ok(())
    }

    pub fn add_subject(&mut self, mut subject: Subject) -> Result<()> {
        if self.subjects.contains_key(&subject.id) {
            return Err(Error::AlreadyExists);
        }
        subject.refresh(self)?;
        self.register_dependencies(&subject.name(), &subject.depends_on())?;
        self.subjects.insert(subject.id.clone(), subject);
        self.scan_for_refresh();
        Ok(())
    }

    pub fn add_private_key(&mut self, mut private_key: PrivateKey) -> Result<()> {
        if self.private_keys.contains_key(&private_key.id) {
            return Err(Error::AlreadyExists);
        }
        private_key.refresh(self)?;
        self.register_dependencies(&private_key.name(), &private_key.depends_on())?;
        self.private_keys.insert(private_key.id.clone(), private_key);
        self.scan_for_refresh();
        Ok(())
    }

    pub fn add_public_key(&mut self, mut public_key: PublicKey) -> Result<()> {
        if self.public_keys.contains_key(&public_key.id) {
            return Err(Error::AlreadyExists);
        }
        public_key.refresh(self)?;
        self.register_dependencies(&public_key.name(), &public_key.depends_on())?;
        self.public_keys.insert(public_key.id.clone(), public_key);
        self.scan_for_refresh();
        Ok(())
    }

    pub fn add_csr(&mut self, mut csr: Csr) -> Result<()> {
        if self.csrs.contains_key(&csr.id) {
            return Err(Error::AlreadyExists);
        }
        csr.refresh(self)?;
        self.register_dependencies(&csr.name(), &csr.depends_on())?;
        self.csrs.insert(csr.id.clone(), csr);
        self.scan_for_refresh();
        Ok(())
    }

    pub fn add_certificate(&mut self, mut certificate: Certificate) -> Result<()> {
        if self.certificates.contains_key(&certificate.id) {
            return Err(Error::AlreadyExists);
        }
        certificate.refresh(self)?;
        self.register_dependencies(&certificate.name(), &certificate.depends_on())?;
        self.certificates.insert(certificate.id.clone(), certificate);
        self.scan_for_refresh();
        Ok(())
    }

    pub fn add_ca(&mut self, mut ca: Ca) -> Result<()> {
        if self.cas.contains_key(&ca.id) {
            return Err(Error::AlreadyExists);
        }
        ca.refresh(self)?;
        self.register_dependencies(&ca.name(), &ca.depends_on())?;
        self.cas.insert(ca.id.clone(), ca);
        self.scan_for_refresh();
        Ok(())
    }

    pub fn add_location(&mut self, mut location: Location) -> Result<()> {
        if self.locations.contains_key(&location.id) {
            return Err(Error::AlreadyExists);
        }
        location.refresh(self)?;
        self.register_dependencies(&location.name(), &location.depends_on())?;
        self.locations.insert(location.id.clone(), location);
        self.scan_for_refresh();
        Ok(())
    }

    /// Remove a resource. Refused while anything still depends on it, so no
    /// deletion can leave broken edges behind.
    pub fn remove(&mut self, name: &ResourceName) -> Result<()> {
        if let Some(dependants) = self.dependencies.get(&name.to_string()) {
            if !dependants.is_empty() {
                let list = dependants
                    .iter()
                    .map(|dependant| format!("'{dependant}'"))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(Error::ResourceInUse(list));
            }
        }
        let node = self.take(name)?;
        self.unregister_dependencies(name, &node.depends_on());
        self.dependencies.remove(&name.to_string());
        self.scan_for_refresh();
        Ok(())
    }

    // ========================================================================
    // Update engine
    // ========================================================================

    /// Refresh `name` and, breadth-first, every resource transitively
    /// depending on it. Each node is visited once; the BFS order guarantees
    /// a node's upstreams are refreshed before the node itself.
    pub fn update(&mut self, name: &ResourceName) -> Result<()> {
        self.get(name)?;
        let mut order = vec![name.clone()];
        let mut seen = BTreeSet::from([name.to_string()]);
        let mut frontier: VecDeque<ResourceName> = self
            .dependencies
            .get(&name.to_string())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(dependant) = frontier.pop_front() {
            if !seen.insert(dependant.to_string()) {
                continue;
            }
            if let Some(next) = self.dependencies.get(&dependant.to_string()) {
                frontier.extend(next.iter().cloned());
            }
            order.push(dependant);
        }

        for target in &order {
            info!("refreshing resource '{}' because of '{}'", target, name);
            self.refresh_node(target)?;
        }
        self.scan_for_refresh();
        Ok(())
    }

    /// Refresh a single node in place. The node leaves its table for the
    /// duration of the refresh so it can look up (and, for serial draws,
    /// mutate) the rest of the graph.
    pub fn refresh_node(&mut self, name: &ResourceName) -> Result<()> {
        let mut node = self.take(name)?;
        let result = node.refresh(self);
        self.put_back(node);
        result
    }

    // ========================================================================
    // Refresh queue
    // ========================================================================

    /// Rebuild the queue of scheduled resources, ordered by due time. Run
    /// after every mutation; the scheduler reads the head.
    pub fn scan_for_refresh(&mut self) {
        let mut queue: Vec<RefreshEntry> = Vec::new();
        for public_key in self.public_keys.values() {
            if public_key.interval.is_scheduled() {
                queue.push(RefreshEntry {
                    name: public_key.name(),
                    due: public_key.interval.next_due(),
                });
            }
        }
        for csr in self.csrs.values() {
            if csr.interval.is_scheduled() {
                queue.push(RefreshEntry {
                    name: csr.name(),
                    due: csr.interval.next_due(),
                });
            }
        }
        queue.sort_by_key(|entry| entry.due);
        self.refresh_queue = queue;
    }

    pub fn next_refresh(&self) -> Option<&RefreshEntry> {
        self.refresh_queue.first()
    }

    /// Refresh the head of the queue. Called by the scheduler with the
    /// global lock held; failures are logged, never fatal, and the queue is
    /// rescanned either way.
    pub fn run_due_refresh(&mut self) {
        let Some(entry) = self.refresh_queue.first().cloned() else {
            return;
        };
        if self.get(&entry.name).is_err() {
            info!("resource to refresh has gone away: {}", entry.name);
        } else {
            if let Err(err) = self.refresh_node(&entry.name) {
                warn!("error refreshing resource '{}': {}", entry.name, err);
            }
            if let Err(err) = self.store() {
                warn!("could not update resources: {}", err);
            }
        }
        info!("rescanning for new entries");
        self.scan_for_refresh();
    }
}
