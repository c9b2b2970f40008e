//! The naming server: metadata authority of the filesystem.
//!
//! Clients resolve paths, create and delete entries, and take path-chain
//! locks through the `Service` interface; storage servers announce their
//! files through the `Registration` interface. The server never touches
//! file bytes — it maps each file to the storage servers hosting it and
//! steers the replica set from lock release traffic.

pub mod tree;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::{
    Command, CommandStub, Registration, RegistrationDispatcher, Service, ServiceDispatcher,
    StorageStub,
};
use crate::path::WirePath;
use crate::rpc::skeleton::Skeleton;
use crate::{Result, WireFsError, REGISTRATION_PORT, SERVICE_PORT};
use self::tree::{Acquired, Namespace, ReplicaCandidate};

struct Skeletons {
    service: Skeleton,
    registration: Skeleton,
}

/// The naming server. One instance per filesystem deployment.
///
/// The directory tree and per-node lock state live behind one mutex; lock
/// *waits* happen outside it, so a blocked acquirer never stalls metadata
/// operations. The replica registries are concurrent maps keyed by the stub
/// handles themselves.
pub struct NamingServer {
    namespace: Mutex<Namespace>,
    /// file path -> servers hosting it, in insertion order. Only file
    /// leaves appear as keys, and a present entry is never empty.
    replicas: DashMap<WirePath, Vec<StorageStub>>,
    /// storage handle -> command endpoint, paired at registration.
    commands: DashMap<StorageStub, CommandStub>,
    service_port: u16,
    registration_port: u16,
    skeletons: tokio::sync::Mutex<Option<Skeletons>>,
    service_addr: Mutex<Option<SocketAddr>>,
    registration_addr: Mutex<Option<SocketAddr>>,
}

impl NamingServer {
    /// Creates a naming server on the well-known ports. Not yet started.
    pub fn new() -> Self {
        Self::with_ports(SERVICE_PORT, REGISTRATION_PORT)
    }

    /// Creates a naming server with explicit ports (0 = OS-assigned).
    pub fn with_ports(service_port: u16, registration_port: u16) -> Self {
        Self {
            namespace: Mutex::new(Namespace::new()),
            replicas: DashMap::new(),
            commands: DashMap::new(),
            service_port,
            registration_port,
            skeletons: tokio::sync::Mutex::new(None),
            service_addr: Mutex::new(None),
            registration_addr: Mutex::new(None),
        }
    }

    /// Starts the service and registration endpoints. After this returns,
    /// both interfaces are reachable remotely.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let mut skeletons = self.skeletons.lock().await;
        if skeletons.is_some() {
            return Err(WireFsError::IllegalState(
                "naming server has already been started".into(),
            ));
        }

        let service = Skeleton::new(
            ServiceDispatcher(self.clone()),
            SocketAddr::from(([0, 0, 0, 0], self.service_port)),
        )?;
        let registration = Skeleton::new(
            RegistrationDispatcher(self.clone()),
            SocketAddr::from(([0, 0, 0, 0], self.registration_port)),
        )?;

        service.start().await?;
        if let Err(e) = registration.start().await {
            service.stop().await;
            return Err(e);
        }

        *self.service_addr.lock() = service.local_addr();
        *self.registration_addr.lock() = registration.local_addr();
        info!(
            service = ?service.local_addr(),
            registration = ?registration.local_addr(),
            "naming server started"
        );
        *skeletons = Some(Skeletons {
            service,
            registration,
        });
        Ok(())
    }

    /// Stops both endpoints. Idempotent. In-flight calls run to completion.
    pub async fn stop(&self) {
        let skeletons = self.skeletons.lock().await.take();
        if let Some(skeletons) = skeletons {
            skeletons.service.stop().await;
            skeletons.registration.stop().await;
            info!("naming server stopped");
        }
    }

    /// The bound service address, once started.
    pub fn service_addr(&self) -> Option<SocketAddr> {
        *self.service_addr.lock()
    }

    /// The bound registration address, once started.
    pub fn registration_addr(&self) -> Option<SocketAddr> {
        *self.registration_addr.lock()
    }

    /// The storage servers currently hosting `path`, in insertion order.
    pub fn replicas_of(&self, path: &WirePath) -> Vec<StorageStub> {
        self.replicas
            .get(path)
            .map(|holders| holders.clone())
            .unwrap_or_default()
    }

    fn any_server(&self) -> Option<(StorageStub, CommandStub)> {
        self.commands
            .iter()
            .next()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    /// Copies `path` to one storage server that does not yet host it. On
    /// any failure the replica set is left unchanged.
    async fn replicate(&self, path: &WirePath) {
        let Some((source, target, target_command)) = self.pick_replication_pair(path) else {
            debug!(%path, "no eligible replication target");
            return;
        };

        match target_command.copy(path.clone(), source).await {
            Ok(true) => {
                if let Some(mut holders) = self.replicas.get_mut(path) {
                    if !holders.contains(&target) {
                        holders.push(target.clone());
                    }
                }
                info!(%path, server = %target, "file replicated");
            }
            Ok(false) => warn!(%path, server = %target, "replication refused"),
            Err(e) => warn!(%path, server = %target, error = %e, "replication failed"),
        }
    }

    fn pick_replication_pair(
        &self,
        path: &WirePath,
    ) -> Option<(StorageStub, StorageStub, CommandStub)> {
        let holders = self.replicas.get(path)?;
        let source = holders.first()?.clone();
        let target = self
            .commands
            .iter()
            .find(|entry| !holders.contains(entry.key()))?;
        Some((source, target.key().clone(), target.value().clone()))
    }

    /// Shrinks the replica set of `path` to a single copy, deleting the
    /// file from every other holder. Remote errors are ignored; the set
    /// shrinks regardless.
    async fn collapse(&self, path: &WirePath) {
        let (keep, extras) = {
            let Some(holders) = self.replicas.get(path) else {
                return;
            };
            let Some(keep) = holders.first().cloned() else {
                return;
            };
            let extras: Vec<StorageStub> = holders.iter().skip(1).cloned().collect();
            (keep, extras)
        };
        if extras.is_empty() {
            return;
        }

        for server in &extras {
            let command = self.commands.get(server).map(|c| c.clone());
            if let Some(command) = command {
                if let Err(e) = command.delete(path.clone()).await {
                    debug!(%path, server = %server, error = %e, "replica delete failed");
                }
            }
        }
        self.replicas.insert(path.clone(), vec![keep.clone()]);
        info!(%path, kept = %keep, "replicas collapsed");
    }
}

impl Default for NamingServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Service for NamingServer {
    async fn is_directory(&self, path: WirePath) -> Result<bool> {
        let namespace = self.namespace.lock();
        Ok(namespace.lookup(&path)?.is_directory())
    }

    async fn list(&self, directory: WirePath) -> Result<Vec<String>> {
        let namespace = self.namespace.lock();
        let node = namespace.lookup(&directory)?;
        if !node.is_directory() {
            return Err(WireFsError::NotFound(format!(
                "{directory} is not a directory"
            )));
        }
        let mut names: Vec<String> = node.children().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_file(&self, path: WirePath) -> Result<bool> {
        if path.is_root() {
            return Ok(false);
        }
        let parent = path.parent()?;
        let name = path.last()?.to_string();

        let created = self.namespace.lock().create_child(&parent, &name, false)?;
        if !created {
            return Ok(false);
        }

        let Some((storage, command)) = self.any_server() else {
            let _ = self.namespace.lock().remove(&path);
            return Err(WireFsError::IllegalState(
                "no storage server is registered".into(),
            ));
        };

        match command.create(path.clone()).await {
            Ok(true) => {
                self.replicas.insert(path.clone(), vec![storage]);
                debug!(%path, "file created");
                Ok(true)
            }
            Ok(false) => {
                warn!(%path, server = %storage, "storage server refused create");
                let _ = self.namespace.lock().remove(&path);
                Ok(false)
            }
            Err(e) => {
                warn!(%path, server = %storage, error = %e, "storage create failed");
                let _ = self.namespace.lock().remove(&path);
                Ok(false)
            }
        }
    }

    async fn create_directory(&self, path: WirePath) -> Result<bool> {
        if path.is_root() {
            return Ok(false);
        }
        let created = self
            .namespace
            .lock()
            .create_child(&path.parent()?, path.last()?, true)?;
        Ok(created)
    }

    async fn delete(&self, path: WirePath) -> Result<bool> {
        if path.is_root() {
            return Ok(false);
        }

        // Remove the subtree and clear the replica entries of every
        // descendant file, collecting which servers held any of them.
        let affected: Vec<(StorageStub, CommandStub)> = {
            let mut namespace = self.namespace.lock();
            let node = namespace.lookup(&path)?;
            let leaves = if node.is_directory() {
                namespace.enumerate(&path)?
            } else {
                vec![path.clone()]
            };
            namespace.remove(&path)?;

            let mut holders: Vec<StorageStub> = Vec::new();
            for leaf in &leaves {
                if let Some((_, servers)) = self.replicas.remove(leaf) {
                    for server in servers {
                        if !holders.contains(&server) {
                            holders.push(server);
                        }
                    }
                }
            }
            holders
                .into_iter()
                .filter_map(|server| {
                    let command = self.commands.get(&server).map(|c| c.clone());
                    command.map(|c| (server, c))
                })
                .collect()
        };

        let mut all_succeeded = true;
        for (server, command) in affected {
            match command.delete(path.clone()).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(%path, %server, "storage server refused delete");
                    all_succeeded = false;
                }
                Err(e) => {
                    warn!(%path, %server, error = %e, "remote delete failed");
                    all_succeeded = false;
                }
            }
        }
        Ok(all_succeeded)
    }

    async fn get_storage(&self, path: WirePath) -> Result<StorageStub> {
        self.replicas
            .get(&path)
            .and_then(|holders| holders.first().cloned())
            .ok_or_else(|| WireFsError::NotFound(format!("no storage server hosts {path}")))
    }

    async fn lock(&self, path: WirePath, exclusive: bool) -> Result<()> {
        let decisions = self.namespace.lock().acquire_chain(&path, exclusive)?;
        for decision in decisions {
            if let Acquired::Pending(token) = decision {
                token.await.map_err(|_| {
                    WireFsError::IllegalState(format!("lock on {path} was abandoned"))
                })?;
            }
        }
        Ok(())
    }

    async fn unlock(&self, path: WirePath, exclusive: bool) -> Result<()> {
        let candidate = self.namespace.lock().release_chain(&path, exclusive)?;
        match candidate {
            Some(ReplicaCandidate::Replicate) => self.replicate(&path).await,
            Some(ReplicaCandidate::Collapse) => self.collapse(&path).await,
            None => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Registration for NamingServer {
    async fn register(
        &self,
        storage: StorageStub,
        command: CommandStub,
        files: Vec<WirePath>,
    ) -> Result<Vec<WirePath>> {
        // The whole registration runs inside the namespace critical
        // section, so concurrent registrations serialize.
        let mut guard = self.namespace.lock();
        let namespace = &mut *guard;

        if self.commands.contains_key(&storage) {
            return Err(WireFsError::IllegalState(format!(
                "{storage} is already registered"
            )));
        }

        let mut duplicates = Vec::new();
        for file in files {
            if file.is_root() {
                continue;
            }
            if namespace.add_file(&file) {
                self.replicas.insert(file, vec![storage.clone()]);
            } else {
                duplicates.push(file);
            }
        }
        self.commands.insert(storage.clone(), command);

        info!(server = %storage, duplicates = duplicates.len(), "storage server registered");
        Ok(duplicates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{RegistrationStub, ServiceStub, Storage as _};
    use crate::storage::StorageServer;
    use std::time::Duration;
    use tokio::time::timeout;
    use super::tree::REPLICATION_THRESHOLD;

    fn p(s: &str) -> WirePath {
        s.parse().unwrap()
    }

    struct Cluster {
        naming: Arc<NamingServer>,
        service: ServiceStub,
        registration: RegistrationStub,
    }

    async fn start_naming() -> Cluster {
        let naming = Arc::new(NamingServer::with_ports(0, 0));
        naming.clone().start().await.unwrap();
        let service =
            ServiceStub::from_addr("127.0.0.1", naming.service_addr().unwrap().port()).unwrap();
        let registration =
            RegistrationStub::from_addr("127.0.0.1", naming.registration_addr().unwrap().port())
                .unwrap();
        Cluster {
            naming,
            service,
            registration,
        }
    }

    /// Seeds a directory with files, starts a storage server over it, and
    /// registers it with the cluster's naming server.
    async fn start_storage(
        cluster: &Cluster,
        files: &[(&str, &[u8])],
    ) -> (Arc<StorageServer>, tempfile::TempDir, StorageStub) {
        let dir = tempfile::tempdir().unwrap();
        for (path, contents) in files {
            let local = p(path).resolve_under(dir.path());
            std::fs::create_dir_all(local.parent().unwrap()).unwrap();
            std::fs::write(local, contents).unwrap();
        }
        let server = Arc::new(StorageServer::with_ports(dir.path().to_path_buf(), 0, 0));
        server
            .clone()
            .start("127.0.0.1", &cluster.registration)
            .await
            .unwrap();
        let stub =
            StorageStub::from_addr("127.0.0.1", server.client_addr().unwrap().port()).unwrap();
        (server, dir, stub)
    }

    #[tokio::test]
    async fn test_registration_and_metadata_queries() {
        let cluster = start_naming().await;
        let (s1, _d1, s1_stub) =
            start_storage(&cluster, &[("/a", b"alpha"), ("/b/c", b"gamma")]).await;

        assert_eq!(
            cluster.service.list(WirePath::root()).await.unwrap(),
            vec!["a", "b"]
        );
        assert!(cluster.service.is_directory(WirePath::root()).await.unwrap());
        assert!(cluster.service.is_directory(p("/b")).await.unwrap());
        assert!(!cluster.service.is_directory(p("/a")).await.unwrap());
        assert_eq!(cluster.service.list(p("/b")).await.unwrap(), vec!["c"]);

        assert_eq!(cluster.service.get_storage(p("/a")).await.unwrap(), s1_stub);

        // Directories have no storage server; unknown paths fail everywhere.
        assert!(matches!(
            cluster.service.get_storage(p("/b")).await,
            Err(WireFsError::NotFound(_))
        ));
        assert!(matches!(
            cluster.service.is_directory(p("/nope")).await,
            Err(WireFsError::NotFound(_))
        ));
        assert!(matches!(
            cluster.service.list(p("/a")).await,
            Err(WireFsError::NotFound(_))
        ));

        s1.stop().await;
        cluster.naming.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_pruning_replication_and_collapse() {
        let cluster = start_naming().await;
        let (s1, d1, s1_stub) =
            start_storage(&cluster, &[("/a", b"alpha"), ("/b/c", b"gamma")]).await;
        // The second server offers /a, which the first already owns: it is
        // told to remove its local copy.
        let (s2, d2, s2_stub) =
            start_storage(&cluster, &[("/a", b"stale"), ("/d", b"delta")]).await;

        assert!(!d2.path().join("a").exists());
        assert!(d2.path().join("d").is_file());
        assert_eq!(cluster.service.get_storage(p("/d")).await.unwrap(), s2_stub);
        assert_eq!(cluster.naming.replicas_of(&p("/a")), vec![s1_stub.clone()]);

        // Twenty shared acquire/release rounds trigger a copy onto the
        // server that does not yet hold the file.
        for _ in 0..REPLICATION_THRESHOLD {
            cluster.service.lock(p("/a"), false).await.unwrap();
            cluster.service.unlock(p("/a"), false).await.unwrap();
        }
        assert_eq!(
            cluster.naming.replicas_of(&p("/a")),
            vec![s1_stub.clone(), s2_stub.clone()]
        );
        assert_eq!(std::fs::read(d2.path().join("a")).unwrap(), b"alpha");

        // Exclusive access collapses the set back to a single copy.
        cluster.service.lock(p("/a"), true).await.unwrap();
        let storage = cluster.service.get_storage(p("/a")).await.unwrap();
        storage.write(p("/a"), 0, b"hi".to_vec()).await.unwrap();
        cluster.service.unlock(p("/a"), true).await.unwrap();

        assert_eq!(cluster.naming.replicas_of(&p("/a")), vec![s1_stub.clone()]);
        assert!(!d2.path().join("a").exists());
        assert_eq!(std::fs::read(d1.path().join("a")).unwrap(), b"hipha");

        s1.stop().await;
        s2.stop().await;
        cluster.naming.stop().await;
    }

    #[tokio::test]
    async fn test_reregistration_is_illegal() {
        let cluster = start_naming().await;
        let (s1, _d1, s1_stub) = start_storage(&cluster, &[("/a", b"x")]).await;

        let command_stub =
            CommandStub::from_addr("127.0.0.1", s1.command_addr().unwrap().port()).unwrap();
        let err = cluster
            .registration
            .register(s1_stub, command_stub, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WireFsError::IllegalState(_)));

        s1.stop().await;
        cluster.naming.stop().await;
    }

    #[tokio::test]
    async fn test_exclusive_lock_blocks_shared_over_rpc() {
        let cluster = start_naming().await;
        let (s1, _d1, _stub) = start_storage(&cluster, &[("/b/c", b"x")]).await;

        cluster.service.lock(p("/b/c"), true).await.unwrap();

        let service = cluster.service.clone();
        let waiter = tokio::spawn(async move { service.lock(p("/b/c"), false).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished(), "shared lock must wait for the writer");

        cluster.service.unlock(p("/b/c"), true).await.unwrap();
        timeout(Duration::from_secs(5), waiter)
            .await
            .expect("shared lock still blocked after writer release")
            .unwrap()
            .unwrap();
        cluster.service.unlock(p("/b/c"), false).await.unwrap();

        s1.stop().await;
        cluster.naming.stop().await;
    }

    #[tokio::test]
    async fn test_lock_failures() {
        let cluster = start_naming().await;
        let (s1, _d1, _stub) = start_storage(&cluster, &[("/a", b"x")]).await;

        assert!(matches!(
            cluster.service.lock(p("/ghost"), false).await,
            Err(WireFsError::NotFound(_))
        ));
        assert!(matches!(
            cluster.service.unlock(p("/ghost"), false).await,
            Err(WireFsError::InvalidArgument(_))
        ));

        // The root itself locks and unlocks without deadlock.
        cluster.service.lock(WirePath::root(), false).await.unwrap();
        cluster.service.unlock(WirePath::root(), false).await.unwrap();

        s1.stop().await;
        cluster.naming.stop().await;
    }

    #[tokio::test]
    async fn test_create_and_delete_lifecycle() {
        let cluster = start_naming().await;
        let (s1, d1, _stub) = start_storage(&cluster, &[]).await;

        // Creating under a missing parent fails before anything mutates.
        assert!(matches!(
            cluster.service.create_file(p("/e/f")).await,
            Err(WireFsError::NotFound(_))
        ));

        assert!(cluster.service.create_directory(p("/e")).await.unwrap());
        assert!(cluster.service.create_file(p("/e/f")).await.unwrap());

        let storage = cluster.service.get_storage(p("/e/f")).await.unwrap();
        assert_eq!(storage.size(p("/e/f")).await.unwrap(), 0);
        assert!(d1.path().join("e/f").is_file());

        // Duplicates and the root all report false.
        assert!(!cluster.service.create_file(p("/e/f")).await.unwrap());
        assert!(!cluster.service.create_directory(p("/e")).await.unwrap());
        assert!(!cluster.service.create_file(WirePath::root()).await.unwrap());
        assert!(!cluster
            .service
            .create_directory(WirePath::root())
            .await
            .unwrap());

        // Deleting the directory removes the subtree everywhere.
        assert!(cluster.service.delete(p("/e")).await.unwrap());
        assert!(matches!(
            cluster.service.is_directory(p("/e")).await,
            Err(WireFsError::NotFound(_))
        ));
        assert!(!d1.path().join("e").exists());
        assert!(matches!(
            cluster.service.get_storage(p("/e/f")).await,
            Err(WireFsError::NotFound(_))
        ));
        assert!(matches!(
            cluster.service.delete(p("/e")).await,
            Err(WireFsError::NotFound(_))
        ));

        s1.stop().await;
        cluster.naming.stop().await;
    }

    #[tokio::test]
    async fn test_create_file_without_storage_servers() {
        let cluster = start_naming().await;

        let err = cluster.service.create_file(p("/x")).await.unwrap_err();
        assert!(matches!(err, WireFsError::IllegalState(_)));
        // The failed create left no trace in the tree.
        assert!(matches!(
            cluster.service.is_directory(p("/x")).await,
            Err(WireFsError::NotFound(_))
        ));

        // Directories need no storage server at all.
        assert!(cluster.service.create_directory(p("/dirs")).await.unwrap());

        cluster.naming.stop().await;
    }
}
