//! The storage server: custodian of file bytes under one local directory.
//!
//! Clients read and write bytes through the `Storage` interface after
//! resolving the server with the naming service; the naming server drives
//! creation, deletion, and replication through the `Command` interface.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::api::{
    Command, CommandDispatcher, CommandStub, Registration, RegistrationStub, Storage,
    StorageDispatcher, StorageStub,
};
use crate::path::WirePath;
use crate::rpc::skeleton::Skeleton;
use crate::{Result, WireFsError, STORAGE_CLIENT_PORT, STORAGE_COMMAND_PORT};

/// Bytes fetched per `read` while copying a file between servers. Bounded
/// far below the i32 limit a single read may carry.
const COPY_CHUNK: i64 = 1 << 20;

struct Skeletons {
    client: Skeleton,
    command: Skeleton,
}

/// A storage server exposing the files under a local root directory.
pub struct StorageServer {
    root: PathBuf,
    client_port: u16,
    command_port: u16,
    /// Data operations run one at a time, like any single custodian of a
    /// set of files.
    ops: tokio::sync::Mutex<()>,
    skeletons: tokio::sync::Mutex<Option<Skeletons>>,
    client_addr: parking_lot::Mutex<Option<SocketAddr>>,
    command_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl StorageServer {
    /// Creates a storage server on the default ports. Not yet started.
    pub fn new(root: PathBuf) -> Self {
        Self::with_ports(root, STORAGE_CLIENT_PORT, STORAGE_COMMAND_PORT)
    }

    /// Creates a storage server with explicit ports (0 = OS-assigned).
    pub fn with_ports(root: PathBuf, client_port: u16, command_port: u16) -> Self {
        Self {
            root,
            client_port,
            command_port,
            ops: tokio::sync::Mutex::new(()),
            skeletons: tokio::sync::Mutex::new(None),
            client_addr: parking_lot::Mutex::new(None),
            command_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Starts both endpoints and registers with the naming server.
    ///
    /// `hostname` is the externally-routable name of this host; it is what
    /// the stubs handed to the naming server will carry. Every duplicate
    /// path the naming server returns is deleted locally, and directories
    /// left empty by those deletions are pruned up to the root.
    pub async fn start(
        self: Arc<Self>,
        hostname: &str,
        naming: &RegistrationStub,
    ) -> Result<()> {
        let meta = fs::metadata(&self.root).await.map_err(|_| {
            WireFsError::NotFound(format!("storage root {} does not exist", self.root.display()))
        })?;
        if !meta.is_dir() {
            return Err(WireFsError::NotFound(format!(
                "storage root {} is not a directory",
                self.root.display()
            )));
        }

        let mut skeletons = self.skeletons.lock().await;
        if skeletons.is_some() {
            return Err(WireFsError::IllegalState(
                "storage server has already been started".into(),
            ));
        }

        let client = Skeleton::new(
            StorageDispatcher(self.clone()),
            SocketAddr::from(([0, 0, 0, 0], self.client_port)),
        )?;
        let command = Skeleton::new(
            CommandDispatcher(self.clone()),
            SocketAddr::from(([0, 0, 0, 0], self.command_port)),
        )?;

        client.start().await?;
        if let Err(e) = command.start().await {
            client.stop().await;
            return Err(e);
        }

        let storage_stub = StorageStub::for_skeleton_at(&client, hostname)?;
        let command_stub = CommandStub::for_skeleton_at(&command, hostname)?;
        let files = WirePath::enumerate_local(&self.root)?;

        let duplicates = match naming.register(storage_stub, command_stub, files).await {
            Ok(duplicates) => duplicates,
            Err(e) => {
                client.stop().await;
                command.stop().await;
                return Err(e);
            }
        };
        for path in &duplicates {
            self.remove_duplicate(path).await;
        }

        *self.client_addr.lock() = client.local_addr();
        *self.command_addr.lock() = command.local_addr();
        info!(
            root = %self.root.display(),
            client = ?client.local_addr(),
            command = ?command.local_addr(),
            pruned = duplicates.len(),
            "storage server registered"
        );
        *skeletons = Some(Skeletons { client, command });
        Ok(())
    }

    /// Stops both endpoints. Idempotent.
    pub async fn stop(&self) {
        let skeletons = self.skeletons.lock().await.take();
        if let Some(skeletons) = skeletons {
            skeletons.client.stop().await;
            skeletons.command.stop().await;
            info!(root = %self.root.display(), "storage server stopped");
        }
    }

    /// The bound client (byte access) address, once started.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        *self.client_addr.lock()
    }

    /// The bound command address, once started.
    pub fn command_addr(&self) -> Option<SocketAddr> {
        *self.command_addr.lock()
    }

    fn local(&self, file: &WirePath) -> PathBuf {
        file.resolve_under(&self.root)
    }

    async fn file_size(&self, file: &WirePath) -> Result<u64> {
        match fs::metadata(self.local(file)).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            _ => Err(WireFsError::NotFound(file.to_string())),
        }
    }

    /// Deletes a file another server already owns, then prunes every
    /// directory the deletion left empty, up to (not including) the root.
    async fn remove_duplicate(&self, path: &WirePath) {
        let local = self.local(path);
        if let Err(e) = fs::remove_file(&local).await {
            warn!(%path, error = %e, "could not remove duplicate file");
            return;
        }
        debug!(%path, "removed duplicate file");

        let mut dir = local.parent().map(|p| p.to_path_buf());
        while let Some(current) = dir {
            if current == self.root {
                break;
            }
            let empty = match fs::read_dir(&current).await {
                Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
                Err(_) => break,
            };
            if !empty || fs::remove_dir(&current).await.is_err() {
                break;
            }
            dir = current.parent().map(|p| p.to_path_buf());
        }
    }
}

#[async_trait]
impl Storage for StorageServer {
    async fn size(&self, file: WirePath) -> Result<i64> {
        let _guard = self.ops.lock().await;
        self.file_size(&file).await.map(|size| size as i64)
    }

    async fn read(&self, file: WirePath, offset: i64, length: i32) -> Result<Vec<u8>> {
        let _guard = self.ops.lock().await;
        let size = self.file_size(&file).await?;
        if offset < 0 || length < 0 || offset as u64 + length as u64 > size {
            return Err(WireFsError::OutOfBounds(format!(
                "read of {length} bytes at offset {offset} in a {size}-byte file"
            )));
        }

        let mut handle = File::open(self.local(&file)).await?;
        handle.seek(SeekFrom::Start(offset as u64)).await?;
        let mut data = vec![0u8; length as usize];
        handle.read_exact(&mut data).await?;
        Ok(data)
    }

    async fn write(&self, file: WirePath, offset: i64, data: Vec<u8>) -> Result<()> {
        let _guard = self.ops.lock().await;
        if offset < 0 {
            return Err(WireFsError::OutOfBounds(format!(
                "write at negative offset {offset}"
            )));
        }
        let size = self.file_size(&file).await?;

        let mut handle = OpenOptions::new()
            .write(true)
            .open(self.local(&file))
            .await?;
        let offset = offset as u64;
        if offset > size {
            // Zero-fill the gap between the old end of file and the offset.
            handle.set_len(offset).await?;
        }
        handle.seek(SeekFrom::Start(offset)).await?;
        handle.write_all(&data).await?;
        handle.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Command for StorageServer {
    async fn create(&self, file: WirePath) -> Result<bool> {
        let _guard = self.ops.lock().await;
        if file.is_root() {
            return Ok(false);
        }
        let local = self.local(&file);
        if let Some(parent) = local.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                warn!(%file, error = %e, "could not create parent directories");
                return Ok(false);
            }
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&local)
            .await
        {
            Ok(_) => {
                debug!(%file, "file created");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => {
                warn!(%file, error = %e, "create failed");
                Ok(false)
            }
        }
    }

    async fn delete(&self, file: WirePath) -> Result<bool> {
        let _guard = self.ops.lock().await;
        if file.is_root() {
            return Ok(false);
        }
        let local = self.local(&file);
        let meta = match fs::metadata(&local).await {
            Ok(meta) => meta,
            Err(_) => return Ok(false),
        };
        let removed = if meta.is_dir() {
            fs::remove_dir_all(&local).await
        } else {
            fs::remove_file(&local).await
        };
        match removed {
            Ok(()) => {
                debug!(%file, "deleted");
                Ok(true)
            }
            Err(e) => {
                warn!(%file, error = %e, "delete failed");
                Ok(false)
            }
        }
    }

    async fn copy(&self, file: WirePath, source: StorageStub) -> Result<bool> {
        let _guard = self.ops.lock().await;
        let total = source.size(file.clone()).await?;

        let local = self.local(&file);
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut handle = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&local)
            .await?;

        let mut offset: i64 = 0;
        while offset < total {
            let chunk = (total - offset).min(COPY_CHUNK) as i32;
            let data = source.read(file.clone(), offset, chunk).await?;
            handle.write_all(&data).await?;
            offset += chunk as i64;
        }
        handle.flush().await?;

        debug!(%file, bytes = total, %source, "file copied from peer");
        Ok(true)
    }
}
