//! The four remote interfaces of the filesystem, with their client-side
//! stubs and server-side dispatchers.
//!
//! Each interface is a trait implemented twice: by the server object that
//! owns the real state, and by a typed stub that forwards every call over
//! the wire. A dispatcher adapts the server object to a skeleton, resolving
//! each call envelope by method name and argument type tags.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::path::WirePath;
use crate::rpc::envelope::{CallEnvelope, ResponseEnvelope, TypeTag};
use crate::rpc::skeleton::{Dispatcher, Skeleton};
use crate::rpc::stub::StubHandle;
use crate::rpc::{InterfaceSpec, COMMAND, REGISTRATION, SERVICE, STORAGE};
use crate::{Result, WireFsError};

/// Naming server: metadata operations clients invoke.
#[async_trait]
pub trait Service: Send + Sync {
    async fn is_directory(&self, path: WirePath) -> Result<bool>;

    async fn list(&self, directory: WirePath) -> Result<Vec<String>>;

    async fn create_file(&self, path: WirePath) -> Result<bool>;

    async fn create_directory(&self, path: WirePath) -> Result<bool>;

    async fn delete(&self, path: WirePath) -> Result<bool>;

    async fn get_storage(&self, path: WirePath) -> Result<StorageStub>;

    async fn lock(&self, path: WirePath, exclusive: bool) -> Result<()>;

    async fn unlock(&self, path: WirePath, exclusive: bool) -> Result<()>;
}

/// Naming server: the interface storage servers register through.
#[async_trait]
pub trait Registration: Send + Sync {
    /// Announces a storage server and the files it hosts. Returns the paths
    /// the server must delete locally because another server already owns
    /// them.
    async fn register(
        &self,
        storage: StorageStub,
        command: CommandStub,
        files: Vec<WirePath>,
    ) -> Result<Vec<WirePath>>;
}

/// Storage server: byte access clients invoke directly.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn size(&self, file: WirePath) -> Result<i64>;

    async fn read(&self, file: WirePath, offset: i64, length: i32) -> Result<Vec<u8>>;

    async fn write(&self, file: WirePath, offset: i64, data: Vec<u8>) -> Result<()>;
}

/// Storage server: commands only the naming server issues.
#[async_trait]
pub trait Command: Send + Sync {
    async fn create(&self, file: WirePath) -> Result<bool>;

    async fn delete(&self, file: WirePath) -> Result<bool>;

    /// Copies `file` from another storage server onto this one.
    async fn copy(&self, file: WirePath, source: StorageStub) -> Result<bool>;
}

macro_rules! typed_stub {
    ($(#[$doc:meta])* $name:ident, $spec:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(StubHandle);

        impl $name {
            pub fn from_addr(host: &str, port: u16) -> Result<Self> {
                StubHandle::from_addr(&$spec, host, port).map(Self)
            }

            pub fn for_skeleton(skeleton: &Skeleton) -> Result<Self> {
                StubHandle::for_skeleton(&$spec, skeleton).map(Self)
            }

            pub fn for_skeleton_at(skeleton: &Skeleton, hostname: &str) -> Result<Self> {
                StubHandle::for_skeleton_at(&$spec, skeleton, hostname).map(Self)
            }

            pub fn handle(&self) -> &StubHandle {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

typed_stub!(
    /// Client-side proxy for the naming server's `Service` interface.
    ServiceStub,
    SERVICE
);
typed_stub!(
    /// Client-side proxy for the naming server's `Registration` interface.
    RegistrationStub,
    REGISTRATION
);
typed_stub!(
    /// Client-side proxy for a storage server's `Storage` interface.
    StorageStub,
    STORAGE
);
typed_stub!(
    /// Client-side proxy for a storage server's `Command` interface.
    CommandStub,
    COMMAND
);

#[async_trait]
impl Service for ServiceStub {
    async fn is_directory(&self, path: WirePath) -> Result<bool> {
        self.0
            .invoke("is_directory", &[TypeTag::Path], &(path,))
            .await
    }

    async fn list(&self, directory: WirePath) -> Result<Vec<String>> {
        self.0.invoke("list", &[TypeTag::Path], &(directory,)).await
    }

    async fn create_file(&self, path: WirePath) -> Result<bool> {
        self.0.invoke("create_file", &[TypeTag::Path], &(path,)).await
    }

    async fn create_directory(&self, path: WirePath) -> Result<bool> {
        self.0
            .invoke("create_directory", &[TypeTag::Path], &(path,))
            .await
    }

    async fn delete(&self, path: WirePath) -> Result<bool> {
        self.0.invoke("delete", &[TypeTag::Path], &(path,)).await
    }

    async fn get_storage(&self, path: WirePath) -> Result<StorageStub> {
        self.0.invoke("get_storage", &[TypeTag::Path], &(path,)).await
    }

    async fn lock(&self, path: WirePath, exclusive: bool) -> Result<()> {
        self.0
            .invoke("lock", &[TypeTag::Path, TypeTag::Bool], &(path, exclusive))
            .await
    }

    async fn unlock(&self, path: WirePath, exclusive: bool) -> Result<()> {
        self.0
            .invoke("unlock", &[TypeTag::Path, TypeTag::Bool], &(path, exclusive))
            .await
    }
}

#[async_trait]
impl Registration for RegistrationStub {
    async fn register(
        &self,
        storage: StorageStub,
        command: CommandStub,
        files: Vec<WirePath>,
    ) -> Result<Vec<WirePath>> {
        self.0
            .invoke(
                "register",
                &[TypeTag::StorageRef, TypeTag::CommandRef, TypeTag::PathArray],
                &(storage, command, files),
            )
            .await
    }
}

#[async_trait]
impl Storage for StorageStub {
    async fn size(&self, file: WirePath) -> Result<i64> {
        self.0.invoke("size", &[TypeTag::Path], &(file,)).await
    }

    async fn read(&self, file: WirePath, offset: i64, length: i32) -> Result<Vec<u8>> {
        self.0
            .invoke(
                "read",
                &[TypeTag::Path, TypeTag::I64, TypeTag::I32],
                &(file, offset, length),
            )
            .await
    }

    async fn write(&self, file: WirePath, offset: i64, data: Vec<u8>) -> Result<()> {
        self.0
            .invoke(
                "write",
                &[TypeTag::Path, TypeTag::I64, TypeTag::Bytes],
                &(file, offset, data),
            )
            .await
    }
}

#[async_trait]
impl Command for CommandStub {
    async fn create(&self, file: WirePath) -> Result<bool> {
        self.0.invoke("create", &[TypeTag::Path], &(file,)).await
    }

    async fn delete(&self, file: WirePath) -> Result<bool> {
        self.0.invoke("delete", &[TypeTag::Path], &(file,)).await
    }

    async fn copy(&self, file: WirePath, source: StorageStub) -> Result<bool> {
        self.0
            .invoke(
                "copy",
                &[TypeTag::Path, TypeTag::StorageRef],
                &(file, source),
            )
            .await
    }
}

fn decode<A: DeserializeOwned>(bytes: &[u8]) -> Result<A> {
    postcard::from_bytes(bytes)
        .map_err(|e| WireFsError::Rpc(format!("argument decode failed: {e}")))
}

fn respond<T: Serialize>(result: Result<T>) -> ResponseEnvelope {
    match result {
        Ok(value) => match postcard::to_allocvec(&value) {
            Ok(bytes) => ResponseEnvelope::Return(bytes),
            Err(e) => {
                ResponseEnvelope::Fault(WireFsError::Rpc(format!("return encode failed: {e}")))
            }
        },
        Err(error) => ResponseEnvelope::Fault(error),
    }
}

fn unknown(call: &CallEnvelope) -> ResponseEnvelope {
    ResponseEnvelope::Fault(WireFsError::Rpc(format!(
        "no method {}({:?})",
        call.method, call.arg_types
    )))
}

/// Adapts a `Service` implementation to a skeleton.
pub struct ServiceDispatcher<T>(pub Arc<T>);

#[async_trait]
impl<T: Service + 'static> Dispatcher for ServiceDispatcher<T> {
    fn interface(&self) -> &'static InterfaceSpec {
        &SERVICE
    }

    async fn dispatch(&self, call: CallEnvelope) -> ResponseEnvelope {
        match (call.method.as_str(), call.arg_types.as_slice()) {
            ("is_directory", [TypeTag::Path]) => match decode::<(WirePath,)>(&call.args) {
                Ok((path,)) => respond(self.0.is_directory(path).await),
                Err(e) => ResponseEnvelope::Fault(e),
            },
            ("list", [TypeTag::Path]) => match decode::<(WirePath,)>(&call.args) {
                Ok((path,)) => respond(self.0.list(path).await),
                Err(e) => ResponseEnvelope::Fault(e),
            },
            ("create_file", [TypeTag::Path]) => match decode::<(WirePath,)>(&call.args) {
                Ok((path,)) => respond(self.0.create_file(path).await),
                Err(e) => ResponseEnvelope::Fault(e),
            },
            ("create_directory", [TypeTag::Path]) => match decode::<(WirePath,)>(&call.args) {
                Ok((path,)) => respond(self.0.create_directory(path).await),
                Err(e) => ResponseEnvelope::Fault(e),
            },
            ("delete", [TypeTag::Path]) => match decode::<(WirePath,)>(&call.args) {
                Ok((path,)) => respond(self.0.delete(path).await),
                Err(e) => ResponseEnvelope::Fault(e),
            },
            ("get_storage", [TypeTag::Path]) => match decode::<(WirePath,)>(&call.args) {
                Ok((path,)) => respond(self.0.get_storage(path).await),
                Err(e) => ResponseEnvelope::Fault(e),
            },
            ("lock", [TypeTag::Path, TypeTag::Bool]) => {
                match decode::<(WirePath, bool)>(&call.args) {
                    Ok((path, exclusive)) => respond(self.0.lock(path, exclusive).await),
                    Err(e) => ResponseEnvelope::Fault(e),
                }
            }
            ("unlock", [TypeTag::Path, TypeTag::Bool]) => {
                match decode::<(WirePath, bool)>(&call.args) {
                    Ok((path, exclusive)) => respond(self.0.unlock(path, exclusive).await),
                    Err(e) => ResponseEnvelope::Fault(e),
                }
            }
            _ => unknown(&call),
        }
    }
}

/// Adapts a `Registration` implementation to a skeleton.
pub struct RegistrationDispatcher<T>(pub Arc<T>);

#[async_trait]
impl<T: Registration + 'static> Dispatcher for RegistrationDispatcher<T> {
    fn interface(&self) -> &'static InterfaceSpec {
        &REGISTRATION
    }

    async fn dispatch(&self, call: CallEnvelope) -> ResponseEnvelope {
        match (call.method.as_str(), call.arg_types.as_slice()) {
            ("register", [TypeTag::StorageRef, TypeTag::CommandRef, TypeTag::PathArray]) => {
                match decode::<(StorageStub, CommandStub, Vec<WirePath>)>(&call.args) {
                    Ok((storage, command, files)) => {
                        respond(self.0.register(storage, command, files).await)
                    }
                    Err(e) => ResponseEnvelope::Fault(e),
                }
            }
            _ => unknown(&call),
        }
    }
}

/// Adapts a `Storage` implementation to a skeleton.
pub struct StorageDispatcher<T>(pub Arc<T>);

#[async_trait]
impl<T: Storage + 'static> Dispatcher for StorageDispatcher<T> {
    fn interface(&self) -> &'static InterfaceSpec {
        &STORAGE
    }

    async fn dispatch(&self, call: CallEnvelope) -> ResponseEnvelope {
        match (call.method.as_str(), call.arg_types.as_slice()) {
            ("size", [TypeTag::Path]) => match decode::<(WirePath,)>(&call.args) {
                Ok((file,)) => respond(self.0.size(file).await),
                Err(e) => ResponseEnvelope::Fault(e),
            },
            ("read", [TypeTag::Path, TypeTag::I64, TypeTag::I32]) => {
                match decode::<(WirePath, i64, i32)>(&call.args) {
                    Ok((file, offset, length)) => respond(self.0.read(file, offset, length).await),
                    Err(e) => ResponseEnvelope::Fault(e),
                }
            }
            ("write", [TypeTag::Path, TypeTag::I64, TypeTag::Bytes]) => {
                match decode::<(WirePath, i64, Vec<u8>)>(&call.args) {
                    Ok((file, offset, data)) => respond(self.0.write(file, offset, data).await),
                    Err(e) => ResponseEnvelope::Fault(e),
                }
            }
            _ => unknown(&call),
        }
    }
}

/// Adapts a `Command` implementation to a skeleton.
pub struct CommandDispatcher<T>(pub Arc<T>);

#[async_trait]
impl<T: Command + 'static> Dispatcher for CommandDispatcher<T> {
    fn interface(&self) -> &'static InterfaceSpec {
        &COMMAND
    }

    async fn dispatch(&self, call: CallEnvelope) -> ResponseEnvelope {
        match (call.method.as_str(), call.arg_types.as_slice()) {
            ("create", [TypeTag::Path]) => match decode::<(WirePath,)>(&call.args) {
                Ok((file,)) => respond(self.0.create(file).await),
                Err(e) => ResponseEnvelope::Fault(e),
            },
            ("delete", [TypeTag::Path]) => match decode::<(WirePath,)>(&call.args) {
                Ok((file,)) => respond(self.0.delete(file).await),
                Err(e) => ResponseEnvelope::Fault(e),
            },
            ("copy", [TypeTag::Path, TypeTag::StorageRef]) => {
                match decode::<(WirePath, StorageStub)>(&call.args) {
                    Ok((file, source)) => respond(self.0.copy(file, source).await),
                    Err(e) => ResponseEnvelope::Fault(e),
                }
            }
            _ => unknown(&call),
        }
    }
}
