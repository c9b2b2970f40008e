use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;

use super::envelope::{self, CallEnvelope, ResponseEnvelope, TypeTag};
use super::skeleton::Skeleton;
use super::{InterfaceKind, InterfaceSpec};
use crate::{Result, WireFsError};

/// The client-side half of a remote interface: the interface identity plus
/// the network address of the skeleton serving it.
///
/// Equality, hashing, and the textual form are purely local over
/// `(interface, host, port)` — two handles are equal iff they would connect
/// to the same skeleton. Handles are serializable and travel inside
/// envelopes (registration sends storage and command handles to the naming
/// server, which hands storage handles back to clients).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StubHandle {
    interface: InterfaceKind,
    host: String,
    port: u16,
}

impl StubHandle {
    /// Creates a handle from a raw address. Used when bootstrapping: the
    /// server is already running remotely and no skeleton is at hand.
    pub fn from_addr(spec: &InterfaceSpec, host: &str, port: u16) -> Result<Self> {
        spec.ensure_remote()?;
        Ok(Self {
            interface: spec.kind,
            host: host.to_string(),
            port,
        })
    }

    /// Creates a handle from a local skeleton, inheriting its address. The
    /// skeleton must be started or carry a fixed configured port.
    pub fn for_skeleton(spec: &InterfaceSpec, skeleton: &Skeleton) -> Result<Self> {
        Self::check_kind(spec, skeleton)?;
        Self::from_addr(spec, &skeleton.stub_host(), skeleton.stub_port()?)
    }

    /// Creates a handle from a local skeleton with a hostname override, for
    /// deployments where the bind address is not externally routable.
    pub fn for_skeleton_at(
        spec: &InterfaceSpec,
        skeleton: &Skeleton,
        hostname: &str,
    ) -> Result<Self> {
        Self::check_kind(spec, skeleton)?;
        Self::from_addr(spec, hostname, skeleton.stub_port()?)
    }

    fn check_kind(spec: &InterfaceSpec, skeleton: &Skeleton) -> Result<()> {
        if spec.kind != skeleton.interface().kind {
            return Err(WireFsError::InvalidArgument(format!(
                "skeleton serves {}, not {}",
                skeleton.interface().kind,
                spec.kind
            )));
        }
        Ok(())
    }

    pub fn interface(&self) -> InterfaceKind {
        self.interface
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Performs one remote invocation: connect, send the call envelope,
    /// read the response envelope, close.
    ///
    /// A connect or framing failure surfaces as the rpc error; a fault
    /// carried in the response re-raises the error the target method threw.
    pub async fn invoke<A, R>(&self, method: &str, arg_types: &[TypeTag], args: &A) -> Result<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| WireFsError::Rpc(format!("connect to {self} failed: {e}")))?;

        let call = CallEnvelope {
            method: method.to_string(),
            arg_types: arg_types.to_vec(),
            args: postcard::to_allocvec(args)
                .map_err(|e| WireFsError::Rpc(format!("argument encode failed: {e}")))?,
        };
        envelope::write_frame(&mut stream, &call).await?;

        match envelope::read_frame::<_, ResponseEnvelope>(&mut stream).await? {
            Some(ResponseEnvelope::Return(bytes)) => postcard::from_bytes(&bytes)
                .map_err(|e| WireFsError::Rpc(format!("return value decode failed: {e}"))),
            Some(ResponseEnvelope::Fault(error)) => Err(error),
            None => Err(WireFsError::Rpc(format!(
                "{self} closed the connection before responding"
            ))),
        }
    }
}

impl fmt::Display for StubHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.interface, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{COMMAND, STORAGE};
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(handle: &StubHandle) -> u64 {
        let mut hasher = DefaultHasher::new();
        handle.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_equality_is_local_over_interface_and_address() {
        let a = StubHandle::from_addr(&STORAGE, "host", 7225).unwrap();
        let b = StubHandle::from_addr(&STORAGE, "host", 7225).unwrap();
        let other_port = StubHandle::from_addr(&STORAGE, "host", 7226).unwrap();
        let other_host = StubHandle::from_addr(&STORAGE, "elsewhere", 7225).unwrap();
        let other_interface = StubHandle::from_addr(&COMMAND, "host", 7225).unwrap();

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, other_port);
        assert_ne!(a, other_host);
        assert_ne!(a, other_interface);
    }

    #[test]
    fn test_display_concatenates_interface_and_address() {
        let handle = StubHandle::from_addr(&STORAGE, "node1", 7225).unwrap();
        assert_eq!(handle.to_string(), "Storage@node1:7225");
    }

    #[test]
    fn test_handle_round_trips_through_postcard() {
        let handle = StubHandle::from_addr(&COMMAND, "node2", 9325).unwrap();
        let bytes = postcard::to_allocvec(&handle).unwrap();
        let back: StubHandle = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(handle, back);
    }
}
