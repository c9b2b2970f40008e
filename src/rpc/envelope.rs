use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Result, WireFsError};

/// Portable names of remote-method parameter types.
///
/// A call envelope carries the tag list alongside the method name so the
/// server can resolve overloads without any schema agreement beyond the
/// interface definition itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    Path,
    Bool,
    I32,
    I64,
    Bytes,
    Str,
    PathArray,
    StorageRef,
    CommandRef,
}

/// One remote method invocation: the method name, the argument type tags,
/// and the postcard-encoded argument tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub method: String,
    pub arg_types: Vec<TypeTag>,
    pub args: Vec<u8>,
}

/// The reply to a call: either the postcard-encoded return value, or the
/// error the target method raised, shipped whole so the caller re-raises it
/// with its kind intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseEnvelope {
    Return(Vec<u8>),
    Fault(WireFsError),
}

/// Maximum frame size (16 MiB) to prevent unbounded allocations.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Write a length-prefixed, postcard-serialized record to a stream.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = postcard::to_allocvec(value)
        .map_err(|e| WireFsError::Rpc(format!("frame encode failed: {e}")))?;
    let len = bytes.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(WireFsError::Rpc(format!("frame too large: {len} bytes")));
    }
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| WireFsError::Rpc(format!("frame write failed: {e}")))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| WireFsError::Rpc(format!("frame write failed: {e}")))?;
    Ok(())
}

/// Read a length-prefixed, postcard-serialized record from a stream.
///
/// Returns `None` when the peer closed the connection before sending a
/// length prefix; truncation inside a frame is an error.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireFsError::Rpc(format!("frame read failed: {e}"))),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(WireFsError::Rpc(format!("frame too large: {len} bytes")));
    }

    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| WireFsError::Rpc(format!("frame truncated: {e}")))?;
    postcard::from_bytes(&buf)
        .map(Some)
        .map_err(|e| WireFsError::Rpc(format!("frame decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let call = CallEnvelope {
            method: "read".to_string(),
            arg_types: vec![TypeTag::Path, TypeTag::I64, TypeTag::I32],
            args: vec![1, 2, 3],
        };
        write_frame(&mut client, &call).await.unwrap();

        let got: CallEnvelope = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(got.method, "read");
        assert_eq!(got.arg_types, call.arg_types);
        assert_eq!(got.args, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fault_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let response = ResponseEnvelope::Fault(WireFsError::NotFound("/a".into()));
        write_frame(&mut server, &response).await.unwrap();

        match read_frame::<_, ResponseEnvelope>(&mut client).await.unwrap() {
            Some(ResponseEnvelope::Fault(WireFsError::NotFound(p))) => assert_eq!(p, "/a"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_before_frame_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let got = read_frame::<_, CallEnvelope>(&mut server).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0u8; 10]).await.unwrap();
        drop(client);
        assert!(read_frame::<_, CallEnvelope>(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(read_frame::<_, CallEnvelope>(&mut server).await.is_err());
    }
}
