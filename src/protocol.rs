//! Admin IPC protocol
//!
//! Request/response types for the admin client talking to the daemon over
//! a Unix stream socket. Messages are MessagePack-encoded and
//! length-prefixed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Daemon socket path.
pub const SOCKET_PATH: &str = "/run/supd.sock";

/// Frames larger than this are rejected.
const MAX_FRAME: u32 = 1024 * 1024;

/// Request from the admin client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Enable a service or instance.
    Enable { path: String },
    /// Disable a service or instance (orderly shutdown of dependents
    /// first).
    Disable { path: String },
    /// Re-read a vertex's declarations (reserved).
    Refresh { path: String },
    /// Status of one instance.
    Status { path: String },
    /// List every known instance.
    List,
    /// Render the dependency graph in DOT form.
    DotGraph,
    /// Health check.
    Ping,
}

/// Per-instance status row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitInfo {
    pub path: String,
    /// Graph-side state of the instance vertex.
    pub graph_state: String,
    /// Restarter-side state of the unit.
    pub unit_state: String,
    pub enabled: bool,
}

/// Response from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Units(Vec<UnitInfo>),
    Status(UnitInfo),
    Dot(String),
    Error(String),
    Pong,
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame of {0} bytes exceeds limit")]
    Oversize(u32),
}

/// Write one length-prefixed MessagePack frame.
pub async fn write_msg<T, W>(writer: &mut W, msg: &T) -> Result<(), IpcError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = rmp_serde::to_vec(msg)?;
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed MessagePack frame.
pub async fn read_msg<T, R>(reader: &mut R) -> Result<T, IpcError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME {
        return Err(IpcError::Oversize(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(rmp_serde::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let requests = vec![
            Request::Enable {
                path: "db:main".into(),
            },
            Request::Disable {
                path: "ws:main".into(),
            },
            Request::Status {
                path: "log:main".into(),
            },
            Request::List,
            Request::Ping,
        ];

        for req in requests {
            let encoded = rmp_serde::to_vec(&req).unwrap();
            let decoded: Request = rmp_serde::from_slice(&encoded).unwrap();
            assert_eq!(format!("{:?}", req), format!("{:?}", decoded));
        }
    }

    #[test]
    fn response_roundtrip() {
        let responses = vec![
            Response::Ok,
            Response::Error("no such path".into()),
            Response::Units(vec![UnitInfo {
                path: "db:main".into(),
                graph_state: "online".into(),
                unit_state: "online".into(),
                enabled: true,
            }]),
            Response::Dot("digraph {}".into()),
            Response::Pong,
        ];

        for resp in responses {
            let encoded = rmp_serde::to_vec(&resp).unwrap();
            let decoded: Response = rmp_serde::from_slice(&encoded).unwrap();
            assert_eq!(format!("{:?}", resp), format!("{:?}", decoded));
        }
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_msg(&mut a, &Request::Ping).await.unwrap();
        let req: Request = read_msg(&mut b).await.unwrap();
        assert!(matches!(req, Request::Ping));
    }

    #[tokio::test]
    async fn frame_rejects_oversize() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_u32(MAX_FRAME + 1).await;
        });
        let res: Result<Request, _> = read_msg(&mut b).await;
        assert!(matches!(res, Err(IpcError::Oversize(_))));
    }
}
