//! Readiness notification socket
//!
//! Units of type notify signal readiness by writing `READY=1` datagrams
//! to a well-known socket; children find it through the NOTIFY_SOCKET
//! environment variable. The kernel stamps each datagram with the
//! sender's credentials, which is how a message gets matched to the unit
//! owning that PID.

use std::collections::HashMap;
use std::io::{self, IoSliceMut};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, UnixCredentials,
};
use tokio::io::Interest;
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;

/// Default socket path.
pub const NOTIFY_SOCKET_PATH: &str = "/var/run/s16_sd_notify.sock";

/// A parsed readiness datagram.
#[derive(Debug, Clone)]
pub struct ReadinessMessage {
    /// Sender PID from the socket credentials.
    pub pid: u32,
    fields: HashMap<String, String>,
}

impl ReadinessMessage {
    /// Parse a datagram body into key-value fields. Lines without `=`
    /// carry nothing and are dropped.
    pub fn parse(msg: &str, pid: u32) -> Self {
        let fields = msg
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { pid, fields }
    }

    /// Is this a READY=1 notification?
    pub fn is_ready(&self) -> bool {
        self.fields.get("READY").map(|v| v == "1").unwrap_or(false)
    }

    /// STATUS message, if present.
    pub fn status(&self) -> Option<&str> {
        self.fields.get("STATUS").map(|s| s.as_str())
    }

    /// MAINPID override, if present.
    pub fn main_pid(&self) -> Option<u32> {
        self.fields.get("MAINPID").and_then(|s| s.parse().ok())
    }
}

/// Binds the readiness socket and feeds parsed datagrams to the event
/// loop over a channel. The receiver task owns the socket; dropping the
/// listener unlinks the path.
pub struct ReadinessListener {
    socket_path: PathBuf,
}

impl ReadinessListener {
    pub fn new(path: &Path) -> io::Result<(Self, mpsc::Receiver<ReadinessMessage>)> {
        let socket = bind_notify_socket(path)?;
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                match recv_message(&socket).await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::error!("readiness socket failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                socket_path: path.to_path_buf(),
            },
            rx,
        ))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ReadinessListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Bind the well-known socket: stale file unlinked, credential passing
/// enabled, and writable by any service user.
fn bind_notify_socket(path: &Path) -> io::Result<UnixDatagram> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(path);

    let socket = UnixDatagram::bind(path)?;
    setsockopt(&socket, sockopt::PassCred, &true)
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))?;
    Ok(socket)
}

/// Wait until one well-formed datagram arrives. Payloads that are not
/// UTF-8 are discarded; only a socket-level failure is an error.
async fn recv_message(socket: &UnixDatagram) -> io::Result<ReadinessMessage> {
    loop {
        socket.readable().await?;
        match socket.try_io(Interest::READABLE, || recv_with_pid(socket)) {
            Ok(Some(msg)) => return Ok(msg),
            Ok(None) => {
                log::warn!("discarding readiness datagram that is not UTF-8");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
}

/// One non-blocking receive, decoding SCM_CREDENTIALS for the sender
/// PID. A datagram without credentials reads as PID 0, which no unit
/// owns.
fn recv_with_pid(socket: &UnixDatagram) -> io::Result<Option<ReadinessMessage>> {
    let mut buf = [0u8; 4096];

    let (len, pid) = {
        let mut cmsg = cmsg_space!(UnixCredentials);
        let mut iov = [IoSliceMut::new(&mut buf)];
        let recv = recvmsg::<()>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let pid = recv
            .cmsgs()
            .ok()
            .and_then(|mut cmsgs| {
                cmsgs.find_map(|c| match c {
                    ControlMessageOwned::ScmCredentials(creds) => Some(creds.pid() as u32),
                    _ => None,
                })
            })
            .unwrap_or(0);

        (recv.bytes, pid)
    };

    match std::str::from_utf8(&buf[..len]) {
        Ok(text) => Ok(Some(ReadinessMessage::parse(text, pid))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ready() {
        let msg = ReadinessMessage::parse("READY=1\nSTATUS=Serving\n", 1234);
        assert!(msg.is_ready());
        assert_eq!(msg.status(), Some("Serving"));
        assert_eq!(msg.pid, 1234);
    }

    #[test]
    fn test_parse_not_ready() {
        let msg = ReadinessMessage::parse("STATUS=Warming up", 5678);
        assert!(!msg.is_ready());
        assert_eq!(msg.status(), Some("Warming up"));
    }

    #[test]
    fn test_parse_mainpid() {
        let msg = ReadinessMessage::parse("MAINPID=9999\nREADY=1", 1000);
        assert_eq!(msg.main_pid(), Some(9999));
        assert!(msg.is_ready());
    }

    #[test]
    fn test_parse_ignores_junk_lines() {
        let msg = ReadinessMessage::parse("garbage\nREADY=1\n", 1);
        assert!(msg.is_ready());
        assert_eq!(msg.status(), None);
    }
}
