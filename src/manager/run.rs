//! Daemon event loop and admin RPC server
//!
//! Single-threaded cooperative scheduling: one task owns the manager and
//! selects over process events, readiness datagrams, the earliest timer
//! deadline, and inbound admin requests. Each event is translated into
//! notes and the queue drained before the next kernel wait.

use std::path::PathBuf;
use std::time::Instant;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{self, Request, Response};
use crate::repository::MemRepository;
use crate::restarter::{OsProcessTracker, ReadinessListener, NOTIFY_SOCKET_PATH};

use super::{Manager, ManagerError};

pub struct DaemonOptions {
    /// Directory of `*.service` declaration files.
    pub services_dir: PathBuf,
    /// Admin RPC socket.
    pub socket_path: PathBuf,
    /// Readiness notification socket.
    pub notify_socket: PathBuf,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            services_dir: PathBuf::from("/etc/supd/services"),
            socket_path: PathBuf::from(protocol::SOCKET_PATH),
            notify_socket: PathBuf::from(NOTIFY_SOCKET_PATH),
        }
    }
}

pub async fn run_daemon(opts: DaemonOptions) -> Result<(), ManagerError> {
    let repo = MemRepository::load_dir(&opts.services_dir)?;

    let (tracker, mut proc_rx) = OsProcessTracker::new();
    let mut manager = Manager::new(Box::new(repo), Box::new(tracker));

    let (_readiness, mut ready_rx) = ReadinessListener::new(&opts.notify_socket)?;
    log::info!("readiness socket listening at {}", opts.notify_socket.display());

    let _ = std::fs::remove_file(&opts.socket_path);
    let listener = UnixListener::bind(&opts.socket_path)?;
    log::info!("admin socket listening at {}", opts.socket_path.display());

    let (admin_tx, mut admin_rx) = mpsc::channel::<(Request, oneshot::Sender<Response>)>(16);
    tokio::spawn(accept_admin(listener, admin_tx));

    manager.load_services();

    loop {
        let deadline = manager.restarter.timers.next_deadline();

        tokio::select! {
            Some(ev) = proc_rx.recv() => {
                manager.handle_process_event(ev);
            }
            Some(msg) = ready_rx.recv() => {
                manager.handle_readiness(msg);
            }
            Some((req, reply)) = admin_rx.recv() => {
                let resp = manager.handle_admin(req);
                let _ = reply.send(resp);
            }
            _ = sleep_until_deadline(deadline) => {
                manager.expire_timers(Instant::now());
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

async fn accept_admin(
    listener: UnixListener,
    tx: mpsc::Sender<(Request, oneshot::Sender<Response>)>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let tx = tx.clone();
                tokio::spawn(handle_connection(stream, tx));
            }
            Err(e) => {
                log::error!("admin accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    tx: mpsc::Sender<(Request, oneshot::Sender<Response>)>,
) {
    let request: Request = match protocol::read_msg(&mut stream).await {
        Ok(r) => r,
        Err(e) => {
            log::error!("admin read error: {}", e);
            let _ = protocol::write_msg(&mut stream, &Response::Error("invalid request".into()))
                .await;
            return;
        }
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if tx.send((request, reply_tx)).await.is_err() {
        return;
    }

    if let Ok(response) = reply_rx.await {
        if let Err(e) = protocol::write_msg(&mut stream, &response).await {
            log::error!("admin write error: {}", e);
        }
    }
}
