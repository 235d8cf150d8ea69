//! Background daemon serving the store over a Unix socket.
//!
//! The daemon provides:
//! - A single writer: every request runs against one `Store`, in arrival order
//! - Credential verification before any engine call or consistency check;
//!   only `Ping` and `Shutdown` go unauthenticated
//! - A periodic consistency audit that logs drift

use crate::auth::{IdentityVerifier, TokenVerifier, TrustedVerifier};
use crate::blob::FsBlobStore;
use crate::graph::FollowGraph;
use crate::maintenance;
use crate::pictures::PictureCollection;
use crate::protocol::{Request, Response};
use crate::storage::RAPPORT_DIR;
use crate::store::Store;
use crate::types::NewUser;
use eyre::{Context, Result};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Socket file name within the .rapport directory.
const SOCKET_FILE: &str = "daemon.sock";

/// PID file name within the .rapport directory.
const PID_FILE: &str = "daemon.pid";

/// Default consistency audit interval in seconds.
const DEFAULT_AUDIT_INTERVAL_SECS: u64 = 300;

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Root directory containing .rapport
    pub root: PathBuf,

    /// How often to run a consistency check
    pub audit_interval: Duration,
}

impl DaemonConfig {
    /// Create config with default settings.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            audit_interval: Duration::from_secs(DEFAULT_AUDIT_INTERVAL_SECS),
        }
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.root.join(RAPPORT_DIR).join(SOCKET_FILE)
    }

    /// Get the PID file path.
    pub fn pid_path(&self) -> PathBuf {
        self.root.join(RAPPORT_DIR).join(PID_FILE)
    }
}

/// The rapport daemon.
pub struct Daemon {
    config: DaemonConfig,
    store: Store,
    verifier: Box<dyn IdentityVerifier>,
    blobs: FsBlobStore,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    /// Create a new daemon instance.
    ///
    /// Uses the static token table from config.yaml; with no tokens
    /// configured, credentials are trusted as user ids.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let store = Store::open(&config.root).context("Failed to open store")?;

        let tokens = TokenVerifier::new(store.config().tokens.clone());
        let verifier: Box<dyn IdentityVerifier> = if tokens.is_empty() {
            log::warn!("No tokens configured; trusting credentials as user ids");
            Box::new(TrustedVerifier)
        } else {
            Box::new(tokens)
        };

        let blob_dir = store.config().blob_dir(&config.root);
        let blobs = FsBlobStore::new(&blob_dir)
            .map_err(|e| eyre::eyre!("Failed to open blob directory {}: {}", blob_dir.display(), e))?;

        Ok(Self {
            config,
            store,
            verifier,
            blobs,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the identity verifier.
    pub fn with_verifier(mut self, verifier: Box<dyn IdentityVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Get a shutdown handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run the daemon (blocking).
    pub async fn run(&mut self) -> Result<()> {
        // Clean up any stale socket
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path).ok();
        }

        // Write PID file
        let pid_path = self.config.pid_path();
        fs::write(&pid_path, std::process::id().to_string()).context("Failed to write PID file")?;

        // Create Unix socket listener
        let listener = UnixListener::bind(&socket_path).context("Failed to bind to Unix socket")?;
        listener
            .set_nonblocking(true)
            .context("Failed to set socket to non-blocking")?;

        log::info!("Daemon listening on {:?}", socket_path);

        // Create channel for client requests
        let (tx, mut rx) = mpsc::channel::<(Request, mpsc::Sender<Response>)>(100);

        // Spawn connection acceptor task
        let shutdown_flag = Arc::clone(&self.shutdown);
        let tx_clone = tx.clone();
        tokio::spawn(async move {
            Self::accept_connections(listener, tx_clone, shutdown_flag).await;
        });

        // Main event loop
        let mut audit_interval = interval(self.config.audit_interval);

        loop {
            tokio::select! {
                // Handle incoming request
                Some((request, response_tx)) = rx.recv() => {
                    let response = self.handle_request(request);
                    let _ = response_tx.send(response).await;
                }

                // Periodic consistency audit
                _ = audit_interval.tick() => {
                    match maintenance::check(&self.store) {
                        Ok(report) if report.is_consistent() => {
                            log::debug!("Audit clean: {} users, {} edges", report.users, report.edges);
                        }
                        Ok(_) => {
                            log::warn!("Audit found inconsistencies; run 'rp check --repair'");
                        }
                        Err(e) => log::error!("Audit failed: {}", e),
                    }
                }
            }

            // Check shutdown flag
            if self.shutdown.load(Ordering::Relaxed) {
                log::info!("Daemon shutting down");
                break;
            }
        }

        // Cleanup
        fs::remove_file(&socket_path).ok();
        fs::remove_file(&pid_path).ok();

        Ok(())
    }

    /// Accept connections in a background task.
    async fn accept_connections(
        listener: UnixListener,
        tx: mpsc::Sender<(Request, mpsc::Sender<Response>)>,
        shutdown: Arc<AtomicBool>,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            match listener.accept() {
                Ok((stream, _)) => {
                    let tx_clone = tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, tx_clone).await {
                            log::warn!("Connection error: {}", e);
                        }
                    });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single client connection.
    async fn handle_connection(stream: UnixStream, tx: mpsc::Sender<(Request, mpsc::Sender<Response>)>) -> Result<()> {
        stream.set_nonblocking(false)?;

        let reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;

        for line in reader.lines() {
            let line = line.context("Failed to read line")?;
            if line.is_empty() {
                continue;
            }

            let request: Request = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    let response = Response::error("bad_request", format!("malformed request: {}", e));
                    writeln!(writer, "{}", serde_json::to_string(&response)?)?;
                    writer.flush()?;
                    continue;
                }
            };

            let is_shutdown = matches!(request, Request::Shutdown);

            // Send to main loop and wait for response
            let (resp_tx, mut resp_rx) = mpsc::channel(1);
            tx.send((request, resp_tx))
                .await
                .context("Failed to send request to daemon")?;

            if let Some(response) = resp_rx.recv().await {
                let response_json = serde_json::to_string(&response)?;
                writeln!(writer, "{}", response_json)?;
                writer.flush()?;
            }

            if is_shutdown {
                break;
            }
        }

        Ok(())
    }

    /// Resolve a credential, or produce the error response for it.
    fn authenticate(&self, credential: &str) -> std::result::Result<String, Response> {
        self.verifier.verify(credential).map_err(|e| {
            log::debug!("Rejected credential: {}", e);
            Response::error(e.code(), e.to_string())
        })
    }

    /// Handle a single request.
    fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::CreateUser {
                credential,
                username,
                email,
            } => {
                let user_id = match self.authenticate(&credential) {
                    Ok(id) => id,
                    Err(response) => return response,
                };
                match self.store.create_user(&NewUser::new(user_id, username, email)) {
                    Ok(user) => Response::User { user },
                    Err(e) => Response::from_report(&e),
                }
            }

            Request::ListUsers { credential } => {
                let viewer = match self.authenticate(&credential) {
                    Ok(id) => id,
                    Err(response) => return response,
                };
                match self.store.list_all(&viewer) {
                    Ok(users) => Response::Users { users },
                    Err(e) => Response::from_report(&e),
                }
            }

            Request::GetProfile { credential, target_id } => {
                let viewer = match self.authenticate(&credential) {
                    Ok(id) => id,
                    Err(response) => return response,
                };
                match self.store.profile(&viewer, &target_id) {
                    Ok(profile) => Response::Profile { profile },
                    Err(e) => Response::from_report(&e),
                }
            }

            Request::Follow { credential, target_id } => {
                let actor = match self.authenticate(&credential) {
                    Ok(id) => id,
                    Err(response) => return response,
                };
                match self.store.follow(&actor, &target_id) {
                    Ok(profile) => Response::Profile { profile },
                    Err(e) => Response::from_report(&e),
                }
            }

            Request::Unfollow { credential, target_id } => {
                let actor = match self.authenticate(&credential) {
                    Ok(id) => id,
                    Err(response) => return response,
                };
                match self.store.unfollow(&actor, &target_id) {
                    Ok(profile) => Response::Profile { profile },
                    Err(e) => Response::from_report(&e),
                }
            }

            Request::GetFollowing {
                credential,
                user_id,
                page,
                limit,
            } => {
                if let Err(response) = self.authenticate(&credential) {
                    return response;
                }
                let request = self.store.config().paging.request(page, limit);
                match self.store.following(&user_id, request) {
                    Ok(page) => Response::Following { page },
                    Err(e) => Response::from_report(&e),
                }
            }

            Request::AddPicture {
                credential,
                content_type,
                data,
            } => {
                let user_id = match self.authenticate(&credential) {
                    Ok(id) => id,
                    Err(response) => return response,
                };
                match self.store.add_picture(&user_id, &data, &content_type, &self.blobs) {
                    Ok(user) => Response::User { user },
                    Err(e) => Response::from_report(&e),
                }
            }

            Request::RemovePicture { credential, picture_id } => {
                let user_id = match self.authenticate(&credential) {
                    Ok(id) => id,
                    Err(response) => return response,
                };
                match self.store.remove_picture(&user_id, &picture_id, &self.blobs) {
                    Ok(user) => Response::User { user },
                    Err(e) => Response::from_report(&e),
                }
            }

            Request::SetPrimaryPicture { credential, picture_id } => {
                let user_id = match self.authenticate(&credential) {
                    Ok(id) => id,
                    Err(response) => return response,
                };
                match self.store.set_primary_picture(&user_id, &picture_id) {
                    Ok(user) => Response::User { user },
                    Err(e) => Response::from_report(&e),
                }
            }

            Request::Check { credential } => {
                if let Err(response) = self.authenticate(&credential) {
                    return response;
                }
                match maintenance::check(&self.store) {
                    Ok(report) => Response::Report { report },
                    Err(e) => Response::from_report(&e),
                }
            }

            Request::Shutdown => {
                self.shutdown.store(true, Ordering::Relaxed);
                Response::Ok
            }

            Request::Ping => Response::Pong,
        }
    }
}

/// Check if a daemon is running for the given store path.
pub fn is_daemon_running(root: &Path) -> bool {
    let config = DaemonConfig::new(root);
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if !socket_path.exists() {
        return false;
    }

    if let Ok(pid_str) = fs::read_to_string(&pid_path)
        && let Ok(pid) = pid_str.trim().parse::<i32>()
    {
        // Signal 0 checks existence without delivering anything
        unsafe {
            if libc::kill(pid, 0) == 0 {
                return true;
            }
        }
    }

    // Stale socket, clean up
    fs::remove_file(&socket_path).ok();
    fs::remove_file(&pid_path).ok();
    false
}

/// Start the daemon as a background process.
pub fn start_daemon(root: &Path) -> Result<()> {
    use std::process::Command;

    let exe = std::env::current_exe().context("Failed to get current executable")?;

    Command::new(exe)
        .args(["--dir", root.to_str().unwrap_or("."), "daemon"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("Failed to spawn daemon process")?;

    // Wait a bit for daemon to start
    std::thread::sleep(Duration::from_millis(100));

    Ok(())
}
