//! Client for connecting to the rapport daemon.

use crate::daemon::{DaemonConfig, is_daemon_running, start_daemon};
use crate::maintenance::ConsistencyReport;
use crate::protocol::{Request, Response};
use crate::types::{FollowingPage, Profile, User, UserListing};
use eyre::{Context, Result, bail};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client for communicating with the rapport daemon.
///
/// Every user-facing request carries the client's credential.
pub struct Client {
    root: PathBuf,
    stream: UnixStream,
    credential: String,
}

impl Client {
    /// Connect to the daemon, optionally auto-starting it if not running.
    pub fn connect(root: &Path, credential: impl Into<String>, auto_start: bool) -> Result<Self> {
        let config = DaemonConfig::new(root);
        let socket_path = config.socket_path();

        // Try to connect, auto-start if needed
        let stream = match UnixStream::connect(&socket_path) {
            Ok(stream) => stream,
            Err(_) if auto_start => {
                if !is_daemon_running(root) {
                    start_daemon(root).context("Failed to auto-start daemon")?;

                    // Wait for daemon to be ready
                    let mut attempts = 0;
                    loop {
                        if attempts > 20 {
                            bail!("Daemon failed to start in time");
                        }
                        std::thread::sleep(Duration::from_millis(50));
                        if let Ok(stream) = UnixStream::connect(&socket_path) {
                            break stream;
                        }
                        attempts += 1;
                    }
                } else {
                    UnixStream::connect(&socket_path).context("Failed to connect to daemon")?
                }
            }
            Err(e) => {
                bail!("Failed to connect to daemon: {}. Is it running?", e);
            }
        };

        stream
            .set_read_timeout(Some(Duration::from_secs(30)))
            .context("Failed to set read timeout")?;

        Ok(Self {
            root: root.to_path_buf(),
            stream,
            credential: credential.into(),
        })
    }

    /// Get the store root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Send a request and receive a response.
    fn request(&mut self, request: Request) -> Result<Response> {
        let request_json = serde_json::to_string(&request)?;
        writeln!(self.stream, "{}", request_json)?;
        self.stream.flush()?;

        let mut reader = BufReader::new(&self.stream);
        let mut response_line = String::new();
        reader.read_line(&mut response_line)?;
        if response_line.is_empty() {
            bail!("Daemon closed the connection");
        }

        let response: Response = serde_json::from_str(&response_line)?;
        Ok(response)
    }

    fn credential(&self) -> String {
        self.credential.clone()
    }

    /// Create the user this client's credential belongs to.
    pub fn create_user(&mut self, username: &str, email: &str) -> Result<User> {
        let response = self.request(Request::CreateUser {
            credential: self.credential(),
            username: username.to_string(),
            email: email.to_string(),
        })?;

        match response {
            Response::User { user } => Ok(user),
            Response::Error { code, message } => bail!("{}: {}", code, message),
            _ => bail!("Unexpected response"),
        }
    }

    /// List every user relative to this client.
    pub fn list_users(&mut self) -> Result<Vec<UserListing>> {
        let response = self.request(Request::ListUsers {
            credential: self.credential(),
        })?;

        match response {
            Response::Users { users } => Ok(users),
            Response::Error { code, message } => bail!("{}: {}", code, message),
            _ => bail!("Unexpected response"),
        }
    }

    /// Get a user's profile.
    pub fn profile(&mut self, target_id: &str) -> Result<Profile> {
        let response = self.request(Request::GetProfile {
            credential: self.credential(),
            target_id: target_id.to_string(),
        })?;
        Self::expect_profile(response)
    }

    /// Follow a user.
    pub fn follow(&mut self, target_id: &str) -> Result<Profile> {
        let response = self.request(Request::Follow {
            credential: self.credential(),
            target_id: target_id.to_string(),
        })?;
        Self::expect_profile(response)
    }

    /// Unfollow a user.
    pub fn unfollow(&mut self, target_id: &str) -> Result<Profile> {
        let response = self.request(Request::Unfollow {
            credential: self.credential(),
            target_id: target_id.to_string(),
        })?;
        Self::expect_profile(response)
    }

    fn expect_profile(response: Response) -> Result<Profile> {
        match response {
            Response::Profile { profile } => Ok(profile),
            Response::Error { code, message } => bail!("{}: {}", code, message),
            _ => bail!("Unexpected response"),
        }
    }

    /// Page through the users someone follows.
    pub fn following(&mut self, user_id: &str, page: Option<u32>, limit: Option<u32>) -> Result<FollowingPage> {
        let response = self.request(Request::GetFollowing {
            credential: self.credential(),
            user_id: user_id.to_string(),
            page,
            limit,
        })?;

        match response {
            Response::Following { page } => Ok(page),
            Response::Error { code, message } => bail!("{}: {}", code, message),
            _ => bail!("Unexpected response"),
        }
    }

    /// Upload a picture.
    pub fn add_picture(&mut self, data: Vec<u8>, content_type: &str) -> Result<User> {
        let response = self.request(Request::AddPicture {
            credential: self.credential(),
            content_type: content_type.to_string(),
            data,
        })?;
        Self::expect_user(response)
    }

    /// Remove a picture.
    pub fn remove_picture(&mut self, picture_id: &str) -> Result<User> {
        let response = self.request(Request::RemovePicture {
            credential: self.credential(),
            picture_id: picture_id.to_string(),
        })?;
        Self::expect_user(response)
    }

    /// Make a picture primary.
    pub fn set_primary_picture(&mut self, picture_id: &str) -> Result<User> {
        let response = self.request(Request::SetPrimaryPicture {
            credential: self.credential(),
            picture_id: picture_id.to_string(),
        })?;
        Self::expect_user(response)
    }

    fn expect_user(response: Response) -> Result<User> {
        match response {
            Response::User { user } => Ok(user),
            Response::Error { code, message } => bail!("{}: {}", code, message),
            _ => bail!("Unexpected response"),
        }
    }

    /// Run a consistency check in the daemon.
    pub fn check(&mut self) -> Result<ConsistencyReport> {
        let response = self.request(Request::Check {
            credential: self.credential(),
        })?;

        match response {
            Response::Report { report } => Ok(report),
            Response::Error { code, message } => bail!("{}: {}", code, message),
            _ => bail!("Unexpected response"),
        }
    }

    /// Ping the daemon.
    pub fn ping(&mut self) -> Result<()> {
        match self.request(Request::Ping)? {
            Response::Pong => Ok(()),
            _ => bail!("Unexpected response"),
        }
    }

    /// Shutdown the daemon.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.request(Request::Shutdown)? {
            Response::Ok => Ok(()),
            _ => bail!("Unexpected response"),
        }
    }
}
