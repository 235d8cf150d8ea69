//! High-level store API for rapport.

use crate::config::Config;
use crate::storage::{Storage, Writer};
use crate::types::{NewUser, User, UserSummary, ValidationError};
use chrono::Utc;
use eyre::{Context, Result};
use rusqlite::ErrorCode;
use std::path::Path;

/// Errors that can occur during store operations.
#[derive(Debug)]
pub enum StoreError {
    /// User not found.
    UserNotFound(String),
    /// Picture not found on the given user.
    PictureNotFound(String),
    /// Actor and target are the same user.
    SelfReference,
    /// Actor already follows target.
    AlreadyRelated { actor: String, target: String },
    /// Actor does not follow target.
    NotRelated { actor: String, target: String },
    /// Picture limit reached.
    CapacityExceeded { max: usize },
    /// The blob store failed.
    StorageFailure(String),
    /// A concurrent update could not be applied cleanly.
    Conflict(String),
    /// Credential rejected upstream.
    Unauthenticated,
    /// Unique field already taken.
    Duplicate { field: &'static str },
    /// Validation error.
    Validation(ValidationError),
}

impl StoreError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::UserNotFound(_) | StoreError::PictureNotFound(_) => "not_found",
            StoreError::SelfReference => "self_reference",
            StoreError::AlreadyRelated { .. } => "already_related",
            StoreError::NotRelated { .. } => "not_related",
            StoreError::CapacityExceeded { .. } => "capacity_exceeded",
            StoreError::StorageFailure(_) => "storage_failure",
            StoreError::Conflict(_) => "conflict",
            StoreError::Unauthenticated => "unauthenticated",
            StoreError::Duplicate { .. } => "duplicate",
            StoreError::Validation(_) => "invalid",
        }
    }

    /// Find the store error carried by a report, if any.
    pub fn find(report: &eyre::Report) -> Option<&StoreError> {
        report.chain().find_map(|e| e.downcast_ref::<StoreError>())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::UserNotFound(id) => write!(f, "user not found: {}", id),
            StoreError::PictureNotFound(id) => write!(f, "picture not found: {}", id),
            StoreError::SelfReference => write!(f, "cannot follow or unfollow yourself"),
            StoreError::AlreadyRelated { actor, target } => {
                write!(f, "{} already follows {}", actor, target)
            }
            StoreError::NotRelated { actor, target } => write!(f, "{} does not follow {}", actor, target),
            StoreError::CapacityExceeded { max } => write!(f, "picture limit of {} reached", max),
            StoreError::StorageFailure(msg) => write!(f, "blob storage failed: {}", msg),
            StoreError::Conflict(msg) => write!(f, "conflicting update: {}", msg),
            StoreError::Unauthenticated => write!(f, "invalid or missing credential"),
            StoreError::Duplicate { field } => write!(f, "{} is already taken", field),
            StoreError::Validation(e) => write!(f, "validation error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Check if an error is SQLite lock contention.
fn is_contention(err: &eyre::Report) -> bool {
    sqlite_code(err).is_some_and(|code| matches!(code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked))
}

/// Check if an error is a violated SQLite constraint.
fn is_constraint_violation(err: &eyre::Report) -> bool {
    sqlite_code(err) == Some(ErrorCode::ConstraintViolation)
}

fn sqlite_code(err: &eyre::Report) -> Option<ErrorCode> {
    err.chain().find_map(|e| match e.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(failure, _)) => Some(failure.code),
        _ => None,
    })
}

/// The main rapport store.
pub struct Store {
    storage: Storage,
    config: Config,
}

impl Store {
    /// Initialize a new store in the given directory.
    ///
    /// Writes a default config.yaml if none exists yet.
    pub fn init(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        let storage = Storage::init(root, config.busy_timeout())?;
        if !Config::path(root).exists() {
            config.save(root)?;
        }
        Ok(Self { storage, config })
    }

    /// Open an existing store with the config found under its root.
    pub fn open(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        Self::open_with_config(root, config)
    }

    /// Open an existing store with an explicit config.
    pub fn open_with_config(root: &Path, config: Config) -> Result<Self> {
        let storage = Storage::open(root, config.busy_timeout())?;
        Ok(Self { storage, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Path {
        self.storage.root()
    }

    /// Path of the SQLite database for a store root.
    pub fn db_path(root: &Path) -> std::path::PathBuf {
        Storage::db_path(root)
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Create a new user. Id, username and email must all be unused.
    pub fn create_user(&mut self, new_user: &NewUser) -> Result<User> {
        new_user
            .validate()
            .map_err(|e| eyre::eyre!(StoreError::Validation(e)))?;

        let now = Utc::now();
        let user = User {
            id: new_user.id.clone(),
            username: new_user.username.clone(),
            email: new_user.email.clone(),
            pictures: vec![],
            following: vec![],
            followers: vec![],
            followers_count: 0,
            following_count: 0,
            created_at: now,
            updated_at: now,
        };

        self.write("create user", |w| {
            if w.user_exists(&user.id)? {
                return Err(eyre::eyre!(StoreError::Duplicate { field: "id" }));
            }
            if w.find_by_username(&user.username)?.is_some() {
                return Err(eyre::eyre!(StoreError::Duplicate { field: "username" }));
            }
            if w.find_by_email(&user.email)?.is_some() {
                return Err(eyre::eyre!(StoreError::Duplicate { field: "email" }));
            }
            w.insert_user(&user).context("Failed to persist user")
        })?;

        log::info!("Created user {} ({})", user.id, user.username);
        Ok(user)
    }

    /// Get a user by ID.
    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.storage.get_user(id)
    }

    /// Public fields of every user, oldest first.
    pub fn users(&self) -> Result<Vec<UserSummary>> {
        self.storage.list_users()
    }

    /// Get a user, failing with `UserNotFound` if absent.
    pub(crate) fn require_user(&self, id: &str) -> Result<User> {
        self.storage
            .get_user(id)?
            .ok_or_else(|| eyre::eyre!(StoreError::UserNotFound(id.to_string())))
    }

    /// Run a single-attempt write. Lock contention surfaces as `Conflict`.
    pub(crate) fn write<T>(&mut self, op: &str, f: impl FnMut(&Writer<'_>) -> Result<T>) -> Result<T> {
        self.write_attempts(op, 1, f)
    }

    /// Run a write, retrying on lock contention per the configured policy.
    pub(crate) fn write_retrying<T>(&mut self, op: &str, f: impl FnMut(&Writer<'_>) -> Result<T>) -> Result<T> {
        let attempts = self.config.retry.attempts;
        self.write_attempts(op, attempts, f)
    }

    fn write_attempts<T>(&mut self, op: &str, attempts: u32, mut f: impl FnMut(&Writer<'_>) -> Result<T>) -> Result<T> {
        let attempts = attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.storage.write(&mut f) {
                Ok(value) => return Ok(value),
                Err(e) if is_contention(&e) => {
                    if attempt >= attempts {
                        log::warn!("{} gave up after {} attempt(s): {}", op, attempt, e);
                        return Err(eyre::eyre!(StoreError::Conflict(format!(
                            "{} could not acquire the store",
                            op
                        ))));
                    }
                    let delay = self.config.retry.delay(attempt);
                    log::warn!(
                        "{} hit lock contention (attempt {}/{}), retrying in {:?}",
                        op,
                        attempt,
                        attempts,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) if StoreError::find(&e).is_none() && is_constraint_violation(&e) => {
                    log::warn!("{} violated a store constraint: {}", op, e);
                    return Err(eyre::eyre!(StoreError::Conflict(format!(
                        "{} conflicts with the stored state",
                        op
                    ))));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
