//! Rapport: a social follow graph with profile pictures.
//!
//! Each user document carries its own following and followers sets. A
//! follow or unfollow writes both documents in one transaction, so the
//! mutual-consistency guarantee holds even under concurrent writers. Each
//! user also owns at most five pictures, exactly one of which is primary
//! whenever any exist.
//!
//! # Example
//!
//! ```no_run
//! use rapport::{FollowGraph, MemoryBlobStore, NewUser, PageRequest, PictureCollection, Store};
//! use std::path::Path;
//!
//! // Initialize a new store
//! let mut store = Store::init(Path::new(".")).unwrap();
//!
//! // Create users
//! store.create_user(&NewUser::new("user_a", "alice", "alice@example.com")).unwrap();
//! store.create_user(&NewUser::new("user_b", "bob", "bob@example.com")).unwrap();
//!
//! // Follow
//! let profile = store.follow("user_a", "user_b").unwrap();
//! assert!(profile.is_following);
//! assert_eq!(profile.user.followers_count, 1);
//!
//! // Page through who alice follows
//! let page = store.following("user_a", PageRequest::default()).unwrap();
//! assert_eq!(page.total, 1);
//!
//! // The first picture becomes primary
//! let blobs = MemoryBlobStore::new();
//! let user = store.add_picture("user_a", b"...", "image/png", &blobs).unwrap();
//! assert!(user.pictures[0].is_primary);
//! ```

mod auth;
mod blob;
mod config;
mod graph;
mod id;
mod pictures;
mod storage;
mod store;
mod types;

pub mod client;
pub mod daemon;
pub mod maintenance;
pub mod protocol;

// Re-export public API
pub use auth::{IdentityVerifier, TokenVerifier, TrustedVerifier};
pub use blob::{BlobError, BlobStore, FsBlobStore, MemoryBlobStore};
pub use client::Client;
pub use config::{Config, PagingConfig, RetryPolicy, UploadPolicy};
pub use daemon::{Daemon, DaemonConfig, is_daemon_running, start_daemon};
pub use graph::FollowGraph;
pub use maintenance::{ConsistencyReport, RepairResult, VacuumResult};
pub use pictures::PictureCollection;
pub use protocol::{Request, Response};
pub use store::{Store, StoreError};
pub use types::{
    FollowingPage, MAX_PICTURES, NewUser, PageRequest, Picture, Profile, User, UserListing, UserSummary,
    ValidationError,
};
