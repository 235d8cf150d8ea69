//! Shared test infrastructure for Rapport integration tests.
//!
//! Provides TestEnv helper for consistent test setup/teardown.

#![allow(dead_code)]

use rapport::{
    FollowGraph, MAX_PICTURES, MemoryBlobStore, NewUser, PictureCollection, Profile, Store, StoreError, User,
};
use tempfile::TempDir;

/// Test environment with automatic cleanup.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub store: Store,
    pub blobs: MemoryBlobStore,
}

impl TestEnv {
    /// Create a new test environment with an initialized store.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::init(temp_dir.path()).expect("Failed to init store");
        Self {
            temp_dir,
            store,
            blobs: MemoryBlobStore::new(),
        }
    }

    /// Create a user whose email is derived from the username.
    pub fn create_user(&mut self, id: &str, username: &str) -> User {
        self.store
            .create_user(&NewUser::new(id, username, format!("{}@example.com", username)))
            .expect("Failed to create user")
    }

    /// Follow, panicking on failure.
    pub fn follow(&mut self, actor: &str, target: &str) -> Profile {
        self.store.follow(actor, target).expect("Failed to follow")
    }

    /// Unfollow, panicking on failure.
    pub fn unfollow(&mut self, actor: &str, target: &str) -> Profile {
        self.store.unfollow(actor, target).expect("Failed to unfollow")
    }

    /// Upload a small PNG for a user.
    pub fn add_picture(&mut self, user_id: &str, data: &[u8]) -> User {
        self.store
            .add_picture(user_id, data, "image/png", &self.blobs)
            .expect("Failed to add picture")
    }

    /// Fetch a user that must exist.
    pub fn user(&self, id: &str) -> User {
        self.store
            .get_user(id)
            .expect("Failed to get user")
            .expect("User should exist")
    }

    /// Assert that every cached count equals the size of its set.
    pub fn assert_counts_match(&self) {
        for summary in self.store.users().expect("Failed to list users") {
            let user = self.user(&summary.id);
            assert_eq!(
                user.followers_count,
                user.followers.len() as u64,
                "followers_count drifted for {}",
                user.id
            );
            assert_eq!(
                user.following_count,
                user.following.len() as u64,
                "following_count drifted for {}",
                user.id
            );
        }
    }

    /// Assert that A follows B exactly when B lists A as a follower.
    pub fn assert_mutually_consistent(&self) {
        let users: Vec<User> = self
            .store
            .users()
            .expect("Failed to list users")
            .iter()
            .map(|s| self.user(&s.id))
            .collect();

        for a in &users {
            for b in &users {
                assert_eq!(
                    a.follows(&b.id),
                    b.is_followed_by(&a.id),
                    "edge {} -> {} is only recorded on one side",
                    a.id,
                    b.id
                );
            }
        }
    }

    /// Assert the picture invariants for one user.
    pub fn assert_pictures_valid(&self, id: &str) {
        let user = self.user(id);
        assert!(user.pictures.len() <= MAX_PICTURES, "{} holds too many pictures", id);
        let primaries = user.pictures.iter().filter(|p| p.is_primary).count();
        if user.pictures.is_empty() {
            assert_eq!(primaries, 0);
        } else {
            assert_eq!(primaries, 1, "{} must have exactly one primary picture", id);
        }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Assert that a result failed with the given stable error code.
pub fn assert_code<T: std::fmt::Debug>(result: eyre::Result<T>, code: &str) {
    let err = result.expect_err("expected an error");
    let found = StoreError::find(&err).unwrap_or_else(|| panic!("expected a StoreError, got {:?}", err));
    assert_eq!(found.code(), code, "unexpected error: {}", found);
}
