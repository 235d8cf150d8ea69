//! Integration tests for error handling.
//!
//! Tests that errors carry the right code and leave state untouched.

mod common;

use common::{TestEnv, assert_code};
use rapport::{FollowGraph, NewUser, PageRequest, PictureCollection, Store, StoreError};
use tempfile::TempDir;

// =============================================================================
// Not Found Tests
// =============================================================================

#[test]
fn test_get_nonexistent_user_returns_none() {
    let env = TestEnv::new();
    assert!(env.store.get_user("ghost").unwrap().is_none());
}

#[test]
fn test_follow_nonexistent_target_fails() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");

    assert_code(env.store.follow("user_a", "ghost"), "not_found");
    assert_eq!(env.user("user_a").following_count, 0);
}

#[test]
fn test_follow_from_nonexistent_actor_fails() {
    let mut env = TestEnv::new();
    env.create_user("user_b", "bob");

    let err = env.store.follow("ghost", "user_b").unwrap_err();
    assert!(matches!(StoreError::find(&err), Some(StoreError::UserNotFound(id)) if id == "ghost"));
    assert_eq!(env.user("user_b").followers_count, 0);
}

#[test]
fn test_unfollow_nonexistent_target_fails() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    assert_code(env.store.unfollow("user_a", "ghost"), "not_found");
}

#[test]
fn test_following_of_nonexistent_user_fails() {
    let env = TestEnv::new();
    assert_code(env.store.following("ghost", PageRequest::default()), "not_found");
}

#[test]
fn test_profile_of_nonexistent_user_fails() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    assert_code(env.store.profile("user_a", "ghost"), "not_found");
    assert_code(env.store.list_all("ghost"), "not_found");
}

#[test]
fn test_picture_ops_on_nonexistent_user_fail() {
    let mut env = TestEnv::new();
    assert_code(
        env.store.add_picture("ghost", b"img", "image/png", &env.blobs),
        "not_found",
    );
    assert_code(env.store.remove_picture("ghost", "pic-0000000000", &env.blobs), "not_found");
    assert_code(env.store.set_primary_picture("ghost", "pic-0000000000"), "not_found");
    assert!(env.blobs.is_empty());
}

#[test]
fn test_nonexistent_picture_fails() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.add_picture("user_a", b"img");

    let err = env
        .store
        .remove_picture("user_a", "pic-missing", &env.blobs)
        .unwrap_err();
    assert!(matches!(StoreError::find(&err), Some(StoreError::PictureNotFound(id)) if id == "pic-missing"));
    assert_code(env.store.set_primary_picture("user_a", "pic-missing"), "not_found");
    assert_eq!(env.user("user_a").pictures.len(), 1);
}

#[test]
fn test_cannot_touch_another_users_picture() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");
    let bob = env.add_picture("user_b", b"bob's");
    let picture_id = bob.pictures[0].id.clone();

    assert_code(env.store.remove_picture("user_a", &picture_id, &env.blobs), "not_found");
    assert_code(env.store.set_primary_picture("user_a", &picture_id), "not_found");
    assert_eq!(env.user("user_b").pictures.len(), 1);
}

// =============================================================================
// Relation Precondition Tests
// =============================================================================

#[test]
fn test_unfollow_after_unfollow_fails() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");
    env.follow("user_a", "user_b");
    env.unfollow("user_a", "user_b");

    assert_code(env.store.unfollow("user_a", "user_b"), "not_related");
    let b = env.user("user_b");
    assert_eq!(b.followers_count, 0);
}

#[test]
fn test_reverse_edge_does_not_count_as_related() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");
    env.follow("user_b", "user_a");

    assert_code(env.store.unfollow("user_a", "user_b"), "not_related");
    env.assert_mutually_consistent();
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_create_user_validation() {
    let mut env = TestEnv::new();

    let cases = [
        NewUser::new("", "alice", "alice@example.com"),
        NewUser::new("has space", "alice", "alice@example.com"),
        NewUser::new("user_a", "al", "alice@example.com"),
        NewUser::new("user_a", "a".repeat(21), "alice@example.com"),
        NewUser::new("user_a", "al-ice", "alice@example.com"),
        NewUser::new("user_a", "alice", "not-an-email"),
        NewUser::new("user_a", "alice", "alice@nodot"),
    ];
    for case in &cases {
        assert_code(env.store.create_user(case), "invalid");
    }
    assert!(env.store.users().unwrap().is_empty());
}

#[test]
fn test_username_boundaries_accepted() {
    let mut env = TestEnv::new();
    env.store
        .create_user(&NewUser::new("u3", "abc", "three@example.com"))
        .unwrap();
    env.store
        .create_user(&NewUser::new("u20", "a".repeat(20), "twenty@example.com"))
        .unwrap();
    env.store
        .create_user(&NewUser::new("u_mixed", "Mixed_Case_9", "mixed@example.com"))
        .unwrap();
}

#[test]
fn test_duplicate_user_fields() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");

    assert_code(
        env.store
            .create_user(&NewUser::new("user_a", "other", "other@example.com")),
        "duplicate",
    );
    assert_code(
        env.store
            .create_user(&NewUser::new("user_b", "alice", "other@example.com")),
        "duplicate",
    );
    assert_code(
        env.store
            .create_user(&NewUser::new("user_b", "other", "alice@example.com")),
        "duplicate",
    );
}

#[test]
fn test_upload_validation() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");

    assert_code(
        env.store.add_picture("user_a", b"", "image/png", &env.blobs),
        "invalid",
    );
    assert_code(
        env.store.add_picture("user_a", b"GIF89a", "image/gif", &env.blobs),
        "invalid",
    );
    let too_big = vec![0u8; 5 * 1024 * 1024 + 1];
    assert_code(
        env.store.add_picture("user_a", &too_big, "image/jpeg", &env.blobs),
        "invalid",
    );

    // Content type matching ignores case
    env.store
        .add_picture("user_a", b"ok", "IMAGE/WEBP", &env.blobs)
        .unwrap();
    assert_eq!(env.blobs.len(), 1);
}

// =============================================================================
// Storage Failure Tests
// =============================================================================

#[test]
fn test_blob_put_failure_is_storage_failure() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.blobs.fail_puts(true);

    assert_code(
        env.store.add_picture("user_a", b"img", "image/png", &env.blobs),
        "storage_failure",
    );
    assert!(env.user("user_a").pictures.is_empty());

    env.blobs.fail_puts(false);
    let user = env.add_picture("user_a", b"img");
    assert!(user.pictures[0].is_primary);
}

#[test]
fn test_blob_delete_failure_still_removes_picture() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    let user = env.add_picture("user_a", b"img");
    env.blobs.fail_deletes(true);

    let user = env
        .store
        .remove_picture("user_a", &user.pictures[0].id, &env.blobs)
        .unwrap();
    assert!(user.pictures.is_empty());
    env.assert_pictures_valid("user_a");
}

// =============================================================================
// Store Lifecycle Tests
// =============================================================================

#[test]
fn test_init_creates_rapport_directory() {
    let temp = TempDir::new().unwrap();
    Store::init(temp.path()).unwrap();

    assert!(temp.path().join(".rapport").exists());
    assert!(Store::db_path(temp.path()).exists());
    assert!(temp.path().join(".rapport").join("config.yaml").exists());
}

#[test]
fn test_open_existing_store() {
    let temp = TempDir::new().unwrap();

    {
        let mut store = Store::init(temp.path()).unwrap();
        store
            .create_user(&NewUser::new("user_a", "alice", "alice@example.com"))
            .unwrap();
        store
            .create_user(&NewUser::new("user_b", "bob", "bob@example.com"))
            .unwrap();
        store.follow("user_a", "user_b").unwrap();
    }

    let store = Store::open(temp.path()).unwrap();
    let b = store.get_user("user_b").unwrap().unwrap();
    assert_eq!(b.followers, vec!["user_a"]);
    assert_eq!(b.followers_count, 1);
}

#[test]
fn test_open_nonexistent_store_fails() {
    let temp = TempDir::new().unwrap();
    assert!(Store::open(temp.path()).is_err());
}
