//! Integration tests for edge cases.
//!
//! Tests concurrent writers, lock contention, half-written edges and
//! count drift.

mod common;

use common::{TestEnv, assert_code};
use rapport::maintenance::{self, PresentSide, RepairResult};
use rapport::{Config, FollowGraph, MAX_PICTURES, MemoryBlobStore, NewUser, PictureCollection, RetryPolicy, Store};
use rusqlite::Connection;
use std::sync::Arc;
use std::thread;

fn raw_connection(env: &TestEnv) -> Connection {
    Connection::open(Store::db_path(env.temp_dir.path())).unwrap()
}

// =============================================================================
// Empty Store Operations
// =============================================================================

#[test]
fn test_empty_store_users() {
    let env = TestEnv::new();
    assert!(env.store.users().unwrap().is_empty());
}

#[test]
fn test_empty_store_is_consistent() {
    let env = TestEnv::new();
    let report = maintenance::check(&env.store).unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.users, 0);
}

#[test]
fn test_user_with_no_edges() {
    let mut env = TestEnv::new();
    env.create_user("loner", "loner");

    let page = env.store.following("loner", Default::default()).unwrap();
    assert!(page.following.is_empty());
    assert_eq!(page.total, 0);

    let listing = env.store.list_all("loner").unwrap();
    assert_eq!(listing.len(), 1);
    assert!(!listing[0].is_following);
}

#[test]
fn test_opaque_ids_with_punctuation() {
    let mut env = TestEnv::new();
    env.create_user("auth0|5f1c", "pipe_user");
    env.create_user("google-oauth2:1234", "colon_user");

    env.follow("auth0|5f1c", "google-oauth2:1234");
    assert_eq!(env.user("google-oauth2:1234").followers, vec!["auth0|5f1c"]);
}

// =============================================================================
// Concurrent Writers
// =============================================================================

#[test]
fn test_concurrent_adds_never_exceed_capacity() {
    let mut env = TestEnv::new();
    env.create_user("u", "uploader");
    let root = env.temp_dir.path().to_path_buf();
    let blobs = Arc::new(MemoryBlobStore::new());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let root = root.clone();
            let blobs = Arc::clone(&blobs);
            thread::spawn(move || {
                let mut store = Store::open(&root).unwrap();
                let mut added = 0;
                for i in 0..3 {
                    let data = format!("thread-{}-{}", t, i);
                    if store
                        .add_picture("u", data.as_bytes(), "image/png", blobs.as_ref())
                        .is_ok()
                    {
                        added += 1;
                    }
                }
                added
            })
        })
        .collect();

    let added: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let user = env.user("u");
    assert!(user.pictures.len() <= MAX_PICTURES);
    assert_eq!(user.pictures.len(), added);
    env.assert_pictures_valid("u");
    // Uploads whose transaction lost were given back
    assert_eq!(blobs.len(), user.pictures.len());
}

#[test]
fn test_concurrent_follows_keep_counts_exact() {
    let mut env = TestEnv::new();
    env.create_user("star", "star");
    for t in 0..4 {
        env.create_user(&format!("fan_{}", t), &format!("fan{}", t));
    }
    let root = env.temp_dir.path().to_path_buf();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let root = root.clone();
            thread::spawn(move || {
                let mut store = Store::open(&root).unwrap();
                let actor = format!("fan_{}", t);
                for _ in 0..5 {
                    // Contention may surface as a conflict; the state must stay sound either way
                    let _ = store.follow(&actor, "star");
                    let _ = store.unfollow(&actor, "star");
                }
                let _ = store.follow(&actor, "star");
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    env.assert_counts_match();
    env.assert_mutually_consistent();
    assert!(maintenance::check(&env.store).unwrap().is_consistent());
}

// =============================================================================
// Lock Contention
// =============================================================================

#[test]
fn test_held_write_lock_surfaces_conflict() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");

    let config = Config {
        busy_timeout_ms: 10,
        retry: RetryPolicy {
            attempts: 2,
            backoff_ms: 1,
        },
        ..Config::default()
    };
    let mut store = Store::open_with_config(env.temp_dir.path(), config).unwrap();

    let blocker = raw_connection(&env);
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    assert_code(store.follow("user_a", "user_b"), "conflict");

    blocker.execute_batch("ROLLBACK").unwrap();

    // Nothing was half-applied, and the retry succeeds once the lock is gone
    assert_eq!(env.user("user_a").following_count, 0);
    store.follow("user_a", "user_b").unwrap();
    env.assert_mutually_consistent();
}

// =============================================================================
// Half-Written Edges
// =============================================================================

#[test]
fn test_follow_completes_half_written_edge() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");

    // Actor side only, as if a writer died between the two phases
    let raw = raw_connection(&env);
    raw.execute(
        "INSERT INTO following (owner_id, target_id, created_at) VALUES ('user_a', 'user_b', '2024-01-01T00:00:00Z')",
        [],
    )
    .unwrap();
    raw.execute("UPDATE users SET following_count = 1 WHERE id = 'user_a'", [])
        .unwrap();
    drop(raw);

    let report = maintenance::check(&env.store).unwrap();
    assert_eq!(report.half_edges.len(), 1);
    assert_eq!(report.half_edges[0].present, PresentSide::Following);

    // The edge exists from the actor's point of view
    assert_code(env.store.follow("user_a", "user_b"), "already_related");

    // ...and the missing side was written in the same transaction
    let b = env.user("user_b");
    assert_eq!(b.followers, vec!["user_a"]);
    assert_eq!(b.followers_count, 1);
    assert!(maintenance::check(&env.store).unwrap().is_consistent());
}

#[test]
fn test_unfollow_drops_follower_only_half() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");

    let raw = raw_connection(&env);
    raw.execute(
        "INSERT INTO followers (owner_id, follower_id, created_at) VALUES ('user_b', 'user_a', '2024-01-01T00:00:00Z')",
        [],
    )
    .unwrap();
    raw.execute("UPDATE users SET followers_count = 1 WHERE id = 'user_b'", [])
        .unwrap();
    drop(raw);

    assert_code(env.store.unfollow("user_a", "user_b"), "not_related");

    let b = env.user("user_b");
    assert!(b.followers.is_empty());
    assert_eq!(b.followers_count, 0);
    env.assert_mutually_consistent();
}

#[test]
fn test_follow_completes_follower_only_half() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");

    let raw = raw_connection(&env);
    raw.execute(
        "INSERT INTO followers (owner_id, follower_id, created_at) VALUES ('user_b', 'user_a', '2024-01-01T00:00:00Z')",
        [],
    )
    .unwrap();
    raw.execute("UPDATE users SET followers_count = 1 WHERE id = 'user_b'", [])
        .unwrap();
    drop(raw);

    env.follow("user_a", "user_b");

    // Counted once, not twice
    let b = env.user("user_b");
    assert_eq!(b.followers, vec!["user_a"]);
    assert_eq!(b.followers_count, 1);
    assert_eq!(env.user("user_a").following_count, 1);
    env.assert_mutually_consistent();
}

/// Insert a followers row for `owner <- follower` without moving any count.
fn inject_uncounted_follower(env: &TestEnv, owner: &str, follower: &str) {
    let raw = raw_connection(env);
    raw.execute(
        "INSERT INTO followers (owner_id, follower_id, created_at) VALUES (?1, ?2, '2024-01-01T00:00:00Z')",
        [owner, follower],
    )
    .unwrap();
}

#[test]
fn test_unfollow_drops_uncounted_follower_half() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");
    inject_uncounted_follower(&env, "user_b", "user_a");

    assert_code(env.store.unfollow("user_a", "user_b"), "not_related");

    let b = env.user("user_b");
    assert!(b.followers.is_empty());
    assert_eq!(b.followers_count, 0);
    assert!(maintenance::check(&env.store).unwrap().is_consistent());
}

#[test]
fn test_follow_over_uncounted_follower_half() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");
    inject_uncounted_follower(&env, "user_b", "user_a");

    env.follow("user_a", "user_b");

    let b = env.user("user_b");
    assert_eq!(b.followers, vec!["user_a"]);
    assert_eq!(b.followers_count, 1);
    env.assert_counts_match();
    assert!(maintenance::check(&env.store).unwrap().is_consistent());
}

#[test]
fn test_repair_drops_uncounted_follower_half() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");
    inject_uncounted_follower(&env, "user_b", "user_a");

    let report = maintenance::check(&env.store).unwrap();
    assert_eq!(report.half_edges.len(), 1);
    assert_eq!(report.half_edges[0].present, PresentSide::Followers);
    assert_eq!(report.count_drift.len(), 1);

    let result = maintenance::repair(&mut env.store).unwrap();
    assert_eq!(result.edges_dropped, 1);

    assert!(maintenance::check(&env.store).unwrap().is_consistent());
    assert_eq!(env.user("user_b").followers_count, 0);
}

// =============================================================================
// Count Drift
// =============================================================================

#[test]
fn test_check_and_repair_count_drift() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");
    env.follow("user_a", "user_b");

    let raw = raw_connection(&env);
    raw.execute("UPDATE users SET followers_count = 7 WHERE id = 'user_b'", [])
        .unwrap();
    drop(raw);

    let report = maintenance::check(&env.store).unwrap();
    assert_eq!(report.count_drift.len(), 1);
    assert_eq!(report.count_drift[0].user_id, "user_b");
    assert_eq!(report.count_drift[0].followers_count, 7);
    assert_eq!(report.count_drift[0].followers_actual, 1);

    let result = maintenance::repair(&mut env.store).unwrap();
    assert_eq!(result.counts_fixed, 1);
    assert_eq!(env.user("user_b").followers_count, 1);
    assert!(maintenance::check(&env.store).unwrap().is_consistent());
}

#[test]
fn test_repair_restores_missing_primary() {
    let mut env = TestEnv::new();
    env.create_user("u", "uploader");
    env.add_picture("u", b"p1");
    env.add_picture("u", b"p2");

    let raw = raw_connection(&env);
    raw.execute("UPDATE pictures SET is_primary = 0 WHERE owner_id = 'u'", [])
        .unwrap();
    drop(raw);

    let report = maintenance::check(&env.store).unwrap();
    assert_eq!(report.primary_violations, vec!["u"]);

    let result = maintenance::repair(&mut env.store).unwrap();
    assert_eq!(result.primaries_fixed, 1);
    let user = env.user("u");
    assert!(user.pictures[0].is_primary);
    env.assert_pictures_valid("u");
}

#[test]
fn test_repair_on_clean_store_is_noop() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");
    env.create_user("user_b", "bob");
    env.follow("user_a", "user_b");

    let result = maintenance::repair(&mut env.store).unwrap();
    assert_eq!(result, RepairResult::default());
}

#[test]
fn test_fresh_store_handle_sees_committed_writes() {
    let mut env = TestEnv::new();
    env.create_user("user_a", "alice");

    let mut other = Store::open(env.temp_dir.path()).unwrap();
    other
        .create_user(&NewUser::new("user_b", "bob", "bob@example.com"))
        .unwrap();
    other.follow("user_b", "user_a").unwrap();

    assert_eq!(env.user("user_a").followers, vec!["user_b"]);
}
