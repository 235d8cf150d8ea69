//! Storage layer for rapport: SQLite user documents.
//!
//! A user document is spread over four tables. The following and followers
//! sets live in separate tables so a follow edge really touches two records;
//! every mutation goes through [`Storage::write`], which runs it inside a
//! `BEGIN IMMEDIATE` transaction.

use crate::types::{Picture, User, UserSummary};
use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Storage directory name.
pub const RAPPORT_DIR: &str = ".rapport";

/// SQLite database file.
pub const DB_FILE: &str = "rapport.db";

const SUMMARY_COLUMNS: &str = "u.id, u.username, u.email, u.followers_count, u.following_count, p.url";

/// Storage handle for reading/writing user documents.
pub struct Storage {
    root: PathBuf,
    db: Connection,
}

impl Storage {
    /// Initialize storage in the given directory.
    pub fn init(root: &Path, busy_timeout: Duration) -> Result<Self> {
        let dir = root.join(RAPPORT_DIR);
        fs::create_dir_all(&dir).context("Failed to create .rapport directory")?;

        Self::connect(root, busy_timeout)
    }

    /// Open existing storage.
    pub fn open(root: &Path, busy_timeout: Duration) -> Result<Self> {
        if !root.join(RAPPORT_DIR).exists() {
            eyre::bail!("No .rapport directory found. Run 'rp init' first.");
        }

        Self::connect(root, busy_timeout)
    }

    fn connect(root: &Path, busy_timeout: Duration) -> Result<Self> {
        let db_path = Self::db_path(root);
        let db = Connection::open(&db_path).context("Failed to open SQLite database")?;
        db.busy_timeout(busy_timeout).context("Failed to set busy timeout")?;

        // WAL lets readers proceed while another handle holds the write lock
        let _mode: String = db
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .context("Failed to enable WAL journal")?;

        let storage = Self {
            root: root.to_path_buf(),
            db,
        };
        storage.init_schema()?;

        Ok(storage)
    }

    /// Path of the database file under `root`.
    pub fn db_path(root: &Path) -> PathBuf {
        root.join(RAPPORT_DIR).join(DB_FILE)
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Initialize SQLite schema.
    fn init_schema(&self) -> Result<()> {
        self.db
            .execute_batch(
                r#"
                PRAGMA foreign_keys = ON;

                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    username TEXT NOT NULL UNIQUE,
                    email TEXT NOT NULL UNIQUE,
                    followers_count INTEGER NOT NULL DEFAULT 0 CHECK (followers_count >= 0),
                    following_count INTEGER NOT NULL DEFAULT 0 CHECK (following_count >= 0),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS following (
                    owner_id TEXT NOT NULL REFERENCES users(id),
                    target_id TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (owner_id, target_id),
                    CHECK (owner_id <> target_id)
                );

                CREATE TABLE IF NOT EXISTS followers (
                    owner_id TEXT NOT NULL REFERENCES users(id),
                    follower_id TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (owner_id, follower_id),
                    CHECK (owner_id <> follower_id)
                );

                CREATE TABLE IF NOT EXISTS pictures (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL REFERENCES users(id),
                    url TEXT NOT NULL,
                    is_primary INTEGER NOT NULL DEFAULT 0 CHECK (is_primary IN (0, 1)),
                    position INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_pictures_owner ON pictures(owner_id, position);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_pictures_one_primary
                    ON pictures(owner_id) WHERE is_primary = 1;
            "#,
            )
            .context("Failed to initialize schema")?;

        Ok(())
    }

    /// Run `f` inside an immediate (write-locked) transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`.
    pub fn write<T>(&mut self, f: impl FnOnce(&Writer<'_>) -> Result<T>) -> Result<T> {
        let tx = self
            .db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin write transaction")?;

        let value = f(&Writer { tx: &tx })?;

        tx.commit().context("Failed to commit write transaction")?;
        Ok(value)
    }

    /// Get a user document by ID.
    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        load_user(&self.db, id)
    }

    /// List public fields of every user, oldest first.
    pub fn list_users(&self) -> Result<Vec<UserSummary>> {
        let sql = format!(
            r#"
            SELECT {SUMMARY_COLUMNS}
            FROM users u
            LEFT JOIN pictures p ON p.owner_id = u.id AND p.is_primary = 1
            ORDER BY u.rowid ASC
            "#
        );

        let mut stmt = self.db.prepare(&sql)?;
        let users = stmt
            .query_map([], row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(users)
    }

    /// One window of a user's following set, in edge insertion order.
    pub fn following_page(&self, owner_id: &str, offset: u64, limit: u32) -> Result<Vec<UserSummary>> {
        let sql = format!(
            r#"
            SELECT {SUMMARY_COLUMNS}
            FROM following f
            JOIN users u ON u.id = f.target_id
            LEFT JOIN pictures p ON p.owner_id = u.id AND p.is_primary = 1
            WHERE f.owner_id = ?
            ORDER BY f.rowid ASC
            LIMIT ? OFFSET ?
            "#
        );

        let mut stmt = self.db.prepare(&sql)?;
        let page = stmt
            .query_map(params![owner_id, limit as i64, offset as i64], row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(page)
    }

    /// Ids of every user, oldest first.
    pub fn user_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .db
            .prepare("SELECT id FROM users ORDER BY rowid ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Edges present on the follower side only: (owner, follower).
    pub fn orphan_followers(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.db.prepare(
            r#"
            SELECT fr.owner_id, fr.follower_id FROM followers fr
            WHERE NOT EXISTS (
                SELECT 1 FROM following fg
                WHERE fg.owner_id = fr.follower_id AND fg.target_id = fr.owner_id
            )
            ORDER BY fr.rowid
            "#,
        )?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs)
    }

    /// Edges present on the following side only: (owner, target).
    pub fn orphan_following(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.db.prepare(
            r#"
            SELECT fg.owner_id, fg.target_id FROM following fg
            WHERE NOT EXISTS (
                SELECT 1 FROM followers fr
                WHERE fr.owner_id = fg.target_id AND fr.follower_id = fg.owner_id
            )
            ORDER BY fg.rowid
            "#,
        )?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pairs)
    }

    /// Count all users.
    pub fn count_users(&self) -> Result<usize> {
        let count: i64 = self.db.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Count all follow edges (following side).
    pub fn count_edges(&self) -> Result<usize> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM following", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Count all pictures.
    pub fn count_pictures(&self) -> Result<usize> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM pictures", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Run SQLite VACUUM.
    pub fn vacuum(&self) -> Result<()> {
        self.db.execute_batch("VACUUM").context("VACUUM failed")?;
        Ok(())
    }
}

/// Document-level mutation primitives, only reachable inside [`Storage::write`].
pub struct Writer<'a> {
    tx: &'a Connection,
}

impl Writer<'_> {
    /// Load a user document inside the transaction.
    pub fn user(&self, id: &str) -> Result<Option<User>> {
        load_user(self.tx, id)
    }

    /// Check if a user exists.
    pub fn user_exists(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .tx
            .query_row("SELECT 1 FROM users WHERE id = ?", params![id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Id of the user holding `username`, if any.
    pub fn find_by_username(&self, username: &str) -> Result<Option<String>> {
        Ok(self
            .tx
            .query_row("SELECT id FROM users WHERE username = ?", params![username], |row| {
                row.get(0)
            })
            .optional()?)
    }

    /// Id of the user holding `email`, if any.
    pub fn find_by_email(&self, email: &str) -> Result<Option<String>> {
        Ok(self
            .tx
            .query_row("SELECT id FROM users WHERE email = ?", params![email], |row| row.get(0))
            .optional()?)
    }

    /// Insert a fresh user document (no edges, no pictures).
    pub fn insert_user(&self, user: &User) -> Result<()> {
        self.tx.execute(
            r#"
            INSERT INTO users (id, username, email, followers_count, following_count, created_at, updated_at)
            VALUES (?, ?, ?, 0, 0, ?, ?)
            "#,
            params![
                user.id,
                user.username,
                user.email,
                user.created_at.to_rfc3339(),
                user.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Bump a user's `updated_at`.
    pub fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.tx
            .execute("UPDATE users SET updated_at = ? WHERE id = ?", params![now.to_rfc3339(), id])?;
        Ok(())
    }

    /// Check if `target_id` is in `owner_id`'s following set.
    pub fn has_following(&self, owner_id: &str, target_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM following WHERE owner_id = ? AND target_id = ?",
                params![owner_id, target_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Check if `follower_id` is in `owner_id`'s followers set.
    pub fn has_follower(&self, owner_id: &str, follower_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM followers WHERE owner_id = ? AND follower_id = ?",
                params![owner_id, follower_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Add `target_id` to the following set; the count moves only if the set did.
    pub fn add_following(&self, owner_id: &str, target_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let inserted = self.tx.execute(
            "INSERT OR IGNORE INTO following (owner_id, target_id, created_at) VALUES (?, ?, ?)",
            params![owner_id, target_id, now.to_rfc3339()],
        )?;
        if inserted == 1 {
            self.tx.execute(
                "UPDATE users SET following_count = following_count + 1, updated_at = ? WHERE id = ?",
                params![now.to_rfc3339(), owner_id],
            )?;
        }
        Ok(inserted == 1)
    }

    /// Remove `target_id` from the following set; the count moves only if the set did.
    ///
    /// The count never goes below zero, even if it had drifted low.
    pub fn remove_following(&self, owner_id: &str, target_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let deleted = self.tx.execute(
            "DELETE FROM following WHERE owner_id = ? AND target_id = ?",
            params![owner_id, target_id],
        )?;
        if deleted == 1 {
            self.tx.execute(
                "UPDATE users SET following_count = MAX(following_count - 1, 0), updated_at = ? WHERE id = ?",
                params![now.to_rfc3339(), owner_id],
            )?;
        }
        Ok(deleted == 1)
    }

    /// Add `follower_id` to the followers set; the count moves only if the set did.
    pub fn add_follower(&self, owner_id: &str, follower_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let inserted = self.tx.execute(
            "INSERT OR IGNORE INTO followers (owner_id, follower_id, created_at) VALUES (?, ?, ?)",
            params![owner_id, follower_id, now.to_rfc3339()],
        )?;
        if inserted == 1 {
            self.tx.execute(
                "UPDATE users SET followers_count = followers_count + 1, updated_at = ? WHERE id = ?",
                params![now.to_rfc3339(), owner_id],
            )?;
        }
        Ok(inserted == 1)
    }

    /// Remove `follower_id` from the followers set; the count moves only if the set did.
    ///
    /// The count never goes below zero, even if it had drifted low.
    pub fn remove_follower(&self, owner_id: &str, follower_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let deleted = self.tx.execute(
            "DELETE FROM followers WHERE owner_id = ? AND follower_id = ?",
            params![owner_id, follower_id],
        )?;
        if deleted == 1 {
            self.tx.execute(
                "UPDATE users SET followers_count = MAX(followers_count - 1, 0), updated_at = ? WHERE id = ?",
                params![now.to_rfc3339(), owner_id],
            )?;
        }
        Ok(deleted == 1)
    }

    /// Overwrite both counts with the sizes of the sets.
    ///
    /// Returns true if either count changed.
    pub fn recount(&self, id: &str) -> Result<bool> {
        let changed = self.tx.execute(
            r#"
            UPDATE users SET
                followers_count = (SELECT COUNT(*) FROM followers WHERE owner_id = users.id),
                following_count = (SELECT COUNT(*) FROM following WHERE owner_id = users.id)
            WHERE id = ?
            AND (
                followers_count <> (SELECT COUNT(*) FROM followers WHERE owner_id = users.id)
                OR following_count <> (SELECT COUNT(*) FROM following WHERE owner_id = users.id)
            )
            "#,
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Number of pictures a user holds.
    pub fn picture_count(&self, owner_id: &str) -> Result<usize> {
        let count: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM pictures WHERE owner_id = ?",
            params![owner_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Find one of a user's pictures.
    pub fn picture(&self, owner_id: &str, picture_id: &str) -> Result<Option<Picture>> {
        Ok(self
            .tx
            .query_row(
                "SELECT id, url, is_primary FROM pictures WHERE owner_id = ? AND id = ?",
                params![owner_id, picture_id],
                row_to_picture,
            )
            .optional()?)
    }

    /// Append a picture after the user's last one.
    pub fn append_picture(&self, owner_id: &str, picture: &Picture, now: DateTime<Utc>) -> Result<()> {
        self.tx.execute(
            r#"
            INSERT INTO pictures (id, owner_id, url, is_primary, position, created_at)
            VALUES (?1, ?2, ?3, ?4,
                (SELECT COALESCE(MAX(position), 0) + 1 FROM pictures WHERE owner_id = ?2),
                ?5)
            "#,
            params![picture.id, owner_id, picture.url, picture.is_primary, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Delete one picture row.
    pub fn delete_picture(&self, owner_id: &str, picture_id: &str) -> Result<bool> {
        let deleted = self.tx.execute(
            "DELETE FROM pictures WHERE owner_id = ? AND id = ?",
            params![owner_id, picture_id],
        )?;
        Ok(deleted == 1)
    }

    /// Clear the primary flag on whichever picture holds it.
    pub fn clear_primary(&self, owner_id: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE pictures SET is_primary = 0 WHERE owner_id = ? AND is_primary = 1",
            params![owner_id],
        )?;
        Ok(())
    }

    /// Mark one picture primary. The caller clears the previous one first.
    pub fn mark_primary(&self, owner_id: &str, picture_id: &str) -> Result<bool> {
        let updated = self.tx.execute(
            "UPDATE pictures SET is_primary = 1 WHERE owner_id = ? AND id = ?",
            params![owner_id, picture_id],
        )?;
        Ok(updated == 1)
    }

    /// Mark the earliest picture primary, returning its id.
    pub fn promote_first(&self, owner_id: &str) -> Result<Option<String>> {
        let first: Option<String> = self
            .tx
            .query_row(
                "SELECT id FROM pictures WHERE owner_id = ? ORDER BY position ASC LIMIT 1",
                params![owner_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = &first {
            self.mark_primary(owner_id, id)?;
        }
        Ok(first)
    }
}

/// Load a full user document.
fn load_user(conn: &Connection, id: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            r#"
            SELECT id, username, email, followers_count, following_count, created_at, updated_at
            FROM users WHERE id = ?
            "#,
            params![id],
            |row| {
                let created_at: String = row.get(5)?;
                let updated_at: String = row.get(6)?;
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    email: row.get(2)?,
                    pictures: vec![],
                    following: vec![],
                    followers: vec![],
                    followers_count: count_column(row, 3)?,
                    following_count: count_column(row, 4)?,
                    created_at: parse_timestamp(&created_at),
                    updated_at: parse_timestamp(&updated_at),
                })
            },
        )
        .optional()?;

    let Some(mut user) = user else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT id, url, is_primary FROM pictures WHERE owner_id = ? ORDER BY position ASC")?;
    user.pictures = stmt
        .query_map(params![id], row_to_picture)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare("SELECT target_id FROM following WHERE owner_id = ? ORDER BY rowid ASC")?;
    user.following = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut stmt = conn.prepare("SELECT follower_id FROM followers WHERE owner_id = ? ORDER BY rowid ASC")?;
    user.followers = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    Ok(Some(user))
}

fn row_to_picture(row: &Row) -> rusqlite::Result<Picture> {
    Ok(Picture {
        id: row.get(0)?,
        url: row.get(1)?,
        is_primary: row.get(2)?,
    })
}

fn row_to_summary(row: &Row) -> rusqlite::Result<UserSummary> {
    Ok(UserSummary {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        followers_count: count_column(row, 3)?,
        following_count: count_column(row, 4)?,
        primary_picture: row.get(5)?,
    })
}

fn count_column(row: &Row, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    Ok(value.max(0) as u64)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
