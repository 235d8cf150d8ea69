//! Consistency checks, repair and database maintenance.
//!
//! The follower/following counts are a cached projection of the sets. These
//! functions recompute them from the sets; they are diagnostics and repair
//! tools, never the normal read path.

use crate::storage::Storage;
use crate::store::Store;
use chrono::Utc;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which half of an edge is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentSide {
    /// Only the actor's following entry exists.
    Following,
    /// Only the target's followers entry exists.
    Followers,
}

/// An edge recorded on one side only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HalfEdge {
    pub actor: String,
    pub target: String,
    pub present: PresentSide,
}

/// A user whose cached counts disagree with its sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountDrift {
    pub user_id: String,
    pub followers_count: u64,
    pub followers_actual: u64,
    pub following_count: u64,
    pub following_actual: u64,
}

/// Result of a consistency check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub users: usize,
    pub edges: usize,
    pub pictures: usize,
    pub count_drift: Vec<CountDrift>,
    pub half_edges: Vec<HalfEdge>,
    /// Users whose pictures do not have exactly one primary
    pub primary_violations: Vec<String>,
    /// Users holding more pictures than allowed
    pub over_capacity: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.count_drift.is_empty()
            && self.half_edges.is_empty()
            && self.primary_violations.is_empty()
            && self.over_capacity.is_empty()
    }
}

/// Result of a repair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairResult {
    /// Following-only halves whose followers side was written
    pub edges_completed: usize,
    /// Followers-only halves that were dropped
    pub edges_dropped: usize,
    pub counts_fixed: usize,
    pub primaries_fixed: usize,
}

/// Compare every cached count and edge against the stored sets.
pub fn check(store: &Store) -> Result<ConsistencyReport> {
    let storage = store.storage();
    let mut report = ConsistencyReport {
        users: storage.count_users()?,
        edges: storage.count_edges()?,
        pictures: storage.count_pictures()?,
        ..Default::default()
    };

    for id in storage.user_ids()? {
        let Some(user) = storage.get_user(&id)? else {
            continue;
        };

        let followers_actual = user.followers.len() as u64;
        let following_actual = user.following.len() as u64;
        if user.followers_count != followers_actual || user.following_count != following_actual {
            report.count_drift.push(CountDrift {
                user_id: id.clone(),
                followers_count: user.followers_count,
                followers_actual,
                following_count: user.following_count,
                following_actual,
            });
        }

        let primaries = user.pictures.iter().filter(|p| p.is_primary).count();
        let expected = usize::from(!user.pictures.is_empty());
        if primaries != expected {
            report.primary_violations.push(id.clone());
        }
        if user.pictures.len() > crate::types::MAX_PICTURES {
            report.over_capacity.push(id);
        }
    }

    for (actor, target) in storage.orphan_following()? {
        report.half_edges.push(HalfEdge {
            actor,
            target,
            present: PresentSide::Following,
        });
    }
    for (target, actor) in storage.orphan_followers()? {
        report.half_edges.push(HalfEdge {
            actor,
            target,
            present: PresentSide::Followers,
        });
    }

    if !report.is_consistent() {
        log::warn!(
            "Consistency check found {} count drift(s), {} half edge(s), {} primary violation(s)",
            report.count_drift.len(),
            report.half_edges.len(),
            report.primary_violations.len()
        );
    }

    Ok(report)
}

/// Bring the store back to a consistent state.
///
/// Following-only halves are completed, since the actor's side is written
/// first. Followers-only halves are dropped. Counts are then recomputed from
/// the sets, and users with pictures but no primary get their earliest
/// picture promoted.
pub fn repair(store: &mut Store) -> Result<RepairResult> {
    let report = check(store)?;
    if report.is_consistent() {
        return Ok(RepairResult::default());
    }

    let now = Utc::now();
    let ids = store.storage().user_ids()?;

    let result = store.write("repair", |w| {
        let mut result = RepairResult::default();

        for half in &report.half_edges {
            match half.present {
                PresentSide::Following => {
                    if w.add_follower(&half.target, &half.actor, now)? {
                        result.edges_completed += 1;
                    }
                }
                PresentSide::Followers => {
                    if w.remove_follower(&half.target, &half.actor, now)? {
                        result.edges_dropped += 1;
                    }
                }
            }
        }

        for id in &ids {
            if w.recount(id)? {
                result.counts_fixed += 1;
            }
        }

        for id in &report.primary_violations {
            let Some(user) = w.user(id)? else {
                continue;
            };
            if !user.pictures.is_empty() && user.primary_picture().is_none() {
                w.promote_first(id)?;
                result.primaries_fixed += 1;
            }
        }

        Ok(result)
    })?;

    log::info!(
        "Repair completed {} edge(s), dropped {}, fixed {} count(s) and {} primary flag(s)",
        result.edges_completed,
        result.edges_dropped,
        result.counts_fixed,
        result.primaries_fixed
    );
    Ok(result)
}

/// Result of a vacuum operation.
#[derive(Debug)]
pub struct VacuumResult {
    /// Size of database before vacuum (bytes).
    pub size_before: u64,
    /// Size of database after vacuum (bytes).
    pub size_after: u64,
    pub users: usize,
    pub edges: usize,
    pub pictures: usize,
}

/// Vacuum the store at the given path.
pub fn vacuum(root: &Path) -> Result<VacuumResult> {
    let db_path = Storage::db_path(root);
    let size_before = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let store = Store::open(root).context("Failed to open store for vacuum")?;
    let storage = store.storage();
    storage.vacuum().context("Failed to run SQLite vacuum")?;

    let users = storage.count_users()?;
    let edges = storage.count_edges()?;
    let pictures = storage.count_pictures()?;

    let size_after = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    Ok(VacuumResult {
        size_before,
        size_after,
        users,
        edges,
        pictures,
    })
}
