//! Follow graph operations on the store.
//!
//! A follow edge lives in two documents: the actor's following set and the
//! target's followers set. It is written in two phases inside one immediate
//! transaction:
//!
//! 1. actor side: `following` insert/delete, `following_count` +/- 1
//! 2. target side: `followers` insert/delete, `followers_count` +/- 1
//!
//! Each phase only moves its count when its set actually changed, so either
//! phase can be replayed. A half-written edge left by an earlier writer is
//! completed (or dropped) by replaying the missing phase before the
//! precondition is evaluated.

use crate::storage::Writer;
use crate::store::{Store, StoreError};
use crate::types::{FollowingPage, PageRequest, Profile, UserListing};
use chrono::Utc;
use eyre::Result;
use std::collections::HashSet;

/// Extension trait for follow graph operations on Store.
pub trait FollowGraph {
    /// Make `actor_id` follow `target_id`. Returns the target as the actor now sees it.
    fn follow(&mut self, actor_id: &str, target_id: &str) -> Result<Profile>;

    /// Make `actor_id` stop following `target_id`. Returns the target as the actor now sees it.
    fn unfollow(&mut self, actor_id: &str, target_id: &str) -> Result<Profile>;

    /// One page of the users `id` follows, in the order the edges were made.
    fn following(&self, id: &str, page: PageRequest) -> Result<FollowingPage>;

    /// `target_id`'s public profile as seen by `viewer_id`.
    fn profile(&self, viewer_id: &str, target_id: &str) -> Result<Profile>;

    /// Every user, annotated with whether `viewer_id` follows them.
    fn list_all(&self, viewer_id: &str) -> Result<Vec<UserListing>>;
}

/// What the transaction found before deciding.
enum EdgeOutcome {
    Applied,
    Rejected(StoreError),
}

/// Resync both users' counts after touching a half-written edge.
fn recount_pair(w: &Writer<'_>, actor_id: &str, target_id: &str) -> Result<()> {
    for id in [actor_id, target_id] {
        if w.recount(id)? {
            log::warn!("Corrected drifted follow counts for {}", id);
        }
    }
    Ok(())
}

impl FollowGraph for Store {
    fn follow(&mut self, actor_id: &str, target_id: &str) -> Result<Profile> {
        // No self edges, whether or not the user exists
        if actor_id == target_id {
            return Err(eyre::eyre!(StoreError::SelfReference));
        }

        let now = Utc::now();
        let outcome = self.write_retrying("follow", |w| {
            for id in [actor_id, target_id] {
                if !w.user_exists(id)? {
                    return Err(eyre::eyre!(StoreError::UserNotFound(id.to_string())));
                }
            }

            let forward = w.has_following(actor_id, target_id)?;
            let backward = w.has_follower(target_id, actor_id)?;

            if forward {
                if !backward {
                    log::warn!(
                        "Completing half-written edge {} -> {}: follower side was missing",
                        actor_id,
                        target_id
                    );
                    w.add_follower(target_id, actor_id, now)?;
                    recount_pair(w, actor_id, target_id)?;
                }
                return Ok(EdgeOutcome::Rejected(StoreError::AlreadyRelated {
                    actor: actor_id.to_string(),
                    target: target_id.to_string(),
                }));
            }

            if backward {
                log::warn!(
                    "Found follower-only half of {} -> {}; completing it",
                    actor_id,
                    target_id
                );
            }

            w.add_following(actor_id, target_id, now)?;
            w.add_follower(target_id, actor_id, now)?;
            if backward {
                // The stray half may never have been counted
                recount_pair(w, actor_id, target_id)?;
            }

            if !(w.has_following(actor_id, target_id)? && w.has_follower(target_id, actor_id)?) {
                return Err(eyre::eyre!(StoreError::Conflict(format!(
                    "edge {} -> {} not visible on both sides after write",
                    actor_id, target_id
                ))));
            }
            Ok(EdgeOutcome::Applied)
        })?;

        if let EdgeOutcome::Rejected(e) = outcome {
            return Err(eyre::eyre!(e));
        }

        log::info!("{} followed {}", actor_id, target_id);
        self.profile(actor_id, target_id)
    }

    fn unfollow(&mut self, actor_id: &str, target_id: &str) -> Result<Profile> {
        if actor_id == target_id {
            return Err(eyre::eyre!(StoreError::SelfReference));
        }

        let now = Utc::now();
        let outcome = self.write_retrying("unfollow", |w| {
            for id in [actor_id, target_id] {
                if !w.user_exists(id)? {
                    return Err(eyre::eyre!(StoreError::UserNotFound(id.to_string())));
                }
            }

            let forward = w.has_following(actor_id, target_id)?;
            let backward = w.has_follower(target_id, actor_id)?;

            if !forward {
                if backward {
                    log::warn!(
                        "Dropping follower-only half of {} -> {}: following side was missing",
                        actor_id,
                        target_id
                    );
                    w.remove_follower(target_id, actor_id, now)?;
                    recount_pair(w, actor_id, target_id)?;
                }
                return Ok(EdgeOutcome::Rejected(StoreError::NotRelated {
                    actor: actor_id.to_string(),
                    target: target_id.to_string(),
                }));
            }

            w.remove_following(actor_id, target_id, now)?;
            w.remove_follower(target_id, actor_id, now)?;
            if !backward {
                recount_pair(w, actor_id, target_id)?;
            }

            if w.has_following(actor_id, target_id)? || w.has_follower(target_id, actor_id)? {
                return Err(eyre::eyre!(StoreError::Conflict(format!(
                    "edge {} -> {} still visible after removal",
                    actor_id, target_id
                ))));
            }
            Ok(EdgeOutcome::Applied)
        })?;

        if let EdgeOutcome::Rejected(e) = outcome {
            return Err(eyre::eyre!(e));
        }

        log::info!("{} unfollowed {}", actor_id, target_id);
        self.profile(actor_id, target_id)
    }

    fn following(&self, id: &str, page: PageRequest) -> Result<FollowingPage> {
        page.validate(self.config().paging.max_limit)
            .map_err(|e| eyre::eyre!(StoreError::Validation(e)))?;

        let user = self.require_user(id)?;
        let following = self.storage().following_page(id, page.offset(), page.limit)?;
        log::debug!(
            "Following page {} (limit {}) for {}: {} of {}",
            page.page,
            page.limit,
            id,
            following.len(),
            user.following_count
        );

        Ok(FollowingPage {
            following,
            total: user.following_count,
            page: page.page,
            limit: page.limit,
        })
    }

    fn profile(&self, viewer_id: &str, target_id: &str) -> Result<Profile> {
        // Viewer must exist even though only the target is returned
        self.require_user(viewer_id)?;
        let target = self.require_user(target_id)?;

        Ok(Profile {
            is_following: target.is_followed_by(viewer_id),
            user: target.summary(),
            pictures: target.pictures,
        })
    }

    fn list_all(&self, viewer_id: &str) -> Result<Vec<UserListing>> {
        let viewer = self.require_user(viewer_id)?;
        let following: HashSet<&str> = viewer.following.iter().map(String::as_str).collect();

        let listings = self
            .users()?
            .into_iter()
            .map(|user| UserListing {
                is_following: following.contains(user.id.as_str()),
                user,
            })
            .collect();

        Ok(listings)
    }
}
