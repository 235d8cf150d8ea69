//! Profile picture collection operations on the store.

use crate::blob::BlobStore;
use crate::id::generate_picture_id;
use crate::store::{Store, StoreError};
use crate::types::{MAX_PICTURES, Picture, User};
use chrono::Utc;
use eyre::Result;

/// Extension trait for picture collection operations on Store.
pub trait PictureCollection {
    /// Upload an image and append it to the user's pictures.
    ///
    /// The first picture a user gets becomes primary.
    fn add_picture(
        &mut self,
        user_id: &str,
        bytes: &[u8],
        content_type: &str,
        blobs: &dyn BlobStore,
    ) -> Result<User>;

    /// Remove a picture. Removing the primary promotes the earliest remaining one.
    ///
    /// The blob is deleted after the record is updated; a failed blob delete
    /// is logged and does not fail the removal.
    fn remove_picture(&mut self, user_id: &str, picture_id: &str, blobs: &dyn BlobStore) -> Result<User>;

    /// Make one picture the primary.
    fn set_primary_picture(&mut self, user_id: &str, picture_id: &str) -> Result<User>;

    /// A user's pictures in display order.
    fn pictures(&self, user_id: &str) -> Result<Vec<Picture>>;
}

impl PictureCollection for Store {
    fn add_picture(
        &mut self,
        user_id: &str,
        bytes: &[u8],
        content_type: &str,
        blobs: &dyn BlobStore,
    ) -> Result<User> {
        self.config()
            .upload
            .check(bytes, content_type)
            .map_err(|e| eyre::eyre!(StoreError::Validation(e)))?;

        // Cheap early rejection; the authoritative check is in the transaction
        let user = self.require_user(user_id)?;
        if user.pictures.len() >= MAX_PICTURES {
            return Err(eyre::eyre!(StoreError::CapacityExceeded { max: MAX_PICTURES }));
        }

        let url = blobs
            .put(bytes, content_type)
            .map_err(|e| eyre::eyre!(StoreError::StorageFailure(e.to_string())))?;

        let now = Utc::now();
        let id = generate_picture_id(&url, now);

        let result = self.write("add picture", |w| {
            if !w.user_exists(user_id)? {
                return Err(eyre::eyre!(StoreError::UserNotFound(user_id.to_string())));
            }
            let count = w.picture_count(user_id)?;
            if count >= MAX_PICTURES {
                return Err(eyre::eyre!(StoreError::CapacityExceeded { max: MAX_PICTURES }));
            }

            let picture = Picture {
                id: id.clone(),
                url: url.clone(),
                is_primary: count == 0,
            };
            w.append_picture(user_id, &picture, now)?;
            w.touch(user_id, now)?;
            Ok(picture)
        });

        let picture = match result {
            Ok(picture) => picture,
            Err(e) => {
                // Nothing references the upload; give it back
                if let Err(delete_err) = blobs.delete(&url) {
                    log::warn!("Failed to delete orphaned upload {}: {}", url, delete_err);
                }
                return Err(e);
            }
        };

        log::info!(
            "Added picture {} to {}{}",
            picture.id,
            user_id,
            if picture.is_primary { " (primary)" } else { "" }
        );
        self.require_user(user_id)
    }

    fn remove_picture(&mut self, user_id: &str, picture_id: &str, blobs: &dyn BlobStore) -> Result<User> {
        let now = Utc::now();
        let removed = self.write("remove picture", |w| {
            if !w.user_exists(user_id)? {
                return Err(eyre::eyre!(StoreError::UserNotFound(user_id.to_string())));
            }
            let picture = w
                .picture(user_id, picture_id)?
                .ok_or_else(|| eyre::eyre!(StoreError::PictureNotFound(picture_id.to_string())))?;

            w.delete_picture(user_id, picture_id)?;
            if picture.is_primary
                && let Some(promoted) = w.promote_first(user_id)?
            {
                log::info!("Promoted picture {} to primary for {}", promoted, user_id);
            }
            w.touch(user_id, now)?;
            Ok(picture)
        })?;

        log::info!("Removed picture {} from {}", removed.id, user_id);

        if let Err(e) = blobs.delete(&removed.url) {
            log::warn!("Failed to delete blob {} for picture {}: {}", removed.url, removed.id, e);
        }

        self.require_user(user_id)
    }

    fn set_primary_picture(&mut self, user_id: &str, picture_id: &str) -> Result<User> {
        let now = Utc::now();
        self.write("set primary picture", |w| {
            if !w.user_exists(user_id)? {
                return Err(eyre::eyre!(StoreError::UserNotFound(user_id.to_string())));
            }
            let picture = w
                .picture(user_id, picture_id)?
                .ok_or_else(|| eyre::eyre!(StoreError::PictureNotFound(picture_id.to_string())))?;

            if !picture.is_primary {
                w.clear_primary(user_id)?;
                if !w.mark_primary(user_id, picture_id)? {
                    return Err(eyre::eyre!(StoreError::Conflict(format!(
                        "picture {} vanished while becoming primary",
                        picture_id
                    ))));
                }
                w.touch(user_id, now)?;
            }
            Ok(())
        })?;

        log::info!("Picture {} is now primary for {}", picture_id, user_id);
        self.require_user(user_id)
    }

    fn pictures(&self, user_id: &str) -> Result<Vec<Picture>> {
        Ok(self.require_user(user_id)?.pictures)
    }
}
