//! IPC protocol types for daemon communication.

use crate::maintenance::ConsistencyReport;
use crate::store::StoreError;
use crate::types::{FollowingPage, Profile, User, UserListing};
use serde::{Deserialize, Serialize};

/// Request sent from client to daemon.
///
/// `credential` is resolved to a user id by the daemon's verifier; the
/// engines only ever see that id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Create the user the credential belongs to.
    CreateUser {
        credential: String,
        username: String,
        email: String,
    },

    /// List every user relative to the caller.
    ListUsers { credential: String },

    /// Get a user's profile.
    GetProfile { credential: String, target_id: String },

    /// Follow a user.
    Follow { credential: String, target_id: String },

    /// Unfollow a user.
    Unfollow { credential: String, target_id: String },

    /// Page through the users someone follows.
    GetFollowing {
        credential: String,
        user_id: String,
        page: Option<u32>,
        limit: Option<u32>,
    },

    /// Upload a picture for the caller. `data` travels as base64.
    AddPicture {
        credential: String,
        content_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Remove one of the caller's pictures.
    RemovePicture { credential: String, picture_id: String },

    /// Make one of the caller's pictures primary.
    SetPrimaryPicture { credential: String, picture_id: String },

    /// Run a consistency check. Any verified credential may ask.
    Check { credential: String },

    /// Shutdown the daemon.
    Shutdown,

    /// Ping to check if daemon is alive.
    Ping,
}

/// Binary payloads as standard base64 strings.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Response sent from daemon to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Full user document.
    User { user: User },

    /// Listing of users.
    Users { users: Vec<UserListing> },

    /// Single profile.
    Profile { profile: Profile },

    /// One page of a following list.
    Following { page: FollowingPage },

    /// Consistency check result.
    Report { report: ConsistencyReport },

    /// Operation succeeded.
    Ok,

    /// Pong response to ping.
    Pong,

    /// Error response with a stable code.
    Error { code: String, message: String },
}

impl Response {
    /// Create an error response.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Map a failed operation to a response without leaking internals.
    pub fn from_report(report: &eyre::Report) -> Self {
        match StoreError::find(report) {
            Some(e) => Self::error(e.code(), e.to_string()),
            None => {
                log::error!("Internal error: {:?}", report);
                Self::error("internal", "internal error")
            }
        }
    }
}
