//! Core data types for the rapport user graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of pictures a user may hold.
pub const MAX_PICTURES: usize = 5;

/// A user document with its graph and picture state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    /// Stable external identity id (from the credential verifier)
    pub id: String,

    /// Unique display name
    pub username: String,

    /// Unique contact address
    pub email: String,

    /// Pictures in display order
    #[serde(default)]
    pub pictures: Vec<Picture>,

    /// Ids this user follows, in edge insertion order
    #[serde(default)]
    pub following: Vec<String>,

    /// Ids following this user, in edge insertion order
    #[serde(default)]
    pub followers: Vec<String>,

    pub followers_count: u64,

    pub following_count: u64,

    /// When created
    pub created_at: DateTime<Utc>,

    /// Last modification
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// The picture currently marked primary, if any.
    pub fn primary_picture(&self) -> Option<&Picture> {
        self.pictures.iter().find(|p| p.is_primary)
    }

    /// Check if this user follows `id`.
    pub fn follows(&self, id: &str) -> bool {
        self.following.iter().any(|f| f == id)
    }

    /// Check if `id` follows this user.
    pub fn is_followed_by(&self, id: &str) -> bool {
        self.followers.iter().any(|f| f == id)
    }

    /// Public fields only.
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
            followers_count: self.followers_count,
            following_count: self.following_count,
            primary_picture: self.primary_picture().map(|p| p.url.clone()),
        }
    }
}

/// A profile picture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Picture {
    /// "pic-" + 10 hex chars
    pub id: String,

    /// Retrieval URL handed out by the blob store
    pub url: String,

    #[serde(default)]
    pub is_primary: bool,
}

/// Public fields of a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub email: String,
    pub followers_count: u64,
    pub following_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_picture: Option<String>,
}

/// A user as seen by another user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    #[serde(flatten)]
    pub user: UserSummary,

    #[serde(default)]
    pub pictures: Vec<Picture>,

    /// Whether the viewer follows this user
    pub is_following: bool,
}

/// A listing entry annotated relative to the viewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserListing {
    #[serde(flatten)]
    pub user: UserSummary,

    pub is_following: bool,
}

/// One page of a following list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FollowingPage {
    pub following: Vec<UserSummary>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

/// Pagination window, 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

impl PageRequest {
    /// Create a page request.
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }

    /// Row offset of the first entry in this page.
    pub fn offset(&self) -> u64 {
        (self.page.saturating_sub(1) as u64) * self.limit as u64
    }

    /// Validate against a maximum page size.
    pub fn validate(&self, max_limit: u32) -> Result<(), ValidationError> {
        if self.page == 0 {
            return Err(ValidationError::InvalidPage);
        }
        if self.limit == 0 || self.limit > max_limit {
            return Err(ValidationError::InvalidLimit(max_limit));
        }
        Ok(())
    }
}

/// Fields required to create a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewUser {
    pub id: String,
    pub username: String,
    pub email: String,
}

impl NewUser {
    pub fn new(id: impl Into<String>, username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            email: email.into(),
        }
    }

    /// Validate the user's fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        // Id: opaque, but non-empty and printable
        if self.id.is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.id.len() > 128 || self.id.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(ValidationError::InvalidId);
        }

        // Username: 3-20 of [A-Za-z0-9_]
        let len = self.username.chars().count();
        if !(3..=20).contains(&len) {
            return Err(ValidationError::UsernameLength);
        }
        if !self.username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ValidationError::UsernameCharacters);
        }

        if !is_valid_email(&self.email) {
            return Err(ValidationError::InvalidEmail);
        }

        Ok(())
    }
}

fn is_valid_email(email: &str) -> bool {
    if email.len() > 254 || email.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    // Domain needs a dot with labels on both sides
    domain.split('.').count() >= 2 && domain.split('.').all(|label| !label.is_empty())
}

/// Validation errors for user input.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyId,
    InvalidId,
    UsernameLength,
    UsernameCharacters,
    InvalidEmail,
    InvalidPage,
    InvalidLimit(u32),
    EmptyUpload,
    UploadTooLarge { size: usize, max: usize },
    UnsupportedContentType(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyId => write!(f, "user id cannot be empty"),
            ValidationError::InvalidId => {
                write!(f, "user id must be at most 128 printable characters without spaces")
            }
            ValidationError::UsernameLength => write!(f, "username must be 3-20 characters"),
            ValidationError::UsernameCharacters => {
                write!(f, "username can only contain letters, numbers, and underscores")
            }
            ValidationError::InvalidEmail => write!(f, "email address is not valid"),
            ValidationError::InvalidPage => write!(f, "page must be at least 1"),
            ValidationError::InvalidLimit(max) => write!(f, "limit must be between 1 and {}", max),
            ValidationError::EmptyUpload => write!(f, "no image data provided"),
            ValidationError::UploadTooLarge { size, max } => {
                write!(f, "image of {} bytes exceeds the {} byte limit", size, max)
            }
            ValidationError::UnsupportedContentType(ct) => {
                write!(f, "unsupported content type '{}'", ct)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_user() -> User {
        let now = Utc::now();
        User {
            id: "user_1".to_string(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            pictures: vec![
                Picture {
                    id: "pic-0000000001".to_string(),
                    url: "file:///a.png".to_string(),
                    is_primary: false,
                },
                Picture {
                    id: "pic-0000000002".to_string(),
                    url: "file:///b.png".to_string(),
                    is_primary: true,
                },
            ],
            following: vec!["user_2".to_string()],
            followers: vec!["user_3".to_string()],
            followers_count: 1,
            following_count: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_new_user_validation_valid() {
        let user = NewUser::new("user_2abc", "alice_01", "alice@example.com");
        assert!(user.validate().is_ok());
    }

    #[test]
    fn test_new_user_validation_empty_id() {
        let user = NewUser::new("", "alice", "alice@example.com");
        assert_eq!(user.validate(), Err(ValidationError::EmptyId));
    }

    #[test]
    fn test_new_user_validation_id_with_space() {
        let user = NewUser::new("user 1", "alice", "alice@example.com");
        assert_eq!(user.validate(), Err(ValidationError::InvalidId));
    }

    #[test]
    fn test_new_user_validation_username_length() {
        assert_eq!(
            NewUser::new("u1", "ab", "a@example.com").validate(),
            Err(ValidationError::UsernameLength)
        );
        assert_eq!(
            NewUser::new("u1", &"a".repeat(21), "a@example.com").validate(),
            Err(ValidationError::UsernameLength)
        );
    }

    #[test]
    fn test_new_user_validation_username_characters() {
        let user = NewUser::new("u1", "alice-b", "alice@example.com");
        assert_eq!(user.validate(), Err(ValidationError::UsernameCharacters));
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("no-at-sign.com"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("a@localhost"));
        assert!(!is_valid_email("a@b@c.com"));
        assert!(!is_valid_email("a@example..com"));
        assert!(!is_valid_email("a b@example.com"));
    }

    #[test]
    fn test_page_request_defaults() {
        let page = PageRequest::default();
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, 20);
    }

    #[test]
    fn test_page_request_offset() {
        assert_eq!(PageRequest::new(1, 20).offset(), 0);
        assert_eq!(PageRequest::new(2, 1).offset(), 1);
        assert_eq!(PageRequest::new(4, 25).offset(), 75);
    }

    #[test]
    fn test_page_request_validation() {
        assert_eq!(PageRequest::new(0, 10).validate(100), Err(ValidationError::InvalidPage));
        assert_eq!(
            PageRequest::new(1, 0).validate(100),
            Err(ValidationError::InvalidLimit(100))
        );
        assert_eq!(
            PageRequest::new(1, 101).validate(100),
            Err(ValidationError::InvalidLimit(100))
        );
        assert!(PageRequest::new(1, 100).validate(100).is_ok());
    }

    #[test]
    fn test_user_summary_uses_primary_picture() {
        let user = make_user();
        let summary = user.summary();
        assert_eq!(summary.primary_picture, Some("file:///b.png".to_string()));
        assert_eq!(summary.followers_count, 1);
    }

    #[test]
    fn test_user_membership_helpers() {
        let user = make_user();
        assert!(user.follows("user_2"));
        assert!(!user.follows("user_3"));
        assert!(user.is_followed_by("user_3"));
    }

    #[test]
    fn test_profile_serializes_flat() {
        let user = make_user();
        let profile = Profile {
            user: user.summary(),
            pictures: user.pictures.clone(),
            is_following: true,
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["username"], "alice");
        assert_eq!(json["is_following"], true);
        assert_eq!(json["pictures"].as_array().unwrap().len(), 2);
    }
}
