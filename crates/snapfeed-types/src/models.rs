use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A signed-in principal as issued by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

/// Public profile of a user, including the follow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub uid: String,
    pub username: String,
    pub full_name: Option<String>,
    pub photo_url: Option<String>,
    pub bio: Option<String>,
    pub followers: Vec<String>,
    pub following: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Author fields joined onto a post at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorSummary {
    pub uid: String,
    pub username: String,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A post as handed to clients: stored fields plus the joined author.
///
/// `user` is `None` only when the referenced author record is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedPost {
    pub id: String,
    pub user: Option<AuthorSummary>,
    pub image_url: String,
    pub caption: Option<String>,
    pub likes: Vec<String>,
    pub comments: Vec<Comment>,
    pub created_at: DateTime<Utc>,
}
