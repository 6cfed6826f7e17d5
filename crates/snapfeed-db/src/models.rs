//! Database row types that map directly to SQLite rows.
pub struct IdentityRow {
    pub uid: String,
    pub provider: String,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub provider_subject: Option<String>,
    pub created_at: String,
}

pub struct UserRow {
    pub uid: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub photo_url: Option<String>,
    pub bio: Option<String>,
    pub created_at: String,
}

pub struct PostRow {
    pub id: String,
    pub user_id: String,
    pub image_url: String,
    pub caption: Option<String>,
    pub created_at: String,
}

pub struct LikeRow {
    pub post_id: String,
    pub user_id: String,
}

/// `username` is the author's current username when the user record exists,
/// otherwise the value captured when the comment was written.
pub struct CommentRow {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    pub username: String,
    pub text: String,
    pub created_at: String,
}

pub struct NewComment<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub username: &'a str,
    pub text: &'a str,
    pub created_at: &'a str,
}
