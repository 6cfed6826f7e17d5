//! Feed assembly: stored posts joined with their authors, likes and comments.
//!
//! Every listing goes through [`assemble`], which batch-fetches the distinct
//! authors, the likes and the comments of a page in one query each.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::warn;

use snapfeed_db::Database;
use snapfeed_db::models::PostRow;
use snapfeed_types::models::{AuthorSummary, Comment, EnrichedPost};

pub const DEFAULT_FEED_LIMIT: u32 = 10;
pub const MAX_FEED_LIMIT: u32 = 50;

/// The `limit` most recent posts, newest first.
pub fn list_latest(db: &Database, limit: u32) -> Result<Vec<EnrichedPost>> {
    let rows = db.get_latest_posts(limit)?;
    assemble(db, rows)
}

/// All posts by one author, newest first.
pub fn list_by_user(db: &Database, user_id: &str) -> Result<Vec<EnrichedPost>> {
    let rows = db.get_posts_by_user(user_id)?;
    assemble(db, rows)
}

pub fn get_by_id(db: &Database, post_id: &str) -> Result<Option<EnrichedPost>> {
    match db.get_post(post_id)? {
        Some(row) => Ok(assemble(db, vec![row])?.pop()),
        None => Ok(None),
    }
}

fn assemble(db: &Database, rows: Vec<PostRow>) -> Result<Vec<EnrichedPost>> {
    if rows.is_empty() {
        return Ok(vec![]);
    }

    let post_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();

    let mut author_ids: Vec<String> = rows.iter().map(|r| r.user_id.clone()).collect();
    author_ids.sort();
    author_ids.dedup();

    let authors: HashMap<String, AuthorSummary> = db
        .get_users_by_ids(&author_ids)?
        .into_iter()
        .map(|user| {
            let summary = AuthorSummary {
                uid: user.uid.clone(),
                username: user.username.unwrap_or_else(|| "unknown".to_string()),
                photo_url: user.photo_url,
            };
            (user.uid, summary)
        })
        .collect();

    let mut likes: HashMap<String, Vec<String>> = HashMap::new();
    for like in db.get_likes_for_posts(&post_ids)? {
        likes.entry(like.post_id).or_default().push(like.user_id);
    }

    let mut comments: HashMap<String, Vec<Comment>> = HashMap::new();
    for row in db.get_comments_for_posts(&post_ids)? {
        let created_at = parse_timestamp(&row.created_at, &row.id);
        comments.entry(row.post_id).or_default().push(Comment {
            id: row.id,
            user_id: row.user_id,
            username: row.username,
            text: row.text,
            created_at,
        });
    }

    let posts = rows
        .into_iter()
        .map(|row| {
            let user = authors.get(&row.user_id).cloned();
            if user.is_none() {
                warn!("Post '{}' references missing user '{}'", row.id, row.user_id);
            }

            EnrichedPost {
                created_at: parse_timestamp(&row.created_at, &row.id),
                likes: likes.remove(&row.id).unwrap_or_default(),
                comments: comments.remove(&row.id).unwrap_or_default(),
                id: row.id,
                user,
                image_url: row.image_url,
                caption: row.caption,
            }
        })
        .collect();

    Ok(posts)
}

/// Parse a stored timestamp. Accepts RFC 3339 and SQLite's `datetime('now')` format.
pub(crate) fn parse_timestamp(raw: &str, record_id: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on '{}': {}", raw, record_id, e);
            DateTime::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapfeed_db::ProfileUpsert;
    use snapfeed_db::models::NewComment;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.reserve_username(
            "ada",
            &ProfileUpsert {
                uid: "uid1".into(),
                photo_url: Some("https://img/ada.png".into()),
                ..Default::default()
            },
        )
        .unwrap();
        db.reserve_username("grace", &ProfileUpsert { uid: "uid2".into(), ..Default::default() })
            .unwrap();
        db
    }

    #[test]
    fn latest_returns_newest_first_with_limit() {
        let db = seeded();
        db.insert_post("t1", "uid1", "https://img/1.png", None).unwrap();
        db.insert_post("t2", "uid2", "https://img/2.png", None).unwrap();
        db.insert_post("t3", "uid1", "https://img/3.png", Some("third")).unwrap();

        let posts = list_latest(&db, 2).unwrap();
        let ids: Vec<&str> = posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t2"]);

        let author = posts[0].user.as_ref().unwrap();
        assert_eq!(author.username, "ada");
        assert_eq!(author.photo_url.as_deref(), Some("https://img/ada.png"));
        assert_eq!(posts[1].user.as_ref().unwrap().username, "grace");
        assert!(posts[0].created_at >= posts[1].created_at);
    }

    #[test]
    fn by_user_shares_one_author() {
        let db = seeded();
        db.insert_post("a", "uid1", "https://img/a.png", None).unwrap();
        db.insert_post("b", "uid2", "https://img/b.png", None).unwrap();
        db.insert_post("c", "uid1", "https://img/c.png", None).unwrap();

        let posts = list_by_user(&db, "uid1").unwrap();
        let ids: Vec<&str> = posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert!(posts.iter().all(|p| p.user.as_ref().unwrap().uid == "uid1"));

        assert!(list_by_user(&db, "nobody").unwrap().is_empty());
    }

    #[test]
    fn get_by_id_joins_likes_and_comments() {
        let db = seeded();
        db.insert_post("p1", "uid1", "https://img/1.png", Some("hello")).unwrap();
        db.set_like("p1", "uid2", true).unwrap();
        db.append_comment(
            "p1",
            &NewComment {
                id: "c1",
                user_id: "uid2",
                username: "grace",
                text: "nice",
                created_at: "2026-01-01T00:00:00.000Z",
            },
        )
        .unwrap();

        let post = get_by_id(&db, "p1").unwrap().unwrap();
        assert_eq!(post.caption.as_deref(), Some("hello"));
        assert_eq!(post.likes, vec!["uid2"]);
        assert_eq!(post.comments.len(), 1);
        assert_eq!(post.comments[0].username, "grace");
        assert_eq!(post.comments[0].created_at.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn get_by_id_on_missing_post_is_absent() {
        let db = seeded();
        assert!(get_by_id(&db, "does-not-exist").unwrap().is_none());
    }

    #[test]
    fn parses_both_timestamp_formats() {
        let iso = parse_timestamp("2026-03-04T05:06:07.123Z", "x");
        assert_eq!(iso.timestamp_millis() % 1000, 123);

        let sqlite = parse_timestamp("2026-03-04 05:06:07", "x");
        assert_eq!(sqlite.to_rfc3339(), "2026-03-04T05:06:07+00:00");
    }

    #[test]
    fn by_user_handles_very_prolific_authors() {
        let db = seeded();
        let count = snapfeed_db::queries::MAX_IN_PARAMS + 10;
        for i in 0..count {
            db.insert_post(&format!("p{i}"), "uid1", "https://img/p.png", None).unwrap();
        }
        db.set_like("p0", "uid2", true).unwrap();

        let posts = list_by_user(&db, "uid1").unwrap();
        assert_eq!(posts.len(), count);
        assert!(posts.iter().all(|p| p.user.is_some()));

        let oldest = posts.iter().find(|p| p.id == "p0").unwrap();
        assert_eq!(oldest.likes, vec!["uid2"]);
    }
}
