use crate::Database;
use crate::models::{CommentRow, IdentityRow, LikeRow, NewComment, PostRow, UserRow};
use anyhow::Result;
use rusqlite::{Connection, Row, ToSql};

const USER_COLUMNS: &str = "uid, username, email, full_name, photo_url, bio, created_at";
const POST_COLUMNS: &str = "id, user_id, image_url, caption, created_at";
const IDENTITY_COLUMNS: &str = "uid, provider, email, password_hash, provider_subject, created_at";

/// Ids bound per `IN (...)` query; larger sets are fetched in chunks.
pub const MAX_IN_PARAMS: usize = 500;

impl Database {
    // -- Identities --

    pub fn get_password_identity(&self, email: &str) -> Result<Option<IdentityRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE provider = 'password' AND email = ?1"),
                [email],
                identity_from_row,
            )
            .optional()
        })
    }

    /// Look up the uid linked to an external provider subject, linking `new_uid`
    /// if the subject has never signed in before. Returns the linked uid.
    pub fn find_or_create_provider_identity(
        &self,
        provider: &str,
        subject: &str,
        email: Option<&str>,
        new_uid: &str,
    ) -> Result<String> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO identities (uid, provider, email, provider_subject) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(provider, provider_subject) DO NOTHING",
                rusqlite::params![new_uid, provider, email, subject],
            )?;

            let uid = conn.query_row(
                "SELECT uid FROM identities WHERE provider = ?1 AND provider_subject = ?2",
                [provider, subject],
                |row| row.get(0),
            )?;
            Ok(uid)
        })
    }

    // -- Users --

    pub fn get_user_by_id(&self, uid: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE uid = ?1"),
                [uid],
                user_from_row,
            )
            .optional()
        })
    }

    /// Batch-fetch user records. Unknown ids are skipped.
    pub fn get_users_by_ids(&self, uids: &[String]) -> Result<Vec<UserRow>> {
        if uids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            query_in(
                conn,
                uids,
                |params| format!("SELECT {USER_COLUMNS} FROM users WHERE uid IN ({params})"),
                user_from_row,
            )
        })
    }

    pub fn get_followers(&self, uid: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT follower_id FROM follows WHERE followee_id = ?1 ORDER BY created_at",
            )?;
            let ids = stmt
                .query_map([uid], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    pub fn get_following(&self, uid: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT followee_id FROM follows WHERE follower_id = ?1 ORDER BY created_at",
            )?;
            let ids = stmt
                .query_map([uid], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    /// Add or remove `follower -> followee`. Both directions are idempotent.
    /// Returns the followee's follower count, or `None` if the followee doesn't exist.
    pub fn set_follow(&self, follower_id: &str, followee_id: &str, follow: bool) -> Result<Option<usize>> {
        self.with_conn(|conn| {
            if !exists(conn, "SELECT 1 FROM users WHERE uid = ?1", followee_id)? {
                return Ok(None);
            }

            if follow {
                conn.execute(
                    "INSERT OR IGNORE INTO follows (follower_id, followee_id) VALUES (?1, ?2)",
                    [follower_id, followee_id],
                )?;
            } else {
                conn.execute(
                    "DELETE FROM follows WHERE follower_id = ?1 AND followee_id = ?2",
                    [follower_id, followee_id],
                )?;
            }

            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM follows WHERE followee_id = ?1",
                [followee_id],
                |row| row.get(0),
            )?;
            Ok(Some(count as usize))
        })
    }

    // -- Posts --

    pub fn insert_post(&self, id: &str, user_id: &str, image_url: &str, caption: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO posts (id, user_id, image_url, caption) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, user_id, image_url, caption],
            )?;
            Ok(())
        })
    }

    /// Newest posts first. Posts created within the same millisecond keep
    /// insertion order (newest first).
    pub fn get_latest_posts(&self, limit: u32) -> Result<Vec<PostRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {POST_COLUMNS} FROM posts ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map([limit], post_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_posts_by_user(&self, user_id: &str) -> Result<Vec<PostRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let rows = stmt
                .query_map([user_id], post_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_post(&self, id: &str) -> Result<Option<PostRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1"),
                [id],
                post_from_row,
            )
            .optional()
        })
    }

    // -- Likes --

    /// Add `user_id` to the post's like set, or remove it. Both are idempotent.
    /// Returns the resulting like count, or `None` if the post doesn't exist.
    pub fn set_like(&self, post_id: &str, user_id: &str, like: bool) -> Result<Option<usize>> {
        self.with_conn(|conn| {
            if !exists(conn, "SELECT 1 FROM posts WHERE id = ?1", post_id)? {
                return Ok(None);
            }

            if like {
                conn.execute(
                    "INSERT OR IGNORE INTO post_likes (post_id, user_id) VALUES (?1, ?2)",
                    [post_id, user_id],
                )?;
            } else {
                conn.execute(
                    "DELETE FROM post_likes WHERE post_id = ?1 AND user_id = ?2",
                    [post_id, user_id],
                )?;
            }

            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM post_likes WHERE post_id = ?1",
                [post_id],
                |row| row.get(0),
            )?;
            Ok(Some(count as usize))
        })
    }

    /// Batch-fetch likes for a set of post IDs.
    pub fn get_likes_for_posts(&self, post_ids: &[String]) -> Result<Vec<LikeRow>> {
        if post_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = |params: &str| {
                format!(
                    "SELECT post_id, user_id FROM post_likes WHERE post_id IN ({params}) ORDER BY created_at, rowid"
                )
            };
            query_in(conn, post_ids, sql, |row| {
                Ok(LikeRow {
                    post_id: row.get(0)?,
                    user_id: row.get(1)?,
                })
            })
        })
    }

    // -- Comments --

    /// Append a comment. Returns `false` if the post doesn't exist.
    pub fn append_comment(&self, post_id: &str, comment: &NewComment<'_>) -> Result<bool> {
        self.with_conn(|conn| {
            if !exists(conn, "SELECT 1 FROM posts WHERE id = ?1", post_id)? {
                return Ok(false);
            }

            conn.execute(
                "INSERT INTO comments (id, post_id, user_id, username, text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    comment.id,
                    post_id,
                    comment.user_id,
                    comment.username,
                    comment.text,
                    comment.created_at
                ],
            )?;
            Ok(true)
        })
    }

    /// Batch-fetch comments for a set of post IDs, in insertion order.
    pub fn get_comments_for_posts(&self, post_ids: &[String]) -> Result<Vec<CommentRow>> {
        if post_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            // Prefer the author's live username over the one captured at write time
            let sql = |params: &str| {
                format!(
                    "SELECT c.id, c.post_id, c.user_id, COALESCE(u.username, c.username), c.text, c.created_at
                     FROM comments c
                     LEFT JOIN users u ON c.user_id = u.uid
                     WHERE c.post_id IN ({params})
                     ORDER BY c.seq"
                )
            };
            query_in(conn, post_ids, sql, |row| {
                Ok(CommentRow {
                    id: row.get(0)?,
                    post_id: row.get(1)?,
                    user_id: row.get(2)?,
                    username: row.get(3)?,
                    text: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
        })
    }
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

/// Run `sql(placeholders)` once per chunk of `ids`. Rows for one id always
/// come from the same chunk, so per-id ordering is preserved.
fn query_in<T, S, F>(conn: &Connection, ids: &[String], sql: S, mut map: F) -> Result<Vec<T>>
where
    S: Fn(&str) -> String,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut rows = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(MAX_IN_PARAMS) {
        let mut stmt = conn.prepare(&sql(&placeholders(chunk.len())))?;
        let params: Vec<&dyn ToSql> = chunk.iter().map(|id| id as &dyn ToSql).collect();
        for row in stmt.query_map(params.as_slice(), &mut map)? {
            rows.push(row?);
        }
    }
    Ok(rows)
}

fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool> {
    Ok(conn.query_row(sql, [id], |_| Ok(())).optional()?.is_some())
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok(IdentityRow {
        uid: row.get(0)?,
        provider: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        provider_subject: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        uid: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        full_name: row.get(3)?,
        photo_url: row.get(4)?,
        bio: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<PostRow> {
    Ok(PostRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        image_url: row.get(2)?,
        caption: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProfileUpsert;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        for (uid, name) in [("uid1", "ada"), ("uid2", "grace")] {
            db.reserve_username(name, &ProfileUpsert { uid: uid.into(), ..Default::default() })
                .unwrap();
        }
        db.insert_post("p1", "uid1", "https://img/1.png", Some("first")).unwrap();
        db
    }

    fn like_count(db: &Database, post_id: &str) -> usize {
        db.get_likes_for_posts(&[post_id.to_string()]).unwrap().len()
    }

    #[test]
    fn like_twice_keeps_one_entry() {
        let db = seeded();
        assert_eq!(db.set_like("p1", "uid2", true).unwrap(), Some(1));
        assert_eq!(db.set_like("p1", "uid2", true).unwrap(), Some(1));
        assert_eq!(like_count(&db, "p1"), 1);
    }

    #[test]
    fn like_then_unlike_is_a_no_op() {
        let db = seeded();
        db.set_like("p1", "uid2", true).unwrap();
        assert_eq!(db.set_like("p1", "uid2", false).unwrap(), Some(0));
        assert_eq!(db.set_like("p1", "uid2", false).unwrap(), Some(0));
        assert_eq!(like_count(&db, "p1"), 0);
    }

    #[test]
    fn like_on_missing_post_reports_none() {
        let db = seeded();
        assert_eq!(db.set_like("nope", "uid2", true).unwrap(), None);
    }

    #[test]
    fn latest_posts_are_newest_first() {
        let db = seeded();
        db.insert_post("p2", "uid2", "https://img/2.png", None).unwrap();
        db.insert_post("p3", "uid1", "https://img/3.png", None).unwrap();

        let ids: Vec<String> = db.get_latest_posts(2).unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["p3", "p2"]);

        let by_user: Vec<String> =
            db.get_posts_by_user("uid1").unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(by_user, vec!["p3", "p1"]);
    }

    #[test]
    fn comments_keep_insertion_order_and_live_username() {
        let db = seeded();
        for (id, text) in [("c1", "one"), ("c2", "two")] {
            let comment = NewComment {
                id,
                user_id: "uid2",
                username: "grace",
                text,
                created_at: "2026-01-01T00:00:00.000Z",
            };
            assert!(db.append_comment("p1", &comment).unwrap());
        }

        db.reserve_username("hopper", &ProfileUpsert { uid: "uid2".into(), ..Default::default() })
            .unwrap();

        let comments = db.get_comments_for_posts(&["p1".to_string()]).unwrap();
        let texts: Vec<&str> = comments.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert!(comments.iter().all(|c| c.username == "hopper"));
    }

    #[test]
    fn follow_is_a_set() {
        let db = seeded();
        assert_eq!(db.set_follow("uid2", "uid1", true).unwrap(), Some(1));
        assert_eq!(db.set_follow("uid2", "uid1", true).unwrap(), Some(1));
        assert_eq!(db.get_followers("uid1").unwrap(), vec!["uid2"]);
        assert_eq!(db.get_following("uid2").unwrap(), vec!["uid1"]);

        assert_eq!(db.set_follow("uid2", "uid1", false).unwrap(), Some(0));
        assert_eq!(db.set_follow("uid2", "ghost", true).unwrap(), None);
    }

    #[test]
    fn provider_identity_is_linked_once() {
        let db = Database::open_in_memory().unwrap();
        let first = db
            .find_or_create_provider_identity("google", "sub-1", Some("a@example.com"), "new-1")
            .unwrap();
        let second = db
            .find_or_create_provider_identity("google", "sub-1", Some("a@example.com"), "new-2")
            .unwrap();
        assert_eq!(first, "new-1");
        assert_eq!(second, "new-1");
    }

    #[test]
    fn batch_fetches_span_more_ids_than_one_query_binds() {
        let db = seeded();
        let count = MAX_IN_PARAMS * 2 + 7;
        let ids: Vec<String> = (0..count).map(|i| format!("bulk-{i}")).collect();
        for id in &ids {
            db.insert_post(id, "uid1", "https://img/bulk.png", None).unwrap();
        }

        let first = &ids[0];
        let last = &ids[count - 1];
        db.set_like(first, "uid2", true).unwrap();
        db.set_like(last, "uid2", true).unwrap();
        let comment = NewComment {
            id: "c-last",
            user_id: "uid2",
            username: "grace",
            text: "end of the line",
            created_at: "2026-01-01T00:00:00.000Z",
        };
        db.append_comment(last, &comment).unwrap();

        let mut liked: Vec<String> =
            db.get_likes_for_posts(&ids).unwrap().into_iter().map(|l| l.post_id).collect();
        liked.sort();
        let mut expected = vec![first.clone(), last.clone()];
        expected.sort();
        assert_eq!(liked, expected);

        let comments = db.get_comments_for_posts(&ids).unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(&comments[0].post_id, last);
    }
}
