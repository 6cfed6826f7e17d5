use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        // Timestamps are ISO-8601 UTC with millisecond precision so they sort as text.
        conn.execute_batch(
            "
            CREATE TABLE identities (
                uid               TEXT PRIMARY KEY,
                provider          TEXT NOT NULL,
                email             TEXT,
                password_hash     TEXT,
                provider_subject  TEXT,
                created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE(provider, provider_subject)
            );

            CREATE UNIQUE INDEX idx_identities_password_email
                ON identities(email) WHERE provider = 'password';

            CREATE TABLE users (
                uid         TEXT PRIMARY KEY,
                username    TEXT UNIQUE,
                email       TEXT,
                full_name   TEXT,
                photo_url   TEXT,
                bio         TEXT,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE usernames (
                username    TEXT PRIMARY KEY,
                uid         TEXT NOT NULL REFERENCES users(uid)
            );

            CREATE INDEX idx_usernames_uid ON usernames(uid);

            CREATE TABLE follows (
                follower_id  TEXT NOT NULL REFERENCES users(uid),
                followee_id  TEXT NOT NULL REFERENCES users(uid),
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (follower_id, followee_id)
            );

            CREATE INDEX idx_follows_followee ON follows(followee_id);

            CREATE TABLE posts (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL REFERENCES users(uid),
                image_url   TEXT NOT NULL,
                caption     TEXT,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX idx_posts_created ON posts(created_at);
            CREATE INDEX idx_posts_user ON posts(user_id, created_at);

            CREATE TABLE post_likes (
                post_id     TEXT NOT NULL REFERENCES posts(id),
                user_id     TEXT NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (post_id, user_id)
            );

            CREATE TABLE comments (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL UNIQUE,
                post_id     TEXT NOT NULL REFERENCES posts(id),
                user_id     TEXT NOT NULL,
                username    TEXT NOT NULL,
                text        TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_comments_post ON comments(post_id, seq);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
