//! Username reservations.
//!
//! The `usernames` table is the uniqueness index mapping a username to the
//! uid that owns it. Every check-then-write sequence here runs inside one
//! `IMMEDIATE` transaction, so two callers racing for the same free name
//! cannot both observe it as free.

use rusqlite::{Connection, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info};

use crate::Database;
use crate::queries::OptionalExt;

/// Profile fields merged into a user record. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpsert {
    pub uid: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub photo_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("username is already taken")]
    UsernameTaken,

    #[error("email is already registered")]
    EmailTaken,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for ReserveError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.into())
    }
}

impl Database {
    /// Reserve `username` for `profile.uid` and merge the profile.
    ///
    /// Succeeds without changes when the pair is already reserved. A username
    /// the uid held before is released so each user owns at most one name.
    pub fn reserve_username(&self, username: &str, profile: &ProfileUpsert) -> Result<(), ReserveError> {
        self.with_conn_mut(|conn| -> Result<(), ReserveError> {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            reserve_in(&tx, username, profile)?;
            tx.commit()?;
            Ok(())
        })?;

        info!("Username '{}' reserved for {}", username, profile.uid);
        Ok(())
    }

    /// Create a password identity, its profile and its username reservation
    /// as one unit. Nothing is written when the email or username is taken.
    pub fn register_password_identity(
        &self,
        email: &str,
        password_hash: &str,
        username: &str,
        profile: &ProfileUpsert,
    ) -> Result<(), ReserveError> {
        self.with_conn_mut(|conn| -> Result<(), ReserveError> {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let email_in_use: Option<String> = tx
                .query_row(
                    "SELECT uid FROM identities WHERE provider = 'password' AND email = ?1",
                    [email],
                    |row| row.get(0),
                )
                .optional()?;
            if email_in_use.is_some() {
                return Err(ReserveError::EmailTaken);
            }

            tx.execute(
                "INSERT INTO identities (uid, provider, email, password_hash) VALUES (?1, 'password', ?2, ?3)",
                (&profile.uid, email, password_hash),
            )?;

            reserve_in(&tx, username, profile)?;
            tx.commit()?;
            Ok(())
        })?;

        info!("Registered {} as '{}'", profile.uid, username);
        Ok(())
    }

    /// Merge profile fields without touching the username.
    pub fn upsert_profile(&self, profile: &ProfileUpsert) -> anyhow::Result<()> {
        self.with_conn(|conn| merge_profile(conn, profile, None))
    }

    /// Owner of a reserved username.
    pub fn get_reservation(&self, username: &str) -> anyhow::Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT uid FROM usernames WHERE username = ?1", [username], |row| {
                row.get(0)
            })
            .optional()
        })
    }
}

fn reserve_in(conn: &Connection, username: &str, profile: &ProfileUpsert) -> Result<(), ReserveError> {
    let owner: Option<String> = conn
        .query_row("SELECT uid FROM usernames WHERE username = ?1", [username], |row| {
            row.get(0)
        })
        .optional()?;

    match owner {
        Some(owner) if owner != profile.uid => {
            debug!("Username '{}' already owned by {}", username, owner);
            return Err(ReserveError::UsernameTaken);
        }
        _ => {}
    }

    // A uid owns at most one name
    conn.execute(
        "DELETE FROM usernames WHERE uid = ?1 AND username != ?2",
        (&profile.uid, username),
    )?;

    merge_profile(conn, profile, Some(username))?;

    conn.execute(
        "INSERT INTO usernames (username, uid) VALUES (?1, ?2)
         ON CONFLICT(username) DO UPDATE SET uid = excluded.uid",
        (username, &profile.uid),
    )?;

    Ok(())
}

fn merge_profile(conn: &Connection, profile: &ProfileUpsert, username: Option<&str>) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO users (uid, username, email, full_name, photo_url) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(uid) DO UPDATE SET
             username  = COALESCE(excluded.username, users.username),
             email     = COALESCE(excluded.email, users.email),
             full_name = COALESCE(excluded.full_name, users.full_name),
             photo_url = COALESCE(excluded.photo_url, users.photo_url)",
        rusqlite::params![
            profile.uid,
            username,
            profile.email,
            profile.full_name,
            profile.photo_url
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(uid: &str) -> ProfileUpsert {
        ProfileUpsert {
            uid: uid.to_string(),
            email: Some(format!("{}@example.com", uid)),
            ..Default::default()
        }
    }

    #[test]
    fn taken_username_is_rejected_for_another_uid() {
        let db = Database::open_in_memory().unwrap();

        db.reserve_username("ada", &profile("uid1")).unwrap();
        let err = db.reserve_username("ada", &profile("uid2")).unwrap_err();
        assert!(matches!(err, ReserveError::UsernameTaken));

        // Same pair again is a no-op success
        db.reserve_username("ada", &profile("uid1")).unwrap();
        assert_eq!(db.get_reservation("ada").unwrap().as_deref(), Some("uid1"));
        assert!(db.get_user_by_id("uid2").unwrap().is_none());
    }

    #[test]
    fn profile_merge_keeps_unspecified_fields() {
        let db = Database::open_in_memory().unwrap();

        let mut first = profile("uid1");
        first.photo_url = Some("https://img/a.png".into());
        db.reserve_username("ada", &first).unwrap();

        db.reserve_username("ada", &ProfileUpsert { uid: "uid1".into(), ..Default::default() })
            .unwrap();

        let user = db.get_user_by_id("uid1").unwrap().unwrap();
        assert_eq!(user.username.as_deref(), Some("ada"));
        assert_eq!(user.email.as_deref(), Some("uid1@example.com"));
        assert_eq!(user.photo_url.as_deref(), Some("https://img/a.png"));
    }

    #[test]
    fn reserving_a_new_name_releases_the_old_one() {
        let db = Database::open_in_memory().unwrap();

        db.reserve_username("ada", &profile("uid1")).unwrap();
        db.reserve_username("lovelace", &profile("uid1")).unwrap();

        assert!(db.get_reservation("ada").unwrap().is_none());
        assert_eq!(db.get_reservation("lovelace").unwrap().as_deref(), Some("uid1"));

        // The released name is free for someone else
        db.reserve_username("ada", &profile("uid2")).unwrap();
        assert_eq!(db.get_reservation("ada").unwrap().as_deref(), Some("uid2"));
    }

    #[test]
    fn registration_with_taken_username_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        db.reserve_username("ada", &profile("uid1")).unwrap();

        let err = db
            .register_password_identity("new@example.com", "hash", "ada", &profile("uid2"))
            .unwrap_err();
        assert!(matches!(err, ReserveError::UsernameTaken));

        assert!(db.get_password_identity("new@example.com").unwrap().is_none());
        assert!(db.get_user_by_id("uid2").unwrap().is_none());
    }

    #[test]
    fn registration_rejects_duplicate_email() {
        let db = Database::open_in_memory().unwrap();
        db.register_password_identity("a@example.com", "hash", "ada", &profile("uid1"))
            .unwrap();

        let err = db
            .register_password_identity("a@example.com", "hash", "grace", &profile("uid2"))
            .unwrap_err();
        assert!(matches!(err, ReserveError::EmailTaken));
        assert!(db.get_reservation("grace").unwrap().is_none());
    }
}
