//! Identity service: accounts, sign-in, tokens, and auth-state notifications.

use std::sync::{Arc, Mutex, PoisonError};

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use snapfeed_db::{Database, ProfileUpsert};
use snapfeed_types::api::Claims;
use snapfeed_types::events::AuthStateChange;
use snapfeed_types::models::Identity;

use crate::error::{ApiError, internal, run_blocking, upstream};

const TOKEN_TTL_DAYS: i64 = 30;
const GOOGLE_PROVIDER: &str = "google";

/// Outcome of a successful sign-in or registration.
#[derive(Debug, Clone)]
pub struct SignedIn {
    pub identity: Identity,
    pub username: String,
    pub token: String,
}

pub struct IdentityService {
    db: Arc<Database>,
    jwt_secret: String,
    /// `None` when Google sign-in is not configured.
    google: Option<GoogleVerifier>,
    changes: broadcast::Sender<AuthStateChange>,
    /// Identity named by the most recent auth-state change.
    current: Mutex<Option<Identity>>,
}

impl IdentityService {
    pub fn new(db: Arc<Database>, jwt_secret: String, google: Option<GoogleVerifier>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            db,
            jwt_secret,
            google,
            changes,
            current: Mutex::new(None),
        }
    }

    /// Register a password account and reserve its username in one step.
    pub async fn create_user_with_email_and_password(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<SignedIn, ApiError> {
        let email = normalize_email(email)?;
        let username = normalize_username(username)?;
        if password.chars().count() < 8 {
            return Err(ApiError::validation("Password must be at least 8 characters."));
        }

        let uid = Uuid::new_v4().to_string();
        let identity = Identity {
            uid: uid.clone(),
            email: Some(email.clone()),
            display_name: None,
            photo_url: None,
        };

        let db = self.db.clone();
        let password = password.to_string();
        let profile = ProfileUpsert {
            uid,
            email: Some(email.clone()),
            ..Default::default()
        };
        let reserved = username.clone();
        run_blocking(move || {
            let password_hash = hash_password(&password)?;
            db.register_password_identity(&email, &password_hash, &reserved, &profile)?;
            Ok(())
        })
        .await?;

        self.complete_sign_in(identity, username)
    }

    pub async fn sign_in_with_email_and_password(&self, email: &str, password: &str) -> Result<SignedIn, ApiError> {
        let email = email.trim().to_lowercase();
        let password = password.to_string();
        let db = self.db.clone();

        let (row, user) = run_blocking(move || {
            let row = db
                .get_password_identity(&email)
                .map_err(internal("Failed to sign in"))?
                .ok_or(ApiError::InvalidCredentials)?;

            let stored = row.password_hash.as_deref().ok_or(ApiError::InvalidCredentials)?;
            let parsed_hash = PasswordHash::new(stored).map_err(|e| ApiError::Internal {
                context: "Failed to sign in",
                source: anyhow::anyhow!("corrupt password hash for {}: {}", row.uid, e),
            })?;
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed_hash)
                .map_err(|_| ApiError::InvalidCredentials)?;

            let user = db.get_user_by_id(&row.uid).map_err(internal("Failed to sign in"))?;
            Ok((row, user))
        })
        .await?;

        let user = user.ok_or_else(|| ApiError::Internal {
            context: "Failed to sign in",
            source: anyhow::anyhow!("identity {} has no profile", row.uid),
        })?;
        let username = user.username.ok_or_else(|| ApiError::Internal {
            context: "Failed to sign in",
            source: anyhow::anyhow!("identity {} has no username", row.uid),
        })?;

        let identity = Identity {
            uid: row.uid,
            email: row.email,
            display_name: user.full_name,
            photo_url: user.photo_url,
        };
        self.complete_sign_in(identity, username)
    }

    /// Sign in with a Google ID token. First sign-in links a new uid; every
    /// sign-in (re)reserves `username` for that uid and merges the Google profile.
    pub async fn sign_in_with_google(&self, id_token: &str, username: &str) -> Result<SignedIn, ApiError> {
        let google = self.google.as_ref().ok_or(ApiError::NotFound("Google sign-in"))?;
        let username = normalize_username(username)?;
        let profile = google
            .verify(id_token)
            .await
            .map_err(upstream("Failed to sign in. Try again."))?
            .ok_or(ApiError::InvalidCredentials)?;

        let db = self.db.clone();
        let reserved = username.clone();
        let google = profile.clone();
        let uid = run_blocking(move || {
            let uid = db
                .find_or_create_provider_identity(
                    GOOGLE_PROVIDER,
                    &google.subject,
                    google.email.as_deref(),
                    &Uuid::new_v4().to_string(),
                )
                .map_err(internal("Failed to sign in. Try again."))?;

            db.reserve_username(
                &reserved,
                &ProfileUpsert {
                    uid: uid.clone(),
                    email: google.email,
                    full_name: google.name,
                    photo_url: google.picture,
                },
            )?;
            Ok(uid)
        })
        .await?;

        let identity = Identity {
            uid,
            email: profile.email,
            display_name: profile.name,
            photo_url: profile.picture,
        };
        self.complete_sign_in(identity, username)
    }

    /// Tokens are stateless; signing out only notifies auth-state subscribers.
    pub fn sign_out(&self, uid: &str) {
        info!("{} signed out", uid);
        self.publish(AuthStateChange::SignedOut { uid: uid.to_string() });
    }

    pub fn issue_token(&self, uid: &str, username: &str) -> anyhow::Result<String> {
        let claims = Claims {
            sub: uid.to_string(),
            username: username.to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_TTL_DAYS)).timestamp() as usize,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?;

        Ok(token)
    }

    pub fn google_enabled(&self) -> bool {
        self.google.is_some()
    }

    /// Identity named by the latest auth-state change that affected it.
    pub fn current_user(&self) -> Option<Identity> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn verify_token(&self, token: &str) -> Option<Claims> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| debug!("Rejected token: {}", e))
        .ok()
    }

    /// Invoke `callback` now with the current identity and again after every
    /// auth-state change, until the returned subscription is dropped.
    pub fn on_auth_state_changed<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(Option<&Identity>) + Send + 'static,
    {
        // Snapshot and subscribe under the lock so no change falls between them
        let (initial, mut rx) = {
            let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            (current.clone(), self.changes.subscribe())
        };

        let handle = tokio::spawn(async move {
            let mut current = initial;
            callback(current.as_ref());
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        if apply_change(&mut current, &change) {
                            callback(current.as_ref());
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Auth-state subscriber lagged, skipped {} changes", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Subscription { handle }
    }

    fn complete_sign_in(&self, identity: Identity, username: String) -> Result<SignedIn, ApiError> {
        let token = self
            .issue_token(&identity.uid, &username)
            .map_err(internal("Failed to issue token"))?;

        info!("{} signed in as '{}'", identity.uid, username);
        self.publish(AuthStateChange::SignedIn(identity.clone()));

        Ok(SignedIn {
            identity,
            username,
            token,
        })
    }

    pub(crate) fn publish(&self, change: AuthStateChange) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        apply_change(&mut current, &change);
        // No receivers is fine
        let _ = self.changes.send(change);
    }
}

/// Fold one change into `current`. Signing out a uid other than the current
/// one leaves it in place. Returns whether `current` changed.
fn apply_change(current: &mut Option<Identity>, change: &AuthStateChange) -> bool {
    match change {
        AuthStateChange::SignedIn(identity) => {
            *current = Some(identity.clone());
            true
        }
        AuthStateChange::SignedOut { uid } => {
            if current.as_ref().is_some_and(|c| &c.uid == uid) {
                *current = None;
                true
            } else {
                false
            }
        }
    }
}

/// Handle for an auth-state callback. Dropping it unsubscribes.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// -- Google ID tokens --

#[derive(Debug, Clone)]
pub struct GoogleProfile {
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    sub: String,
    aud: String,
    email: Option<String>,
    name: Option<String>,
    picture: Option<String>,
}

/// Verifies Google ID tokens against the token-info endpoint. Only tokens
/// minted for `client_id` are accepted.
pub struct GoogleVerifier {
    client: reqwest::Client,
    tokeninfo_url: String,
    client_id: String,
}

impl GoogleVerifier {
    pub fn new(client: reqwest::Client, tokeninfo_url: String, client_id: String) -> Self {
        Self {
            client,
            tokeninfo_url,
            client_id,
        }
    }

    /// `Ok(None)` when Google rejects the token or it was minted for another client.
    pub async fn verify(&self, id_token: &str) -> anyhow::Result<Option<GoogleProfile>> {
        let resp = self
            .client
            .get(&self.tokeninfo_url)
            .query(&[("id_token", id_token)])
            .send()
            .await?;

        if resp.status().is_client_error() {
            debug!("Google rejected ID token: {}", resp.status());
            return Ok(None);
        }

        let info: TokenInfo = resp.error_for_status()?.json().await?;

        if info.aud != self.client_id {
            warn!("Google ID token audience mismatch: {}", info.aud);
            return Ok(None);
        }

        Ok(Some(GoogleProfile {
            subject: info.sub,
            email: info.email,
            name: info.name,
            picture: info.picture,
        }))
    }
}

// -- Validation --

pub fn normalize_username(raw: &str) -> Result<String, ApiError> {
    let username = raw.trim();
    if username.is_empty() {
        return Err(ApiError::validation("Please enter a username."));
    }

    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if username.len() < 3 || username.len() > 32 || !valid_chars {
        return Err(ApiError::validation(
            "Usernames are 3-32 characters of letters, digits, '_' or '.'.",
        ));
    }

    Ok(username.to_string())
}

fn normalize_email(raw: &str) -> Result<String, ApiError> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(ApiError::validation("Please enter a valid email address.")),
    }
}

fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal {
            context: "Failed to create account",
            source: anyhow::anyhow!("password hashing failed: {}", e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> IdentityService {
        let db = Arc::new(Database::open_in_memory().unwrap());
        IdentityService::new(db, "test-secret".into(), None)
    }

    #[test]
    fn username_validation() {
        assert!(normalize_username("   ").is_err());
        assert!(normalize_username("ab").is_err());
        assert!(normalize_username("has space").is_err());
        assert_eq!(normalize_username("  ada.l_99 ").unwrap(), "ada.l_99");
    }

    #[test]
    fn email_validation() {
        assert!(normalize_email("nobody").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert_eq!(normalize_email(" Ada@Example.com ").unwrap(), "ada@example.com");
    }

    #[tokio::test]
    async fn register_then_sign_in() {
        let identity = service();

        let registered = identity
            .create_user_with_email_and_password("ada@example.com", "correct horse", "ada")
            .await
            .unwrap();
        assert_eq!(registered.username, "ada");

        let signed_in = identity
            .sign_in_with_email_and_password("ADA@example.com", "correct horse")
            .await
            .unwrap();
        assert_eq!(signed_in.identity.uid, registered.identity.uid);

        let claims = identity.verify_token(&signed_in.token).unwrap();
        assert_eq!(claims.sub, registered.identity.uid);
        assert_eq!(claims.username, "ada");
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let identity = service();
        identity
            .create_user_with_email_and_password("ada@example.com", "correct horse", "ada")
            .await
            .unwrap();

        let err = identity
            .sign_in_with_email_and_password("ada@example.com", "wrong horse")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));
    }

    #[tokio::test]
    async fn registering_a_taken_username_fails() {
        let identity = service();
        identity
            .create_user_with_email_and_password("ada@example.com", "correct horse", "ada")
            .await
            .unwrap();

        let err = identity
            .create_user_with_email_and_password("other@example.com", "correct horse", "ada")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UsernameTaken));
    }

    #[test]
    fn foreign_tokens_are_rejected() {
        let identity = service();
        assert!(identity.verify_token("not-a-jwt").is_none());

        let other = IdentityService::new(Arc::new(Database::open_in_memory().unwrap()), "other".into(), None);
        let token = other.issue_token("uid1", "ada").unwrap();
        assert!(identity.verify_token(&token).is_none());
    }

    #[tokio::test]
    async fn short_multibyte_password_is_rejected() {
        let identity = service();
        // Six bytes, three characters
        let err = identity
            .create_user_with_email_and_password("ada@example.com", "ééé", "ada")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        identity
            .create_user_with_email_and_password("ada@example.com", "éééééééé", "ada")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn google_sign_in_unconfigured_is_not_found() {
        let identity = service();
        assert!(!identity.google_enabled());

        let err = identity.sign_in_with_google("token", "ada").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn signing_out_another_user_keeps_the_current_one() {
        let identity = service();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _subscription = identity.on_auth_state_changed(move |user| {
            let _ = tx.send(user.map(|u| u.uid.clone()));
        });

        let alice = identity
            .create_user_with_email_and_password("alice@example.com", "correct horse", "alice")
            .await
            .unwrap();
        let bob = identity
            .create_user_with_email_and_password("bob@example.com", "correct horse", "bob")
            .await
            .unwrap();

        identity.sign_out(&alice.identity.uid);
        assert_eq!(identity.current_user().map(|u| u.uid), Some(bob.identity.uid.clone()));

        let carol = identity
            .create_user_with_email_and_password("carol@example.com", "correct horse", "carol")
            .await
            .unwrap();

        // No callback between bob and carol: alice's sign-out changed nothing
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                None,
                Some(alice.identity.uid.clone()),
                Some(bob.identity.uid.clone()),
                Some(carol.identity.uid.clone()),
            ]
        );

        identity.sign_out(&carol.identity.uid);
        assert_eq!(rx.recv().await.unwrap(), None);
        assert!(identity.current_user().is_none());
    }
}
