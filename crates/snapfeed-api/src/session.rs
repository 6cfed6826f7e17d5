use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::{debug, warn};

use snapfeed_db::{Database, ProfileUpsert};
use snapfeed_types::events::SessionState;
use snapfeed_types::models::Identity;

use crate::identity::{IdentityService, Subscription};

/// Reactive holder of the current identity.
///
/// Constructed explicitly and handed to whoever needs it. The only writer is
/// the auth-state callback registered in [`SessionContext::attach`]; readers
/// take synchronous snapshots or watch for changes.
pub struct SessionContext {
    state: Arc<RwLock<SessionState>>,
    updates: watch::Receiver<SessionState>,
    subscription: Mutex<Option<Subscription>>,
}

impl SessionContext {
    /// Start in the loading state and subscribe to `identity`. On every
    /// signed-in identity the user's profile is merged into `db` on the
    /// blocking pool.
    pub fn attach(identity: &IdentityService, db: Arc<Database>) -> Self {
        let state = Arc::new(RwLock::new(SessionState::default()));
        let (tx, updates) = watch::channel(SessionState::default());

        let writer = state.clone();
        let subscription = identity.on_auth_state_changed(move |user| {
            if let Some(user) = user {
                let db = db.clone();
                let user = user.clone();
                tokio::task::spawn_blocking(move || sync_profile(&db, &user));
            }

            let next = SessionState {
                current_user: user.cloned(),
                loading: false,
            };
            *writer.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
            tx.send_replace(next);
        });

        Self {
            state,
            updates,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.snapshot().current_user
    }

    pub fn is_loading(&self) -> bool {
        self.snapshot().loading
    }

    /// Receiver that sees every state the session moves through.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.updates.clone()
    }

    /// Wait until the first auth-state callback has run.
    pub async fn ready(&self) -> SessionState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| !state.loading).await {
            Ok(state) => state.clone(),
            // Callback task is gone; report whatever was last written
            Err(_) => self.snapshot(),
        }
    }

    /// Stop listening for auth-state changes. Safe to call more than once.
    pub fn teardown(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
            debug!("Session context unsubscribed");
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn sync_profile(db: &Database, user: &Identity) {
    let profile = ProfileUpsert {
        uid: user.uid.clone(),
        email: user.email.clone(),
        full_name: user.display_name.clone(),
        photo_url: user.photo_url.clone(),
    };
    if let Err(e) = db.upsert_profile(&profile) {
        warn!("Failed to sync profile for {}: {:#}", user.uid, e);
    }
}
