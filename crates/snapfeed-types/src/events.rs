use serde::{Deserialize, Serialize};

use crate::models::Identity;

/// Auth-state changes published by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AuthStateChange {
    /// An identity completed sign-in (password, Google, or new registration)
    SignedIn(Identity),

    /// The identity with this uid signed out
    SignedOut { uid: String },
}

impl AuthStateChange {
    /// The identity that is current after this change, if any.
    pub fn current_user(&self) -> Option<&Identity> {
        match self {
            Self::SignedIn(identity) => Some(identity),
            Self::SignedOut { .. } => None,
        }
    }
}

/// Snapshot of the session context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub current_user: Option<Identity>,
    pub loading: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            current_user: None,
            loading: true,
        }
    }
}
