//! CONNECT authorization.
//!
//! The broker asks an `Authenticator` whether a CONNECT may proceed and maps
//! the answer onto a CONNACK return code. `StaticAuthenticator` checks the
//! credentials from the `[auth]` configuration section.

use std::collections::HashMap;
use std::fmt::Debug;

use crate::config::AuthSettings;
use crate::protocol::ConnackCode;

/// Outcome of an authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    /// CONNACK 4: bad username or password.
    BadCredentials,
    /// CONNACK 5: not authorized.
    NotAuthorized,
}

impl AuthDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, AuthDecision::Allow)
    }

    pub fn connack_code(self) -> ConnackCode {
        match self {
            AuthDecision::Allow => ConnackCode::Accepted,
            AuthDecision::BadCredentials => ConnackCode::BadUsernamePassword,
            AuthDecision::NotAuthorized => ConnackCode::NotAuthorized,
        }
    }
}

/// Credentials presented in CONNECT.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

/// Validates credentials on CONNECT.
///
/// Called with the broker lock held, so implementations must not block.
pub trait Authenticator: Send + Sync + Debug + 'static {
    fn authenticate(&self, credentials: &Credentials<'_>) -> AuthDecision;
}

/// Authenticator backed by a static username/password table.
#[derive(Debug, Clone)]
pub struct StaticAuthenticator {
    allow_anonymous: bool,
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            allow_anonymous: settings.allow_anonymous,
            users: settings.users.clone(),
        }
    }
}

impl Default for StaticAuthenticator {
    fn default() -> Self {
        Self::new(&AuthSettings::default())
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, credentials: &Credentials<'_>) -> AuthDecision {
        let Some(username) = credentials.username else {
            return if self.allow_anonymous {
                AuthDecision::Allow
            } else {
                AuthDecision::NotAuthorized
            };
        };

        // No user table: any username is accepted, as for anonymous clients.
        if self.users.is_empty() {
            return if self.allow_anonymous {
                AuthDecision::Allow
            } else {
                AuthDecision::NotAuthorized
            };
        }

        match (self.users.get(username), credentials.password) {
            (Some(expected), Some(password)) if expected.as_bytes() == password => {
                AuthDecision::Allow
            }
            _ => AuthDecision::BadCredentials,
        }
    }
}
