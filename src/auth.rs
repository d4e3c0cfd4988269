use std::collections::HashMap;

use rand::distr::Alphanumeric;
use rand::Rng;

use crate::constants::{NICKNAME_MAX_LEN, SESSION_TOKEN_LEN};
use crate::error::AuthError;
use crate::types::{AccountContext, AccountId, ConnectionHandle};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub nickname: String,
    pub leader_class: u8,
    pub session_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthGrant {
    pub account: AccountContext,
    pub session_token: String,
}

/// Turns the credentials from a `Hello` into an account. Runs on the coordinator thread.
pub trait Authenticator: Send {
    fn authenticate(
        &mut self,
        handle: ConnectionHandle,
        credentials: &Credentials,
    ) -> Result<AuthGrant, AuthError>;
}

/// Accepts any nickname and remembers issued session tokens so a client can resume
/// the same account after reconnecting.
#[derive(Debug, Default)]
pub struct DevAuthenticator {
    next_account: u64,
    sessions: HashMap<String, AccountContext>,
}

impl DevAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Authenticator for DevAuthenticator {
    fn authenticate(
        &mut self,
        _handle: ConnectionHandle,
        credentials: &Credentials,
    ) -> Result<AuthGrant, AuthError> {
        if let Some(token) = credentials.session_token.as_deref() {
            let account = self.sessions.get_mut(token).ok_or(AuthError::UnknownToken)?;
            if !credentials.nickname.trim().is_empty() {
                account.nickname = sanitize_name(&credentials.nickname);
            }
            account.leader_class = credentials.leader_class;
            return Ok(AuthGrant {
                account: account.clone(),
                session_token: token.to_string(),
            });
        }

        if credentials.nickname.trim().is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        self.next_account += 1;
        let account = AccountContext {
            account_id: AccountId(self.next_account),
            nickname: sanitize_name(&credentials.nickname),
            leader_class: credentials.leader_class,
        };
        let session_token = make_session_token();
        self.sessions.insert(session_token.clone(), account.clone());
        Ok(AuthGrant {
            account,
            session_token,
        })
    }
}

pub fn sanitize_name(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "Player".to_string();
    }
    trimmed.chars().take(NICKNAME_MAX_LEN).collect()
}

fn make_session_token() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(SESSION_TOKEN_LEN)
        .map(char::from)
        .collect()
}
