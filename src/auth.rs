use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::api::{self, TokenProvider};
use crate::models::{AuthResponse, LoginCredentials, RegisterData, User};
use crate::storage::{self, Account, Token};

/// Signs accounts in and out against the server and remembers them locally.
pub struct Flow {
    store: Arc<storage::Store>,
    client: Arc<api::Client>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub account: Account,
    pub access_token: String,
}

impl Flow {
    /// `client` is used for unauthenticated calls; authenticated ones get a
    /// copy carrying the account's token.
    pub fn new(store: Arc<storage::Store>, client: Arc<api::Client>) -> Self {
        Self { store, client }
    }

    pub fn login(&self, email: &str, password: &str) -> Result<Session> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            bail!("auth: email and password are required");
        }
        let response = self
            .client
            .login(&LoginCredentials {
                email: email.to_string(),
                password: password.to_string(),
            })
            .context("auth: login")?;
        self.complete(response)
    }

    pub fn register(&self, data: &RegisterData) -> Result<Session> {
        if data.username.trim().is_empty() || data.email.trim().is_empty() {
            bail!("auth: username and email are required");
        }
        let response = self.client.register(data).context("auth: register")?;
        self.complete(response)
    }

    pub fn resume(&self, account: Account, stored: Token) -> Result<Session> {
        if account.id == 0 {
            bail!("auth: account id required");
        }
        if stored.access_token.is_empty() {
            bail!("auth: stored token incomplete");
        }
        Ok(Session {
            account,
            access_token: stored.access_token,
        })
    }

    /// Re-reads the profile behind a session and stores any changes.
    pub fn refresh_profile(&self, session: &Session) -> Result<Account> {
        let client = self.client.with_token_provider(self.token_provider(session.account.id));
        let user = client.me().context("auth: fetch profile")?;
        let mut account = account_from_user(&user);
        account.created_at = session.account.created_at;
        account.id = self.store.upsert_account(account.clone())?;
        Ok(account)
    }

    /// Ends the server session when possible and always forgets the token.
    pub fn logout(&self, account_id: i64) -> Result<()> {
        if self.store.get_token(account_id)?.is_some() {
            let client = self.client.with_token_provider(self.token_provider(account_id));
            if let Err(err) = client.logout() {
                warn!(account_id, error = %err, "server logout failed; forgetting token anyway");
            }
        }
        self.store.delete_token(account_id)?;
        info!(account_id, "signed out");
        Ok(())
    }

    pub fn token_provider(&self, account_id: i64) -> Arc<dyn TokenProvider> {
        Arc::new(StoreTokenSource {
            store: self.store.clone(),
            account_id,
        })
    }

    fn complete(&self, response: AuthResponse) -> Result<Session> {
        if response.token.is_empty() {
            bail!("auth: server did not return a token");
        }
        let mut account = account_from_user(&response.user);
        account.id = self.store.upsert_account(account.clone())?;
        self.store.upsert_token(Token {
            account_id: account.id,
            access_token: response.token.clone(),
            issued_at: Utc::now(),
        })?;
        info!(username = %account.username, "signed in");
        Ok(Session {
            account,
            access_token: response.token,
        })
    }
}

fn account_from_user(user: &User) -> Account {
    let now = Utc::now();
    Account {
        id: 0,
        remote_id: user.id.clone(),
        username: user.username.clone(),
        display_name: user.display_name(),
        email: user.email.clone(),
        created_at: now,
        updated_at: now,
    }
}

/// Reads the token from storage on every request so a logout elsewhere takes
/// effect immediately.
struct StoreTokenSource {
    store: Arc<storage::Store>,
    account_id: i64,
}

impl TokenProvider for StoreTokenSource {
    fn access_token(&self) -> Option<String> {
        match self.store.get_token(self.account_id) {
            Ok(token) => token.map(|t| t.access_token),
            Err(err) => {
                warn!(account_id = self.account_id, error = %err, "failed to read token");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> (Flow, Arc<storage::Store>) {
        let store = Arc::new(storage::Store::open_in_memory().unwrap());
        let client = api::Client::new(
            Arc::new(api::Anonymous),
            api::ClientConfig {
                base_url: Some("http://127.0.0.1:9/api".into()),
                ..Default::default()
            },
        )
        .unwrap();
        (Flow::new(store.clone(), Arc::new(client)), store)
    }

    fn user(id: &str) -> User {
        User {
            id: id.into(),
            username: "ada".into(),
            email: "ada@example.com".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            avatar: None,
            cover_photo: None,
            bio: None,
        }
    }

    #[test]
    fn completed_login_is_persisted() {
        let (flow, store) = flow();
        let session = flow
            .complete(AuthResponse {
                success: true,
                token: "jwt".into(),
                user: user("u1"),
            })
            .unwrap();
        assert_eq!(session.account.remote_id, "u1");
        assert_eq!(session.account.display_name, "Ada Lovelace");

        let provider = flow.token_provider(session.account.id);
        assert_eq!(provider.access_token().as_deref(), Some("jwt"));
        assert!(store.get_account_by_remote_id("u1").unwrap().is_some());
    }

    #[test]
    fn response_without_token_is_rejected() {
        let (flow, _) = flow();
        let err = flow
            .complete(AuthResponse {
                success: true,
                token: String::new(),
                user: user("u1"),
            })
            .unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn login_requires_credentials() {
        let (flow, _) = flow();
        assert!(flow.login("  ", "secret").is_err());
        assert!(flow.login("ada@example.com", "").is_err());
    }

    #[test]
    fn token_provider_sees_token_removal() {
        let (flow, store) = flow();
        let session = flow
            .complete(AuthResponse {
                success: true,
                token: "jwt".into(),
                user: user("u1"),
            })
            .unwrap();
        let provider = flow.token_provider(session.account.id);
        store.delete_token(session.account.id).unwrap();
        assert!(provider.access_token().is_none());
    }
}
