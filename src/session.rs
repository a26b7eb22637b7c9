use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use tracing::info;

use crate::api::TokenProvider;
use crate::auth::{Flow as AuthFlow, Session as AuthSession};
use crate::data::IdentityProvider;
use crate::models::RegisterData;
use crate::storage::{self, Account};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("account not found")]
    AccountNotFound,
    #[error("token not found")]
    TokenNotFound,
    #[error("not signed in")]
    NotSignedIn,
}

/// Remembered accounts and which one is in use.
///
/// The active account is the viewer the feed renders for; switching or
/// signing out changes what [`IdentityProvider::viewer_id`] reports.
pub struct Manager {
    store: Arc<storage::Store>,
    flow: Arc<AuthFlow>,
    sessions: RwLock<HashMap<i64, AuthSession>>,
    active_id: RwLock<Option<i64>>,
}

impl Manager {
    pub fn new(store: Arc<storage::Store>, flow: Arc<AuthFlow>) -> Self {
        Self {
            store,
            flow,
            sessions: RwLock::new(HashMap::new()),
            active_id: RwLock::new(None),
        }
    }

    /// Restores every account with a stored token. The most recently used
    /// one becomes active.
    pub fn load_existing(&self) -> Result<()> {
        let accounts = self.store.list_accounts()?;
        for account in accounts {
            if let Some(token) = self.store.get_token(account.id)? {
                let session = self.flow.resume(account.clone(), token)?;
                self.sessions.write().insert(account.id, session);
                let mut active = self.active_id.write();
                if active.is_none() {
                    *active = Some(account.id);
                }
            }
        }
        Ok(())
    }

    pub fn active(&self) -> Option<AuthSession> {
        let sessions = self.sessions.read();
        let active = self.active_id.read();
        active.and_then(|id| sessions.get(&id).cloned())
    }

    pub fn active_account_id(&self) -> Option<i64> {
        *self.active_id.read()
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        self.store.list_accounts()
    }

    pub fn switch(&self, account_id: i64) -> Result<AuthSession> {
        let cached = self.sessions.read().get(&account_id).cloned();
        let session = match cached {
            Some(session) => session,
            None => {
                let account = self
                    .store
                    .get_account_by_id(account_id)?
                    .ok_or(SessionError::AccountNotFound)?;
                let token = self
                    .store
                    .get_token(account_id)?
                    .ok_or(SessionError::TokenNotFound)?;
                let session = self.flow.resume(account, token)?;
                self.sessions.write().insert(account_id, session.clone());
                session
            }
        };
        self.activate(&session)?;
        Ok(session)
    }

    pub fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        let session = self.flow.login(email, password)?;
        self.remember(session)
    }

    pub fn register(&self, data: &RegisterData) -> Result<AuthSession> {
        let session = self.flow.register(data)?;
        self.remember(session)
    }

    /// Signs the active account out. Another remembered account, if any,
    /// becomes active.
    pub fn logout(&self) -> Result<Account> {
        let Some(session) = self.active() else {
            bail!(SessionError::NotSignedIn);
        };
        self.flow.logout(session.account.id)?;

        let mut sessions = self.sessions.write();
        sessions.remove(&session.account.id);
        let next = sessions
            .values()
            .max_by_key(|s| s.account.updated_at)
            .map(|s| s.account.id);
        *self.active_id.write() = next;
        Ok(session.account)
    }

    pub fn active_token_provider(&self) -> Result<Arc<dyn TokenProvider>> {
        let active_id = self.active_account_id().ok_or(SessionError::NotSignedIn)?;
        Ok(self.flow.token_provider(active_id))
    }

    pub fn token_provider(&self, account_id: i64) -> Result<Arc<dyn TokenProvider>> {
        if account_id == 0 {
            bail!(SessionError::AccountNotFound);
        }
        Ok(self.flow.token_provider(account_id))
    }

    fn remember(&self, session: AuthSession) -> Result<AuthSession> {
        self.sessions
            .write()
            .insert(session.account.id, session.clone());
        self.activate(&session)?;
        Ok(session)
    }

    fn activate(&self, session: &AuthSession) -> Result<()> {
        self.store.touch_account(session.account.id)?;
        *self.active_id.write() = Some(session.account.id);
        info!(username = %session.account.username, "active account changed");
        Ok(())
    }
}

impl IdentityProvider for Manager {
    fn viewer_id(&self) -> Option<String> {
        self.active().map(|session| session.account.remote_id)
    }
}

/// Follows whichever account is active at request time.
impl TokenProvider for Manager {
    fn access_token(&self) -> Option<String> {
        let id = self.active_account_id()?;
        self.flow.token_provider(id).access_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api;
    use crate::storage::Token;
    use chrono::{Duration, Utc};

    fn manager() -> (Manager, Arc<storage::Store>) {
        let store = Arc::new(storage::Store::open_in_memory().unwrap());
        let client = api::Client::new(
            Arc::new(api::Anonymous),
            api::ClientConfig {
                base_url: Some("http://127.0.0.1:9/api".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let flow = Arc::new(AuthFlow::new(store.clone(), Arc::new(client)));
        (Manager::new(store.clone(), flow), store)
    }

    fn seed(store: &storage::Store, remote_id: &str, token: Option<&str>, age_secs: i64) -> i64 {
        let at = Utc::now() - Duration::seconds(age_secs);
        let id = store
            .upsert_account(Account {
                id: 0,
                remote_id: remote_id.into(),
                username: remote_id.into(),
                display_name: remote_id.into(),
                email: String::new(),
                created_at: at,
                updated_at: at,
            })
            .unwrap();
        if let Some(token) = token {
            store
                .upsert_token(Token {
                    account_id: id,
                    access_token: token.into(),
                    issued_at: at,
                })
                .unwrap();
        }
        id
    }

    #[test]
    fn nobody_is_signed_in_by_default() {
        let (manager, _) = manager();
        manager.load_existing().unwrap();
        assert!(manager.viewer_id().is_none());
        assert!(manager.active_token_provider().is_err());
        assert!(manager.access_token().is_none());
        assert!(manager.logout().is_err());
    }

    #[test]
    fn load_existing_activates_an_account_with_a_token() {
        let (manager, store) = manager();
        seed(&store, "u1", Some("jwt-1"), 0);
        seed(&store, "u2", None, 0);
        manager.load_existing().unwrap();
        assert_eq!(manager.viewer_id().as_deref(), Some("u1"));
        assert_eq!(manager.access_token().as_deref(), Some("jwt-1"));
    }

    #[test]
    fn switch_changes_the_viewer() {
        let (manager, store) = manager();
        seed(&store, "u1", Some("jwt-1"), 0);
        let second = seed(&store, "u2", Some("jwt-2"), 0);
        let missing = seed(&store, "u3", None, 0);
        manager.load_existing().unwrap();

        manager.switch(second).unwrap();
        assert_eq!(manager.viewer_id().as_deref(), Some("u2"));
        assert_eq!(manager.access_token().as_deref(), Some("jwt-2"));
        assert!(manager.switch(missing).is_err());
        assert!(manager.switch(9999).is_err());
    }

    #[test]
    fn logout_falls_back_to_another_account() {
        let (manager, store) = manager();
        let first = seed(&store, "u1", Some("jwt-1"), 0);
        seed(&store, "u2", Some("jwt-2"), 60);
        manager.load_existing().unwrap();
        manager.switch(first).unwrap();

        let gone = manager.logout().unwrap();
        assert_eq!(gone.remote_id, "u1");
        assert!(store.get_token(first).unwrap().is_none());
        assert_eq!(manager.viewer_id().as_deref(), Some("u2"));

        manager.logout().unwrap();
        assert!(manager.viewer_id().is_none());
    }
}
