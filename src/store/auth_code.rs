//
// Authorization code store. Short-TTL, at-most-once: `consume` flips the
// record exactly once no matter how many callers race on the same code.
//
use std::sync::LazyLock;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::crypto;

pub static CODE_STORE: LazyLock<AuthorizationCodeStore> = LazyLock::new(AuthorizationCodeStore::default);

/// Everything a pending authorization binds together. `claims` carries the
/// validator output so the token endpoint does not re-validate credentials.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthorizationCode {
    pub client_id: String,
    pub tenant_name: String,
    pub subject: String,
    pub redirect_uri: String,
    pub scope: Vec<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
    pub state: String,
    pub claims: Map<String, Value>,
    pub expires_at: i64,
}

struct Entry {
    record: AuthorizationCode,
    consumed: bool,
    // Refresh family created by the first successful exchange; revoked
    // when the code is replayed
    spawned_family: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConsumeError {
    /// Unknown or expired code
    Invalid,
    /// Already consumed once; carries the refresh family spawned by the
    /// first use so the caller can revoke it
    Replayed(Option<String>),
}

#[derive(Default)]
pub struct AuthorizationCodeStore {
    codes: DashMap<String, Entry>,
}

impl AuthorizationCodeStore {
    /// Stores the record and returns the opaque code to hand to the user
    /// agent.
    pub fn put(&self, record: AuthorizationCode) -> String {
        let code = crypto::random_opaque();
        self.codes.insert(
            code.clone(),
            Entry {
                record,
                consumed: false,
                spawned_family: None,
            },
        );
        code
    }

    /// Atomically flips `consumed` and returns the record exactly once.
    /// Codes are never retriable: a failure after this point (PKCE,
    /// redirect binding) must not be undone.
    pub fn consume(&self, code: &str) -> Result<AuthorizationCode, ConsumeError> {
        let mut entry = match self.codes.get_mut(code) {
            Some(entry) => entry,
            None => return Err(ConsumeError::Invalid),
        };

        if entry.consumed {
            return Err(ConsumeError::Replayed(entry.spawned_family.clone()));
        }

        entry.consumed = true;

        if entry.record.expires_at <= Utc::now().timestamp() {
            return Err(ConsumeError::Invalid);
        }

        Ok(entry.record.clone())
    }

    /// Links the refresh family spawned by the first successful exchange so
    /// a later replay of the code can revoke it.
    pub fn link_family(&self, code: &str, family_id: &str) {
        if let Some(mut entry) = self.codes.get_mut(code) {
            entry.spawned_family = Some(family_id.to_string());
        }
    }

    /// Drops expired records. Consumed ones are kept until expiry so replay
    /// detection keeps working for the whole code lifetime.
    pub fn sweep(&self) {
        let now = Utc::now().timestamp();
        let before = self.codes.len();
        self.codes.retain(|_, entry| entry.record.expires_at > now);
        let removed = before.saturating_sub(self.codes.len());
        if removed > 0 {
            debug!("Swept {removed} expired authorization code(s)");
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.codes.len()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn sample_record(expires_in: i64) -> AuthorizationCode {
        AuthorizationCode {
            client_id: "app1".to_string(),
            tenant_name: "acme".to_string(),
            subject: "alice".to_string(),
            redirect_uri: "https://app1.acme.test/cb".to_string(),
            scope: vec!["openid".to_string(), "email".to_string()],
            code_challenge: None,
            code_challenge_method: None,
            nonce: None,
            state: "xyz".to_string(),
            claims: Map::new(),
            expires_at: Utc::now().timestamp() + expires_in,
        }
    }

    #[test]
    fn consume_succeeds_exactly_once() {
        let store = AuthorizationCodeStore::default();
        let code = store.put(sample_record(60));

        assert!(store.consume(&code).is_ok());
        assert_eq!(store.consume(&code), Err(ConsumeError::Replayed(None)));
        assert_eq!(store.consume(&code), Err(ConsumeError::Replayed(None)));
    }

    #[test]
    fn unknown_and_expired_codes_are_invalid() {
        let store = AuthorizationCodeStore::default();
        assert_eq!(store.consume("nope"), Err(ConsumeError::Invalid));

        let code = store.put(sample_record(-1));
        assert_eq!(store.consume(&code), Err(ConsumeError::Invalid));
    }

    #[test]
    fn replay_reports_the_spawned_family() {
        let store = AuthorizationCodeStore::default();
        let code = store.put(sample_record(60));

        store.consume(&code).unwrap();
        store.link_family(&code, "family-1");

        assert_eq!(store.consume(&code), Err(ConsumeError::Replayed(Some("family-1".to_string()))));
    }

    #[test]
    fn concurrent_consume_has_a_single_winner() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(AuthorizationCodeStore::default());
        let code = store.put(sample_record(60));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let code = code.clone();
                thread::spawn(move || store.consume(&code).is_ok())
            })
            .collect();

        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|&b| b).count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let store = AuthorizationCodeStore::default();
        store.put(sample_record(-10));
        let live = store.put(sample_record(60));

        store.sweep();
        assert_eq!(store.len(), 1);
        assert!(store.consume(&live).is_ok());
    }
}
