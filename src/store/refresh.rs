//
// Refresh token store. Every refresh belongs to a family created at the
// initial exchange; rotation retires the presented token and replaying a
// retired one burns the whole family.
//
use std::sync::LazyLock;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::crypto;

pub static REFRESH_STORE: LazyLock<RefreshTokenStore> = LazyLock::new(RefreshTokenStore::default);

#[derive(Clone, Debug, PartialEq)]
pub struct RefreshToken {
    // The opaque value handed to the client
    pub id: String,
    pub family_id: String,
    pub client_id: String,
    pub tenant_name: String,
    pub subject: String,
    pub scope: Vec<String>,
    pub claims: Map<String, Value>,
    pub parent_id: Option<String>,
    pub expires_at: i64,
    pub revoked: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RefreshError {
    /// Unknown or expired token
    Invalid,
    /// Token was already rotated away; the family has been revoked
    Replayed,
}

struct Family {
    revoked: bool,
    members: Vec<String>,
}

#[derive(Default)]
pub struct RefreshTokenStore {
    tokens: DashMap<String, RefreshToken>,
    families: DashMap<String, Family>,
}

impl RefreshTokenStore {
    /// Creates a fresh family with its first token. Called once per
    /// code/password exchange.
    pub fn issue(
        &self,
        client_id: &str,
        tenant_name: &str,
        subject: &str,
        scope: &[String],
        claims: Map<String, Value>,
        ttl: i64,
    ) -> RefreshToken {
        let token = RefreshToken {
            id: crypto::random_opaque(),
            family_id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            tenant_name: tenant_name.to_string(),
            subject: subject.to_string(),
            scope: scope.to_vec(),
            claims,
            parent_id: None,
            expires_at: Utc::now().timestamp() + ttl,
            revoked: false,
        };

        self.families.insert(
            token.family_id.clone(),
            Family {
                revoked: false,
                members: vec![token.id.clone()],
            },
        );
        self.tokens.insert(token.id.clone(), token.clone());

        token
    }

    /// Rotation on use: presenting `R_n` retires it and returns `R_{n+1}`.
    /// The family entry is the lock, which makes rotation linearizable
    /// within a family. Presenting an already-retired token revokes the
    /// whole family.
    pub fn rotate(&self, token_id: &str, ttl: i64) -> Result<RefreshToken, RefreshError> {
        let family_id = match self.tokens.get(token_id) {
            Some(token) => token.family_id.clone(),
            None => return Err(RefreshError::Invalid),
        };

        let mut family = match self.families.get_mut(&family_id) {
            Some(family) => family,
            None => return Err(RefreshError::Invalid),
        };

        if family.revoked {
            return Err(RefreshError::Replayed);
        }

        let presented = match self.tokens.get(token_id) {
            Some(token) => token.value().clone(),
            None => return Err(RefreshError::Invalid),
        };

        if presented.revoked {
            // Replay of a rotated-away token, burn every descendant
            family.revoked = true;
            for member in &family.members {
                if let Some(mut token) = self.tokens.get_mut(member) {
                    token.revoked = true;
                }
            }
            warn!("Refresh token replay detected, revoked family {family_id}");
            return Err(RefreshError::Replayed);
        }

        if presented.expires_at <= Utc::now().timestamp() {
            return Err(RefreshError::Invalid);
        }

        let successor = RefreshToken {
            id: crypto::random_opaque(),
            family_id: family_id.clone(),
            client_id: presented.client_id.clone(),
            tenant_name: presented.tenant_name.clone(),
            subject: presented.subject.clone(),
            scope: presented.scope.clone(),
            claims: presented.claims.clone(),
            parent_id: Some(presented.id.clone()),
            expires_at: Utc::now().timestamp() + ttl,
            revoked: false,
        };

        if let Some(mut token) = self.tokens.get_mut(token_id) {
            token.revoked = true;
        }
        self.tokens.insert(successor.id.clone(), successor.clone());
        family.members.push(successor.id.clone());

        Ok(successor)
    }

    pub fn revoke_family(&self, family_id: &str) {
        if let Some(mut family) = self.families.get_mut(family_id) {
            family.revoked = true;
            for member in &family.members {
                if let Some(mut token) = self.tokens.get_mut(member) {
                    token.revoked = true;
                }
            }
            info!("Revoked refresh family {family_id}");
        }
    }

    pub fn lookup(&self, token_id: &str) -> Option<RefreshToken> {
        self.tokens.get(token_id).map(|t| t.value().clone())
    }

    /// Lazily drops expired tokens; a family disappears once its last
    /// member is gone.
    pub fn sweep(&self) {
        let now = Utc::now().timestamp();
        self.tokens.retain(|_, token| token.expires_at > now);
        self.families.retain(|_, family| {
            family.members.retain(|member| self.tokens.contains_key(member.as_str()));
            !family.members.is_empty()
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue_sample(store: &RefreshTokenStore, ttl: i64) -> RefreshToken {
        store.issue("app1", "acme", "alice", &["openid".to_string()], Map::new(), ttl)
    }

    #[test]
    fn rotation_links_parent_and_retires_predecessor() {
        let store = RefreshTokenStore::default();
        let r1 = issue_sample(&store, 3600);

        let r2 = store.rotate(&r1.id, 3600).unwrap();
        assert_eq!(r2.family_id, r1.family_id);
        assert_eq!(r2.parent_id.as_deref(), Some(r1.id.as_str()));
        assert!(store.lookup(&r1.id).unwrap().revoked);
        assert!(!store.lookup(&r2.id).unwrap().revoked);
    }

    #[test]
    fn replay_revokes_the_whole_family() {
        let store = RefreshTokenStore::default();
        let r1 = issue_sample(&store, 3600);
        let r2 = store.rotate(&r1.id, 3600).unwrap();

        // Replay of the retired r1
        assert_eq!(store.rotate(&r1.id, 3600), Err(RefreshError::Replayed));
        // The fresh r2 is now dead too
        assert_eq!(store.rotate(&r2.id, 3600), Err(RefreshError::Replayed));
    }

    #[test]
    fn unknown_and_expired_tokens_are_invalid() {
        let store = RefreshTokenStore::default();
        assert_eq!(store.rotate("nope", 3600), Err(RefreshError::Invalid));

        let expired = issue_sample(&store, -1);
        assert_eq!(store.rotate(&expired.id, 3600), Err(RefreshError::Invalid));
    }

    #[test]
    fn revoke_family_kills_every_member() {
        let store = RefreshTokenStore::default();
        let r1 = issue_sample(&store, 3600);
        let r2 = store.rotate(&r1.id, 3600).unwrap();
        let r3 = store.rotate(&r2.id, 3600).unwrap();

        store.revoke_family(&r1.family_id);
        assert_eq!(store.rotate(&r3.id, 3600), Err(RefreshError::Replayed));
    }

    #[test]
    fn families_are_independent() {
        let store = RefreshTokenStore::default();
        let a1 = issue_sample(&store, 3600);
        let b1 = issue_sample(&store, 3600);

        let a2 = store.rotate(&a1.id, 3600).unwrap();
        assert_eq!(store.rotate(&a1.id, 3600), Err(RefreshError::Replayed));
        assert_eq!(store.rotate(&a2.id, 3600), Err(RefreshError::Replayed));

        // Family B is untouched by A's replay
        assert!(store.rotate(&b1.id, 3600).is_ok());
    }

    #[test]
    fn concurrent_rotation_of_the_same_token_has_one_winner() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(RefreshTokenStore::default());
        let r1 = issue_sample(&store, 3600);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = r1.id.clone();
                thread::spawn(move || store.rotate(&id, 3600).is_ok())
            })
            .collect();

        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|&b| b).count();
        assert!(winners <= 1);
    }

    #[test]
    fn sweep_drops_expired_tokens_and_empty_families() {
        let store = RefreshTokenStore::default();
        let dead = issue_sample(&store, -10);
        let live = issue_sample(&store, 3600);

        store.sweep();
        assert_eq!(store.len(), 1);
        assert!(store.lookup(&dead.id).is_none());
        assert!(store.lookup(&live.id).is_some());
    }
}
