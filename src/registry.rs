//
// Tenant and client registry. A read-only snapshot loaded from a JSON
// document, swapped wholesale so no request observes half an update.
//
use std::sync::{LazyLock, RwLock};

use serde::Deserialize;
use serde_json::Value;

use crate::{
    config::{CONFIG, MAX_CODE_TTL, MAX_REFRESH_TTL, MAX_SESSION_TTL, MAX_TOKEN_TTL},
    error::{Error, ErrorKind},
};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::default);

#[derive(Clone, Debug, Default, Deserialize, serde::Serialize)]
pub struct TenantInformations {
    #[serde(default)]
    pub imprint_url: Option<String>,
    #[serde(default)]
    pub privacy_url: Option<String>,
    #[serde(default)]
    pub register_url: Option<String>,
}

/// A user entry of the static allow-list validator. `password_hash` is an
/// argon2 PHC string; `password` is plain text and only meant for test
/// fixtures.
#[derive(Clone, Debug, Deserialize)]
pub struct StaticUser {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub claims: Option<Value>,
}

/// A rule of the pattern validator: both regexes must match the submitted
/// credentials for the rule to grant access.
#[derive(Clone, Debug, Deserialize)]
pub struct PatternRule {
    pub username_pattern: String,
    #[serde(default)]
    pub password_pattern: Option<String>,
    #[serde(default)]
    pub claims: Option<Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default)]
    pub users: Vec<StaticUser>,
    #[serde(default)]
    pub patterns: Vec<PatternRule>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Tenant {
    pub name: String,
    pub hosts: Vec<String>,
    #[serde(default)]
    pub silent_login: bool,
    #[serde(default)]
    pub informations: Option<TenantInformations>,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub token_ttl: Option<i64>,
    #[serde(default)]
    pub refresh_ttl: Option<i64>,
    #[serde(default)]
    pub code_ttl: Option<i64>,
    #[serde(default)]
    pub session_ttl: Option<i64>,
    #[serde(default)]
    pub claim_allow_list: Vec<String>,
    // Empty means no tenant-level restriction beyond the client allow-list
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
    #[serde(default)]
    pub allow_password_grant: bool,
    #[serde(default)]
    pub cookie_domain: Option<String>,
}

impl Tenant {
    pub fn token_ttl(&self) -> i64 {
        self.token_ttl.unwrap_or_else(|| CONFIG.token_ttl()).clamp(1, MAX_TOKEN_TTL)
    }

    pub fn refresh_ttl(&self) -> i64 {
        self.refresh_ttl.unwrap_or_else(|| CONFIG.refresh_ttl()).clamp(1, MAX_REFRESH_TTL)
    }

    pub fn code_ttl(&self) -> i64 {
        self.code_ttl.unwrap_or_else(|| CONFIG.code_ttl()).clamp(1, MAX_CODE_TTL)
    }

    pub fn session_ttl(&self) -> i64 {
        self.session_ttl.unwrap_or_else(|| CONFIG.session_ttl()).clamp(1, MAX_SESSION_TTL)
    }
}

fn default_grant_types() -> Vec<String> {
    vec!["authorization_code".to_string(), "refresh_token".to_string()]
}

#[derive(Clone, Debug, Deserialize)]
pub struct Client {
    pub id: String,
    #[serde(default)]
    pub secret: Option<String>,
    pub tenant_name: String,
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub post_logout_redirect_uris: Vec<String>,
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
    #[serde(default)]
    pub require_pkce: bool,
    #[serde(default = "default_grant_types")]
    pub allowed_grant_types: Vec<String>,
}

impl Client {
    pub fn is_public(&self) -> bool {
        self.secret.is_none()
    }

    // Public clients always need PKCE, confidential ones opt in
    pub fn pkce_required(&self) -> bool {
        self.is_public() || self.require_pkce
    }

    pub fn allows_grant(&self, grant_type: &str) -> bool {
        self.allowed_grant_types.iter().any(|g| g == grant_type)
    }

    /// Exact-match only. Prefix or pattern matching on redirect targets is a
    /// known OAuth vulnerability class.
    pub fn allows_redirect(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == uri)
    }

    pub fn allows_post_logout_redirect(&self, uri: &str) -> bool {
        self.post_logout_redirect_uris.iter().any(|u| u == uri)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub tenants: Vec<Tenant>,
    #[serde(default)]
    pub clients: Vec<Client>,
}

impl RegistrySnapshot {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let snapshot: RegistrySnapshot = serde_json::from_str(json)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn validate(&self) -> Result<(), Error> {
        for client in &self.clients {
            if !self.tenants.iter().any(|t| t.name == client.tenant_name) {
                return Err(Error::new(
                    ErrorKind::ServerError,
                    format!("client `{}` references unknown tenant `{}`", client.id, client.tenant_name),
                ));
            }
            if client.redirect_uris.is_empty() {
                return Err(Error::new(
                    ErrorKind::ServerError,
                    format!("client `{}` has no redirect_uris", client.id),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistrySnapshot>,
}

/// The `Host` header may carry a port, tenant hosts are stored without one.
fn normalize_host(host: &str) -> String {
    host.rsplit_once(':').map_or(host, |(name, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            name
        } else {
            host
        }
    })
    .to_lowercase()
}

impl Registry {
    /// Atomic snapshot swap; readers either see the old or the new world.
    pub fn swap(&self, snapshot: RegistrySnapshot) {
        let mut inner = self.inner.write().unwrap();
        *inner = snapshot;
    }

    pub fn load_from_file(&self, path: &str) -> Result<(), Error> {
        let json = std::fs::read_to_string(path)?;
        let snapshot = RegistrySnapshot::from_json(&json)?;
        info!(
            "Loaded registry from {path}: {} tenant(s), {} client(s)",
            snapshot.tenants.len(),
            snapshot.clients.len()
        );
        self.swap(snapshot);
        Ok(())
    }

    pub fn lookup_tenant(&self, host: &str) -> Option<Tenant> {
        let host = normalize_host(host);
        let inner = self.inner.read().unwrap();
        inner.tenants.iter().find(|t| t.hosts.iter().any(|h| normalize_host(h) == host)).cloned()
    }

    pub fn lookup_tenant_by_name(&self, name: &str) -> Option<Tenant> {
        let inner = self.inner.read().unwrap();
        inner.tenants.iter().find(|t| t.name == name).cloned()
    }

    pub fn lookup_client(&self, client_id: &str) -> Option<Client> {
        let inner = self.inner.read().unwrap();
        inner.clients.iter().find(|c| c.id == client_id).cloned()
    }

    pub fn clients_for_tenant(&self, tenant_name: &str) -> Vec<Client> {
        let inner = self.inner.read().unwrap();
        inner.clients.iter().filter(|c| c.tenant_name == tenant_name).cloned().collect()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub const FIXTURE: &str = r#"{
        "tenants": [
            {
                "name": "acme",
                "hosts": ["id.acme.test", "login.acme.test"],
                "silent_login": true,
                "claim_allow_list": ["email", "email_verified", "name"],
                "validator": {
                    "users": [
                        {"username": "alice", "password": "good", "claims": {"email": "alice@acme.test", "email_verified": true, "name": "Alice"}}
                    ]
                }
            },
            {
                "name": "globex",
                "hosts": ["id.globex.test"],
                "silent_login": false,
                "allow_password_grant": true,
                "validator": {
                    "patterns": [{"username_pattern": "^.+@globex\\.test$"}]
                }
            }
        ],
        "clients": [
            {
                "id": "app1",
                "secret": "s3cret",
                "tenant_name": "acme",
                "redirect_uris": ["https://app1.acme.test/cb"],
                "post_logout_redirect_uris": ["https://app1.acme.test/"],
                "allowed_scopes": ["openid", "email", "profile"]
            },
            {
                "id": "app2",
                "tenant_name": "acme",
                "redirect_uris": ["https://app2.acme.test/cb"],
                "allowed_scopes": ["openid", "email"]
            },
            {
                "id": "gbx",
                "secret": "other",
                "tenant_name": "globex",
                "redirect_uris": ["https://app.globex.test/cb"],
                "allowed_scopes": ["openid"],
                "allowed_grant_types": ["authorization_code", "refresh_token", "password"]
            }
        ]
    }"#;

    pub fn registry_with_fixture() -> Registry {
        let registry = Registry::default();
        registry.swap(RegistrySnapshot::from_json(FIXTURE).unwrap());
        registry
    }

    #[test]
    fn lookup_tenant_matches_any_host_ignoring_port() {
        let registry = registry_with_fixture();
        assert_eq!(registry.lookup_tenant("id.acme.test").unwrap().name, "acme");
        assert_eq!(registry.lookup_tenant("LOGIN.ACME.TEST:8443").unwrap().name, "acme");
        assert!(registry.lookup_tenant("id.unknown.test").is_none());
    }

    #[test]
    fn missing_secret_makes_a_client_public() {
        let registry = registry_with_fixture();
        let app1 = registry.lookup_client("app1").unwrap();
        let app2 = registry.lookup_client("app2").unwrap();
        assert!(!app1.is_public());
        assert!(app2.is_public());
        assert!(app2.pkce_required());
    }

    #[test]
    fn redirect_allow_list_is_exact_match() {
        let registry = registry_with_fixture();
        let app1 = registry.lookup_client("app1").unwrap();
        assert!(app1.allows_redirect("https://app1.acme.test/cb"));
        assert!(!app1.allows_redirect("https://app1.acme.test/cb/"));
        assert!(!app1.allows_redirect("https://app1.acme.test/cb?x=1"));
        assert!(!app1.allows_redirect("https://evil.test/"));
    }

    #[test]
    fn unknown_tenant_reference_is_rejected() {
        let json = r#"{
            "tenants": [],
            "clients": [{"id": "x", "tenant_name": "ghost", "redirect_uris": ["https://x/cb"]}]
        }"#;
        assert!(RegistrySnapshot::from_json(json).is_err());
    }

    #[test]
    fn swap_replaces_the_whole_snapshot() {
        let registry = registry_with_fixture();
        registry.swap(RegistrySnapshot::default());
        assert!(registry.lookup_tenant("id.acme.test").is_none());
        assert!(registry.lookup_client("app1").is_none());
    }
}
