//
// Credential validator adapter. The only place that sees plaintext
// credentials; they are compared, never stored and never logged. A slow
// validator is a denial of service, so every call runs under a per-tenant
// timeout and concurrency cap.
//
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use dashmap::DashMap;
use regex::Regex;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::{
    crypto,
    error::{Error, ErrorKind},
    registry::{PatternRule, StaticUser, Tenant},
    CONFIG,
};

/// Successful validation: the subject to bind tokens to plus whatever
/// claims the tenant's validator asserts about the user.
#[derive(Clone, Debug)]
pub struct Validation {
    pub subject: String,
    pub claims: Map<String, Value>,
}

#[rocket::async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, username: &str, password: &str) -> Result<Validation, Error>;
}

fn denied() -> Error {
    Error::new(ErrorKind::AccessDenied, "invalid username or password").silent()
}

fn claims_object(claims: &Option<Value>) -> Map<String, Value> {
    match claims {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Static allow-list validator. Passwords are either argon2 PHC hashes or,
/// for test fixtures, plain text compared in constant time.
pub struct StaticListValidator {
    users: Vec<StaticUser>,
}

impl StaticListValidator {
    pub fn new(users: Vec<StaticUser>) -> Self {
        StaticListValidator {
            users,
        }
    }

    fn password_matches(user: &StaticUser, password: &str) -> bool {
        if let Some(hash) = &user.password_hash {
            return PasswordHash::new(hash)
                .map(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
                .unwrap_or(false);
        }
        if let Some(plain) = &user.password {
            return crypto::ct_eq(plain, password);
        }
        false
    }
}

#[rocket::async_trait]
impl Validator for StaticListValidator {
    async fn validate(&self, username: &str, password: &str) -> Result<Validation, Error> {
        let user = self.users.iter().find(|u| u.username == username).ok_or_else(denied)?;

        if !Self::password_matches(user, password) {
            return Err(denied());
        }

        Ok(Validation {
            subject: user.subject.clone().unwrap_or_else(|| user.username.clone()),
            claims: claims_object(&user.claims),
        })
    }
}

/// Pattern validator: a user-defined predicate expressed as regexes over
/// the submitted credentials. The first matching rule wins.
pub struct PatternValidator {
    rules: Vec<(Regex, Option<Regex>, Option<Value>)>,
}

impl PatternValidator {
    pub fn new(rules: &[PatternRule]) -> Result<Self, Error> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let username_pattern = Regex::new(&rule.username_pattern)
                .map_err(|e| Error::new(ErrorKind::ServerError, format!("invalid username_pattern: {e}")))?;
            let password_pattern = match &rule.password_pattern {
                Some(pattern) => Some(
                    Regex::new(pattern)
                        .map_err(|e| Error::new(ErrorKind::ServerError, format!("invalid password_pattern: {e}")))?,
                ),
                None => None,
            };
            compiled.push((username_pattern, password_pattern, rule.claims.clone()));
        }
        Ok(PatternValidator {
            rules: compiled,
        })
    }
}

#[rocket::async_trait]
impl Validator for PatternValidator {
    async fn validate(&self, username: &str, password: &str) -> Result<Validation, Error> {
        for (username_pattern, password_pattern, claims) in &self.rules {
            if !username_pattern.is_match(username) {
                continue;
            }
            if let Some(password_pattern) = password_pattern {
                if !password_pattern.is_match(password) {
                    continue;
                }
            }
            return Ok(Validation {
                subject: username.to_string(),
                claims: claims_object(claims),
            });
        }
        Err(denied())
    }
}

//
// Per-tenant gating
//

static GATES: LazyLock<DashMap<String, Arc<Semaphore>>> = LazyLock::new(DashMap::new);

fn tenant_gate(tenant: &Tenant) -> Arc<Semaphore> {
    let cap = tenant.validator.concurrency.unwrap_or_else(|| CONFIG.validator_concurrency()).max(1);
    Arc::clone(
        &GATES
            .entry(tenant.name.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(cap))),
    )
}

async fn run_validators(tenant: &Tenant, username: &str, password: &str) -> Result<Validation, Error> {
    if !tenant.validator.users.is_empty() {
        let validator = StaticListValidator::new(tenant.validator.users.clone());
        if let Ok(validation) = validator.validate(username, password).await {
            return Ok(validation);
        }
    }

    if !tenant.validator.patterns.is_empty() {
        let validator = PatternValidator::new(&tenant.validator.patterns)?;
        if let Ok(validation) = validator.validate(username, password).await {
            return Ok(validation);
        }
    }

    Err(denied())
}

/// Entry point used by the flow engine. Applies the per-tenant concurrency
/// cap (fail-fast with `rate_limited`) and timeout before invoking the
/// tenant's validators.
pub async fn validate_credentials(tenant: &Tenant, username: &str, password: &str) -> Result<Validation, Error> {
    let gate = tenant_gate(tenant);
    let _permit = match gate.try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            return Err(Error::with_log(
                ErrorKind::RateLimited,
                "too many pending login attempts",
                format!("validator concurrency cap reached for tenant `{}`", tenant.name),
            ))
        }
    };

    let seconds = tenant.validator.timeout_seconds.unwrap_or_else(|| CONFIG.validator_timeout_seconds());
    match timeout(Duration::from_secs(seconds), run_validators(tenant, username, password)).await {
        Ok(result) => result,
        Err(_) => Err(Error::with_log(
            ErrorKind::TemporarilyUnavailable,
            "credential validation timed out",
            format!("validator for tenant `{}` exceeded {seconds}s", tenant.name),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::registry_with_fixture;
    use serde_json::json;

    #[rocket::async_test]
    async fn static_list_accepts_known_user() {
        let registry = registry_with_fixture();
        let tenant = registry.lookup_tenant_by_name("acme").unwrap();

        let validation = validate_credentials(&tenant, "alice", "good").await.unwrap();
        assert_eq!(validation.subject, "alice");
        assert_eq!(validation.claims.get("email"), Some(&json!("alice@acme.test")));
    }

    #[rocket::async_test]
    async fn static_list_rejects_wrong_password_and_unknown_user() {
        let registry = registry_with_fixture();
        let tenant = registry.lookup_tenant_by_name("acme").unwrap();

        let err = validate_credentials(&tenant, "alice", "wrong").await.unwrap_err();
        assert_eq!(err.wire_label(), "access_denied");

        let err = validate_credentials(&tenant, "nobody", "good").await.unwrap_err();
        assert_eq!(err.wire_label(), "access_denied");
    }

    #[rocket::async_test]
    async fn argon2_hashes_are_verified() {
        use argon2::password_hash::{rand_core::OsRng, SaltString};
        use argon2::PasswordHasher;

        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default().hash_password(b"hunter2", &salt).unwrap().to_string();

        let validator = StaticListValidator::new(vec![StaticUser {
            username: "bob".to_string(),
            password: None,
            password_hash: Some(hash),
            subject: Some("user-bob".to_string()),
            claims: None,
        }]);

        let validation = validator.validate("bob", "hunter2").await.unwrap();
        assert_eq!(validation.subject, "user-bob");
        assert!(validator.validate("bob", "wrong").await.is_err());
    }

    #[rocket::async_test]
    async fn pattern_rules_match_both_credentials() {
        let registry = registry_with_fixture();
        let tenant = registry.lookup_tenant_by_name("globex").unwrap();

        let validation = validate_credentials(&tenant, "carol@globex.test", "anything").await.unwrap();
        assert_eq!(validation.subject, "carol@globex.test");

        let err = validate_credentials(&tenant, "carol@elsewhere.test", "anything").await.unwrap_err();
        assert_eq!(err.wire_label(), "access_denied");
    }

    #[rocket::async_test]
    async fn concurrency_cap_fails_fast() {
        let registry = registry_with_fixture();
        let mut tenant = registry.lookup_tenant_by_name("acme").unwrap();
        tenant.name = "acme-cap-test".to_string();
        tenant.validator.concurrency = Some(1);

        // Hold the single permit, the next caller must not queue
        let gate = tenant_gate(&tenant);
        let _held = gate.try_acquire_owned().unwrap();

        let err = validate_credentials(&tenant, "alice", "good").await.unwrap_err();
        assert_eq!(err.wire_label(), "rate_limited");

        drop(_held);
        assert!(validate_credentials(&tenant, "alice", "good").await.is_ok());
    }
}
