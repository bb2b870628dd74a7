//
// Scope and claim resolution. Scopes narrow through three allow-lists,
// claims narrow through the tenant allow-list and the granted scopes.
//
use serde_json::{Map, Value};

use crate::{
    error::{Error, ErrorKind},
    registry::{Client, Tenant},
};

// Standard OIDC scope to claim projection
const EMAIL_CLAIMS: &[&str] = &["email", "email_verified"];
const PROFILE_CLAIMS: &[&str] = &[
    "name",
    "family_name",
    "given_name",
    "middle_name",
    "nickname",
    "preferred_username",
    "picture",
    "website",
    "gender",
    "birthdate",
    "zoneinfo",
    "locale",
    "updated_at",
];
const PHONE_CLAIMS: &[&str] = &["phone_number", "phone_number_verified"];
const ADDRESS_CLAIMS: &[&str] = &["address"];

// Claims the server mints itself; a validator can never override them
const RESERVED_CLAIMS: &[&str] = &["iss", "sub", "aud", "exp", "iat", "nbf", "jti", "scope", "tenant", "nonce", "sid"];

pub fn parse_scope(raw: Option<&str>) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    for scope in raw.unwrap_or_default().split_whitespace() {
        if !scopes.iter().any(|s| s == scope) {
            scopes.push(scope.to_string());
        }
    }
    scopes
}

/// Final scope = requested ∩ client.allowed_scopes ∩ tenant.allowed_scopes.
/// An omitted scope parameter asks for everything the client may have. An
/// empty intersection is `invalid_scope`.
pub fn resolve_scopes(requested: &[String], client: &Client, tenant: &Tenant) -> Result<Vec<String>, Error> {
    let requested: Vec<String> = if requested.is_empty() {
        client.allowed_scopes.clone()
    } else {
        requested.to_vec()
    };

    let granted: Vec<String> = requested
        .into_iter()
        .filter(|s| client.allowed_scopes.iter().any(|a| a == s))
        .filter(|s| tenant.allowed_scopes.is_empty() || tenant.allowed_scopes.iter().any(|a| a == s))
        .collect();

    if granted.is_empty() {
        return Err(Error::with_log(
            ErrorKind::InvalidScope,
            "requested scope is not available for this client",
            format!("empty scope intersection for client `{}`", client.id),
        ));
    }

    Ok(granted)
}

fn scope_covers_claim(scopes: &[String], claim: &str) -> bool {
    let needs = |scope: &str| scopes.iter().any(|s| s == scope);

    if EMAIL_CLAIMS.contains(&claim) {
        return needs("email");
    }
    if PROFILE_CLAIMS.contains(&claim) {
        return needs("profile");
    }
    if PHONE_CLAIMS.contains(&claim) {
        return needs("phone");
    }
    if ADDRESS_CLAIMS.contains(&claim) {
        return needs("address");
    }
    // Custom claims have no scope gate of their own, the tenant allow-list
    // is the only filter
    true
}

/// Claims emitted into tokens = validator claims ∩ tenant.claim_allow_list,
/// projected by the granted scopes. Reserved JWT claims are dropped.
pub fn project_claims(validator_claims: &Map<String, Value>, tenant: &Tenant, scopes: &[String]) -> Map<String, Value> {
    validator_claims
        .iter()
        .filter(|(name, _)| !RESERVED_CLAIMS.contains(&name.as_str()))
        .filter(|(name, _)| tenant.claim_allow_list.iter().any(|a| a == name.as_str()))
        .filter(|(name, _)| scope_covers_claim(scopes, name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::registry_with_fixture;
    use serde_json::json;

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_scope_splits_and_dedups() {
        assert_eq!(parse_scope(Some("openid email openid")), scopes(&["openid", "email"]));
        assert_eq!(parse_scope(None), Vec::<String>::new());
    }

    #[test]
    fn scope_resolution_is_a_three_way_intersection() {
        let registry = registry_with_fixture();
        let tenant = registry.lookup_tenant_by_name("acme").unwrap();
        let client = registry.lookup_client("app1").unwrap();

        let granted = resolve_scopes(&scopes(&["openid", "email", "admin"]), &client, &tenant).unwrap();
        assert_eq!(granted, scopes(&["openid", "email"]));
    }

    #[test]
    fn empty_intersection_is_invalid_scope() {
        let registry = registry_with_fixture();
        let tenant = registry.lookup_tenant_by_name("acme").unwrap();
        let client = registry.lookup_client("app1").unwrap();

        let err = resolve_scopes(&scopes(&["admin"]), &client, &tenant).unwrap_err();
        assert_eq!(err.wire_label(), "invalid_scope");
    }

    #[test]
    fn omitted_scope_defaults_to_the_client_allow_list() {
        let registry = registry_with_fixture();
        let tenant = registry.lookup_tenant_by_name("acme").unwrap();
        let client = registry.lookup_client("app1").unwrap();

        let granted = resolve_scopes(&[], &client, &tenant).unwrap();
        assert_eq!(granted, client.allowed_scopes);
    }

    #[test]
    fn email_claims_require_the_email_scope() {
        let registry = registry_with_fixture();
        let tenant = registry.lookup_tenant_by_name("acme").unwrap();

        let mut claims = Map::new();
        claims.insert("email".to_string(), json!("alice@acme.test"));
        claims.insert("email_verified".to_string(), json!(true));
        claims.insert("name".to_string(), json!("Alice"));

        let with_email = project_claims(&claims, &tenant, &scopes(&["openid", "email"]));
        assert!(with_email.contains_key("email"));
        assert!(with_email.contains_key("email_verified"));
        // `name` needs the profile scope
        assert!(!with_email.contains_key("name"));

        let without_email = project_claims(&claims, &tenant, &scopes(&["openid"]));
        assert!(without_email.is_empty());
    }

    #[test]
    fn claims_outside_the_tenant_allow_list_never_leak() {
        let registry = registry_with_fixture();
        let tenant = registry.lookup_tenant_by_name("acme").unwrap();

        let mut claims = Map::new();
        claims.insert("email".to_string(), json!("alice@acme.test"));
        claims.insert("internal_flag".to_string(), json!("secret"));

        let projected = project_claims(&claims, &tenant, &scopes(&["email"]));
        assert!(projected.contains_key("email"));
        assert!(!projected.contains_key("internal_flag"));
    }

    #[test]
    fn reserved_claims_cannot_be_overridden() {
        let registry = registry_with_fixture();
        let mut tenant = registry.lookup_tenant_by_name("acme").unwrap();
        tenant.claim_allow_list.push("sub".to_string());

        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!("mallory"));

        let projected = project_claims(&claims, &tenant, &scopes(&["openid"]));
        assert!(projected.is_empty());
    }
}
