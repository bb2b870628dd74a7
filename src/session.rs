//
// SSO cookie manager. The cookie name binds to the responsibility hash so
// cookies issued for one responsibility domain cannot be replayed into
// another; the value is a signed JWT carrying the session.
//
use rocket::http::{Cookie, CookieJar, SameSite};

use crate::{
    auth::{self, SsoCookieClaims},
    crypto,
    error::Error,
    registry::Tenant,
    CONFIG,
};

pub const COOKIE_PREFIX: &str = "uitsmijter-sso-";

/// The domain under whose authority a session is considered valid: the
/// request host minus its leftmost label when there are three or more
/// labels, the host itself otherwise. `login.acme.test` and
/// `shop.acme.test` share `acme.test`.
pub fn responsible_domain(host: &str) -> String {
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
    .to_lowercase();

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 {
        labels[1..].join(".")
    } else {
        host
    }
}

/// Central invariant of the cookie scheme:
/// silent_login binds the cookie to the tenant name, otherwise to the
/// responsibility domain of the request. An unknown tenant never gets here.
pub fn responsibility_hash(tenant: &Tenant, host: &str) -> String {
    let input = if tenant.silent_login {
        tenant.name.clone()
    } else {
        responsible_domain(host)
    };

    if CONFIG.responsibility_hash_sha256() {
        crypto::sha256_hex(&input)
    } else {
        crypto::sha1_hex(&input)
    }
}

pub fn cookie_name(hash: &str) -> String {
    format!("{COOKIE_PREFIX}{hash}")
}

fn build_cookie(tenant: &Tenant, hash: &str, value: String, max_age_seconds: i64) -> Cookie<'static> {
    let mut builder = Cookie::build((cookie_name(hash), value))
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::seconds(max_age_seconds));

    if let Some(domain) = &tenant.cookie_domain {
        builder = builder.domain(domain.clone());
    }

    builder.build()
}

/// Mints a fresh session for `(subject, tenant, hash)` and sets the cookie.
pub fn mint(
    cookies: &CookieJar<'_>,
    subject: &str,
    tenant: &Tenant,
    hash: &str,
    user_claims: serde_json::Map<String, serde_json::Value>,
) -> Result<SsoCookieClaims, Error> {
    let ttl = tenant.session_ttl();
    let claims = SsoCookieClaims::new(subject, &tenant.name, hash, ttl, user_claims);
    let value = auth::encode_sso_cookie(&claims)?;
    cookies.add(build_cookie(tenant, hash, value, ttl));
    debug!("Minted SSO session {} for subject on tenant {}", claims.sid, tenant.name);
    Ok(claims)
}

/// Whether a decoded cookie is acceptable for the current request. Cookies
/// with a foreign responsibility hash or tenant are ignored, not deleted;
/// they may be perfectly valid on their own domain.
fn accept(claims: &SsoCookieClaims, tenant: &Tenant, hash: &str) -> bool {
    crypto::ct_eq(&claims.hash, hash) && claims.tenant == tenant.name
}

/// Picks the cookie whose name matches the responsibility hash, verifies
/// signature, expiry and binding. Returns `None` for anything else.
pub fn parse(cookies: &CookieJar<'_>, tenant: &Tenant, hash: &str) -> Option<SsoCookieClaims> {
    let cookie = cookies.get(&cookie_name(hash))?;
    let claims = auth::decode_sso_cookie(cookie.value()).ok()?;
    accept(&claims, tenant, hash).then_some(claims)
}

/// Stateless sliding rotation: every read hit re-signs the session with a
/// fresh window. The old cookie value is not tracked server-side.
pub fn rotate(cookies: &CookieJar<'_>, tenant: &Tenant, hash: &str, claims: &SsoCookieClaims) -> Result<SsoCookieClaims, Error> {
    let ttl = tenant.session_ttl();
    let rotated = claims.rotated(ttl);
    let value = auth::encode_sso_cookie(&rotated)?;
    cookies.add(build_cookie(tenant, hash, value, ttl));
    Ok(rotated)
}

/// Clears the cookie via `Set-Cookie` with an immediate expiry.
pub fn revoke(cookies: &CookieJar<'_>, hash: &str) {
    cookies.remove(Cookie::build(cookie_name(hash)).path("/"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::registry_with_fixture;

    #[test]
    fn responsible_domain_strips_one_label() {
        assert_eq!(responsible_domain("app1.acme.test"), "acme.test");
        assert_eq!(responsible_domain("deep.app1.acme.test"), "app1.acme.test");
        assert_eq!(responsible_domain("acme.test"), "acme.test");
        assert_eq!(responsible_domain("localhost"), "localhost");
        assert_eq!(responsible_domain("ID.Acme.Test:8443"), "acme.test");
    }

    #[test]
    fn silent_login_binds_hash_to_tenant_name() {
        let registry = registry_with_fixture();
        let acme = registry.lookup_tenant_by_name("acme").unwrap();
        assert!(acme.silent_login);
        // Hash does not depend on which tenant host served the request
        assert_eq!(responsibility_hash(&acme, "id.acme.test"), responsibility_hash(&acme, "login.acme.test"));
        assert_eq!(responsibility_hash(&acme, "id.acme.test"), crypto::sha1_hex("acme"));
    }

    #[test]
    fn non_silent_tenant_binds_hash_to_responsible_domain() {
        let registry = registry_with_fixture();
        let globex = registry.lookup_tenant_by_name("globex").unwrap();
        assert_eq!(responsibility_hash(&globex, "id.globex.test"), crypto::sha1_hex("globex.test"));
    }

    #[test]
    fn cookie_name_carries_the_hash() {
        let registry = registry_with_fixture();
        let acme = registry.lookup_tenant_by_name("acme").unwrap();
        let hash = responsibility_hash(&acme, "id.acme.test");
        assert_eq!(cookie_name(&hash), format!("uitsmijter-sso-{hash}"));
    }

    #[test]
    fn foreign_responsibility_hash_is_ignored() {
        let registry = registry_with_fixture();
        let acme = registry.lookup_tenant_by_name("acme").unwrap();
        let globex = registry.lookup_tenant_by_name("globex").unwrap();

        let acme_hash = responsibility_hash(&acme, "id.acme.test");
        let globex_hash = responsibility_hash(&globex, "id.globex.test");

        let claims = SsoCookieClaims::new("alice", &acme.name, &acme_hash, 600, Default::default());
        assert!(accept(&claims, &acme, &acme_hash));
        assert!(!accept(&claims, &globex, &globex_hash));
    }

    #[test]
    fn tenant_mismatch_is_rejected_even_with_matching_hash() {
        let registry = registry_with_fixture();
        let acme = registry.lookup_tenant_by_name("acme").unwrap();
        let globex = registry.lookup_tenant_by_name("globex").unwrap();

        let hash = responsibility_hash(&acme, "id.acme.test");
        // A forged cookie naming another tenant under our hash
        let claims = SsoCookieClaims::new("mallory", &globex.name, &hash, 600, Default::default());
        assert!(!accept(&claims, &acme, &hash));
    }

    #[test]
    fn rotation_keeps_the_session_id() {
        let claims = SsoCookieClaims::new("alice", "acme", "beef", 600, Default::default());
        let rotated = claims.rotated(600);
        assert_eq!(claims.sid, rotated.sid);
        assert_eq!(claims.sub, rotated.sub);
        assert!(rotated.nbf >= claims.nbf);
    }
}
