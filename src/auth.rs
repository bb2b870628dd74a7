//
// JWT Handling
//
use std::sync::LazyLock;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use serde_json::{Map, Value};

use crate::{
    config::{MAX_SESSION_TTL, MAX_TOKEN_TTL},
    err_handler,
    error::{Error, ErrorKind, MapResult},
    util::read_file,
    CONFIG,
};

// Accepted clock skew on incoming `exp`/`nbf`/`iat` values
pub const CLOCK_SKEW_SECONDS: i64 = 60;

// Login challenges only have to survive a login form round trip
pub const CHALLENGE_TTL_SECONDS: i64 = 10 * 60;

pub static JWT_ISSUER: LazyLock<String> = LazyLock::new(|| CONFIG.domain());
static JWT_SSO_ISSUER: LazyLock<String> = LazyLock::new(|| format!("{}|sso", CONFIG.domain()));
static JWT_CHALLENGE_ISSUER: LazyLock<String> = LazyLock::new(|| format!("{}|challenge", CONFIG.domain()));

static JWT_HEADER: LazyLock<Header> = LazyLock::new(|| Header::new(jwt_algorithm()));

static PRIVATE_KEY: LazyLock<EncodingKey> = LazyLock::new(|| match CONFIG.private_rsa_key() {
    Some(path) => {
        let pem = read_file(&path).unwrap_or_else(|e| panic!("Error loading private RSA key.\n{e:?}"));
        EncodingKey::from_rsa_pem(&pem).unwrap_or_else(|e| panic!("Error decoding private RSA key.\n{e}"))
    }
    None => EncodingKey::from_secret(CONFIG.jwt_secret().as_bytes()),
});

static PUBLIC_KEY: LazyLock<DecodingKey> = LazyLock::new(|| match CONFIG.public_rsa_key() {
    Some(path) => {
        let pem = read_file(&path).unwrap_or_else(|e| panic!("Error loading public RSA key.\n{e:?}"));
        DecodingKey::from_rsa_pem(&pem).unwrap_or_else(|e| panic!("Error decoding public RSA key.\n{e}"))
    }
    None => DecodingKey::from_secret(CONFIG.jwt_secret().as_bytes()),
});

/// The signing algorithm is selected by key material presence: RS256 when a
/// PEM pair is configured, HS256 otherwise. `alg: none` is unrepresentable.
pub fn jwt_algorithm() -> Algorithm {
    if CONFIG.uses_rsa_keys() {
        Algorithm::RS256
    } else {
        Algorithm::HS256
    }
}

pub fn load_keys() {
    LazyLock::force(&PRIVATE_KEY);
    LazyLock::force(&PUBLIC_KEY);
}

pub fn encode_jwt<T: Serialize>(claims: &T) -> Result<String, Error> {
    jsonwebtoken::encode(&JWT_HEADER, claims, &PRIVATE_KEY).map_res("Error encoding JWT")
}

fn decode_jwt<T: DeserializeOwned>(token: &str, issuer: String) -> Result<T, Error> {
    let mut validation = jsonwebtoken::Validation::new(jwt_algorithm());
    validation.leeway = CLOCK_SKEW_SECONDS as u64;
    validation.validate_nbf = true;
    validation.validate_aud = false;
    validation.set_issuer(&[issuer]);

    let token = token.replace(char::is_whitespace, "");
    match jsonwebtoken::decode(&token, &PUBLIC_KEY, &validation) {
        Ok(data) => Ok(data.claims),
        Err(e) => Err(Error::with_log(ErrorKind::InvalidGrant, "token is invalid", format!("JWT rejected: {e}")).silent()),
    }
}

//
// Token claims
//

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    // Space separated, RFC 6749 style
    pub scope: String,
    pub tenant: String,
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl AccessTokenClaims {
    pub fn new(sub: &str, aud: &str, tenant: &str, ttl: i64, scope: &[String], claims: Map<String, Value>) -> Self {
        let now = Utc::now().timestamp();
        AccessTokenClaims {
            iss: JWT_ISSUER.to_string(),
            sub: sub.to_string(),
            aud: aud.to_string(),
            iat: now,
            exp: now + ttl,
            scope: scope.join(" "),
            tenant: tenant.to_string(),
            claims,
        }
    }

    pub fn scope_vec(&self) -> Vec<String> {
        self.scope.split_whitespace().map(str::to_string).collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub tenant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl IdTokenClaims {
    pub fn new(sub: &str, aud: &str, tenant: &str, ttl: i64, nonce: Option<String>, claims: Map<String, Value>) -> Self {
        let now = Utc::now().timestamp();
        IdTokenClaims {
            iss: JWT_ISSUER.to_string(),
            sub: sub.to_string(),
            aud: aud.to_string(),
            iat: now,
            exp: now + ttl,
            tenant: tenant.to_string(),
            nonce,
            claims,
        }
    }
}

/// Refuses to sign a token whose lifetime exceeds the component ceiling.
fn enforce_ceiling(iat: i64, exp: i64, ceiling: i64) -> Result<(), Error> {
    if exp - iat > ceiling + CLOCK_SKEW_SECONDS {
        return Err(Error::new(ErrorKind::ServerError, format!("refusing to sign token with lifetime {}s", exp - iat)));
    }
    Ok(())
}

pub fn encode_access_token(claims: &AccessTokenClaims) -> Result<String, Error> {
    enforce_ceiling(claims.iat, claims.exp, MAX_TOKEN_TTL)?;
    encode_jwt(claims)
}

pub fn encode_id_token(claims: &IdTokenClaims) -> Result<String, Error> {
    enforce_ceiling(claims.iat, claims.exp, MAX_TOKEN_TTL)?;
    encode_jwt(claims)
}

pub fn decode_access_token(token: &str) -> Result<AccessTokenClaims, Error> {
    let claims: AccessTokenClaims = decode_jwt(token, JWT_ISSUER.to_string())?;
    // jsonwebtoken checks exp/nbf, `iat` from the future is on us
    if claims.iat > Utc::now().timestamp() + CLOCK_SKEW_SECONDS {
        return Err(Error::new(ErrorKind::InvalidGrant, "token issued in the future").silent());
    }
    Ok(claims)
}

//
// SSO cookie claims, see session.rs for the cookie handling itself
//

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SsoCookieClaims {
    pub nbf: i64,
    pub exp: i64,
    pub iss: String,
    // Subject as returned by the credential validator
    pub sub: String,
    // Session id, minted once and kept across sliding rotations
    pub sid: String,
    pub tenant: String,
    // Responsibility hash the cookie was minted under
    pub hash: String,
    // Validator claims, carried so silent re-issuance can mint complete
    // tokens without re-running the validator
    #[serde(default)]
    pub claims: Map<String, Value>,
}

impl SsoCookieClaims {
    pub fn new(subject: &str, tenant: &str, hash: &str, ttl: i64, claims: Map<String, Value>) -> Self {
        let now = Utc::now().timestamp();
        SsoCookieClaims {
            nbf: now,
            exp: now + ttl.clamp(1, MAX_SESSION_TTL),
            iss: JWT_SSO_ISSUER.to_string(),
            sub: subject.to_string(),
            sid: uuid::Uuid::new_v4().to_string(),
            tenant: tenant.to_string(),
            hash: hash.to_string(),
            claims,
        }
    }

    /// Sliding rotation: same session, fresh window.
    pub fn rotated(&self, ttl: i64) -> Self {
        let now = Utc::now().timestamp();
        let mut rotated = self.clone();
        rotated.nbf = now;
        rotated.exp = now + ttl.clamp(1, MAX_SESSION_TTL);
        rotated
    }
}

pub fn encode_sso_cookie(claims: &SsoCookieClaims) -> Result<String, Error> {
    encode_jwt(claims)
}

pub fn decode_sso_cookie(token: &str) -> Result<SsoCookieClaims, Error> {
    decode_jwt(token, JWT_SSO_ISSUER.to_string())
}

//
// Login challenge, travels as the signed `location` form value
//

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginChallengeClaims {
    pub exp: i64,
    pub iss: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Vec<String>,
    pub state: String,
    pub response_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    // Original request uri, re-rendered into the login form on failure
    pub return_location: String,
    pub mode: String,
}

pub fn encode_login_challenge(mut claims: LoginChallengeClaims) -> Result<String, Error> {
    claims.exp = Utc::now().timestamp() + CHALLENGE_TTL_SECONDS;
    claims.iss = JWT_CHALLENGE_ISSUER.to_string();
    encode_jwt(&claims)
}

pub fn decode_login_challenge(token: &str) -> Result<LoginChallengeClaims, Error> {
    decode_jwt(token, JWT_CHALLENGE_ISSUER.to_string())
}

//
// Request guards
//
use rocket::request::{FromRequest, Outcome, Request};

use crate::registry::{Tenant, REGISTRY};
use crate::session;

/// Pre-resolved `(tenant, responsibility hash)` for the current request.
/// Computed once and cached on the request so downstream handlers never
/// recompute or disagree.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub host: String,
    pub tenant: Option<Tenant>,
    pub responsibility_hash: Option<String>,
}

impl RequestContext {
    fn resolve(host: &str) -> Self {
        let tenant = REGISTRY.lookup_tenant(host);
        let responsibility_hash = tenant.as_ref().map(|t| session::responsibility_hash(t, host));
        RequestContext {
            host: host.to_string(),
            tenant,
            responsibility_hash,
        }
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestContext {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let context = request.local_cache(|| {
            let headers = request.headers();
            let host = headers
                .get_one("X-Forwarded-Host")
                .or_else(|| headers.get_one("Host"))
                .unwrap_or_default();
            RequestContext::resolve(host)
        });

        Outcome::Success(context.clone())
    }
}

/// Raw bearer token from the `Authorization` header. Used as
/// `Option<BearerToken>` so the handler controls the 401 challenge.
pub struct BearerToken(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BearerToken {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match request.headers().get_one("Authorization").and_then(|a| a.strip_prefix("Bearer ")) {
            Some(token) if !token.is_empty() => Outcome::Success(BearerToken(token.to_string())),
            _ => err_handler!("No access token provided"),
        }
    }
}

//
// Client IP address detection
//
use std::net::IpAddr;

pub struct ClientIp {
    pub ip: IpAddr,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = if CONFIG._ip_header_enabled() {
            req.headers().get_one(&CONFIG.ip_header()).and_then(|ip| {
                match ip.find(',') {
                    Some(idx) => &ip[..idx],
                    None => ip,
                }
                .parse()
                .map_err(|_| warn!("'{}' header is malformed: {}", CONFIG.ip_header(), ip))
                .ok()
            })
        } else {
            None
        };

        let ip = ip.or_else(|| req.remote().map(|r| r.ip())).unwrap_or_else(|| "0.0.0.0".parse().unwrap());

        Outcome::Success(ClientIp {
            ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_access_claims(ttl: i64) -> AccessTokenClaims {
        let mut claims = Map::new();
        claims.insert("email".to_string(), Value::String("alice@acme.test".to_string()));
        AccessTokenClaims::new("alice", "app1", "acme", ttl, &["openid".to_string(), "email".to_string()], claims)
    }

    #[test]
    fn access_token_roundtrip() {
        let claims = sample_access_claims(600);
        let token = encode_access_token(&claims).unwrap();
        let decoded = decode_access_token(&token).unwrap();

        assert_eq!(decoded.sub, "alice");
        assert_eq!(decoded.aud, "app1");
        assert_eq!(decoded.tenant, "acme");
        assert_eq!(decoded.scope_vec(), vec!["openid", "email"]);
        assert_eq!(decoded.claims.get("email").and_then(Value::as_str), Some("alice@acme.test"));
        assert!(decoded.exp - decoded.iat <= MAX_TOKEN_TTL);
    }

    #[test]
    fn encoder_refuses_excessive_lifetime() {
        let claims = sample_access_claims(MAX_TOKEN_TTL + 3600);
        assert!(encode_access_token(&claims).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut claims = sample_access_claims(600);
        claims.iat -= 7200;
        claims.exp = claims.iat + 600;
        let token = encode_jwt(&claims).unwrap();
        assert!(decode_access_token(&token).is_err());
    }

    #[test]
    fn future_iat_is_rejected() {
        let mut claims = sample_access_claims(600);
        claims.iat += 3600;
        claims.exp = claims.iat + 600;
        let token = encode_jwt(&claims).unwrap();
        assert!(decode_access_token(&token).is_err());
    }

    #[test]
    fn issuer_mismatch_is_rejected() {
        let mut claims = sample_access_claims(600);
        claims.iss = "https://somebody-else.example".to_string();
        let token = encode_jwt(&claims).unwrap();
        assert!(decode_access_token(&token).is_err());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let claims = sample_access_claims(600);
        let token = encode_access_token(&claims).unwrap();
        let mut tampered = token.clone();
        tampered.truncate(token.len() - 4);
        tampered.push_str("AAAA");
        assert!(decode_access_token(&tampered).is_err());
    }

    #[test]
    fn login_challenge_roundtrip() {
        let challenge = LoginChallengeClaims {
            exp: 0,
            iss: String::new(),
            client_id: "app1".to_string(),
            redirect_uri: "https://app1.acme.test/cb".to_string(),
            scope: vec!["openid".to_string()],
            state: "xyz".to_string(),
            response_type: "code".to_string(),
            code_challenge: Some("E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".to_string()),
            code_challenge_method: Some("S256".to_string()),
            nonce: None,
            return_location: "/authorize?client_id=app1".to_string(),
            mode: "interactive".to_string(),
        };

        let encoded = encode_login_challenge(challenge.clone()).unwrap();
        let decoded = decode_login_challenge(&encoded).unwrap();
        assert_eq!(decoded.client_id, "app1");
        assert_eq!(decoded.state, "xyz");
        assert_eq!(decoded.code_challenge_method.as_deref(), Some("S256"));

        // Challenges are not SSO cookies and vice versa
        assert!(decode_sso_cookie(&encoded).is_err());
    }
}
