//
// The /token endpoint: authorization_code, refresh_token and password
// grants. Works against the stores only; credentials were checked at
// /login except for the password grant.
//
use data_encoding::BASE64;
use rocket::form::Form;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::Route;
use serde_json::{Map, Value};

use crate::{
    api::JsonResult,
    auth::{self, AccessTokenClaims, ClientIp, IdTokenClaims, RequestContext},
    err,
    crypto, ratelimit,
    registry::{Client, Tenant, REGISTRY},
    scope,
    store::{ConsumeError, CODE_STORE, REFRESH_STORE},
    validator,
};

pub fn routes() -> Vec<Route> {
    routes![token]
}

#[derive(FromForm)]
struct TokenForm {
    grant_type: String,

    client_id: Option<String>,
    client_secret: Option<String>,

    // Needed for grant_type="authorization_code"
    code: Option<String>,
    redirect_uri: Option<String>,
    code_verifier: Option<String>,

    // Needed for grant_type="refresh_token"
    refresh_token: Option<String>,

    // Needed for grant_type="password"
    username: Option<String>,
    password: Option<String>,
    scope: Option<String>,
}

/// Client credentials from an `Authorization: Basic` header, RFC 6749 §2.3.1.
struct BasicAuth(Option<(String, String)>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BasicAuth {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let parsed = request
            .headers()
            .get_one("Authorization")
            .and_then(|value| value.strip_prefix("Basic "))
            .and_then(|encoded| BASE64.decode(encoded.as_bytes()).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|pair| {
                pair.split_once(':').map(|(id, secret)| (id.to_string(), secret.to_string()))
            });

        Outcome::Success(BasicAuth(parsed))
    }
}

/// Resolves and authenticates the calling client. Header credentials win
/// over body credentials. Secrets are compared in constant time.
fn authenticate_client(tenant: &Tenant, basic: &BasicAuth, data: &TokenForm) -> Result<Client, crate::error::Error> {
    let (client_id, presented_secret) = match &basic.0 {
        Some((id, secret)) => (id.clone(), Some(secret.clone())),
        None => match &data.client_id {
            Some(id) => (id.clone(), data.client_secret.clone()),
            None => err!(InvalidRequest, "client_id cannot be blank"),
        },
    };

    let Some(client) = REGISTRY.lookup_client(&client_id) else {
        err!(InvalidClient, "client authentication failed", format!("unknown client `{client_id}`"));
    };
    if client.tenant_name != tenant.name {
        err!(InvalidClient, "client authentication failed", format!("client `{client_id}` belongs to another tenant"));
    }

    if let Some(secret) = &client.secret {
        match &presented_secret {
            Some(presented) if crypto::ct_eq(secret, presented) => (),
            _ => err!(InvalidClient, "client authentication failed", format!("bad secret for client `{client_id}`")),
        }
    }

    Ok(client)
}

#[post("/token", data = "<data>")]
async fn token(ctx: RequestContext, ip: ClientIp, basic: BasicAuth, data: Form<TokenForm>) -> JsonResult {
    let data = data.into_inner();

    let client_hint = basic.0.as_ref().map(|(id, _)| id.clone()).or_else(|| data.client_id.clone());
    ratelimit::check_limit_token(&ip.ip, client_hint.as_deref())?;

    let Some(tenant) = ctx.tenant else {
        err!(InvalidRequest, "No tenant is configured for this host");
    };

    match data.grant_type.as_str() {
        "authorization_code" => authorization_code_grant(&tenant, &basic, &data),
        "refresh_token" => refresh_token_grant(&tenant, &basic, &data),
        "password" => password_grant(&tenant, &basic, &data).await,
        "" => err!(InvalidRequest, "grant_type cannot be blank"),
        other => err!(UnsupportedGrantType, format!("Unsupported grant type: {other}")),
    }
}

fn authorization_code_grant(tenant: &Tenant, basic: &BasicAuth, data: &TokenForm) -> JsonResult {
    let client = authenticate_client(tenant, basic, data)?;
    if !client.allows_grant("authorization_code") {
        err!(UnauthorizedClient, "authorization_code grant is not allowed for this client");
    }

    let Some(code) = &data.code else {
        err!(InvalidRequest, "code cannot be blank");
    };

    // At-most-once: the store linearizes this, a replay burns the refresh
    // family spawned by the first exchange
    let record = match CODE_STORE.consume(code) {
        Ok(record) => record,
        Err(ConsumeError::Replayed(spawned_family)) => {
            if let Some(family) = spawned_family {
                REFRESH_STORE.revoke_family(&family);
            }
            err!(InvalidGrant, "authorization code is not valid", "authorization code replay detected");
        }
        Err(ConsumeError::Invalid) => err!(InvalidGrant, "authorization code is not valid"),
    };

    // The code is consumed now; none of the failures below make it usable
    // again
    if record.client_id != client.id || record.tenant_name != tenant.name {
        err!(InvalidGrant, "authorization code is not valid", "authorization code bound to another client");
    }

    if data.redirect_uri.as_deref() != Some(record.redirect_uri.as_str()) {
        err!(InvalidGrant, "redirect_uri does not match the authorization request");
    }

    match (&record.code_challenge, &data.code_verifier) {
        (Some(challenge), Some(verifier)) => {
            let verified = match record.code_challenge_method.as_deref() {
                Some("S256") => crypto::ct_eq(crypto::pkce_s256_challenge(verifier), challenge),
                _ => crypto::ct_eq(verifier, challenge),
            };
            if !verified {
                err!(InvalidGrant, "code_verifier does not match the challenge");
            }
        }
        (Some(_), None) => err!(InvalidGrant, "code_verifier is required"),
        (None, _) => {
            if client.pkce_required() {
                err!(InvalidGrant, "authorization code was issued without a PKCE binding");
            }
        }
    }

    let refresh = REFRESH_STORE.issue(
        &client.id,
        &tenant.name,
        &record.subject,
        &record.scope,
        record.claims.clone(),
        tenant.refresh_ttl(),
    );
    CODE_STORE.link_family(code, &refresh.family_id);

    token_response(tenant, &client, &record.subject, &record.scope, &record.claims, record.nonce.clone(), &refresh.id)
}

fn refresh_token_grant(tenant: &Tenant, basic: &BasicAuth, data: &TokenForm) -> JsonResult {
    let client = authenticate_client(tenant, basic, data)?;
    if !client.allows_grant("refresh_token") {
        err!(UnauthorizedClient, "refresh_token grant is not allowed for this client");
    }

    let Some(refresh_token) = &data.refresh_token else {
        err!(InvalidRequest, "refresh_token cannot be blank");
    };

    // A token presented by the wrong client means the family leaked
    if let Some(record) = REFRESH_STORE.lookup(refresh_token) {
        if record.client_id != client.id || record.tenant_name != tenant.name {
            REFRESH_STORE.revoke_family(&record.family_id);
            err!(InvalidGrant, "refresh token is not valid", "refresh token presented by the wrong client");
        }
    }

    let rotated = match REFRESH_STORE.rotate(refresh_token, tenant.refresh_ttl()) {
        Ok(rotated) => rotated,
        Err(_) => err!(InvalidGrant, "refresh token is not valid"),
    };

    token_response(tenant, &client, &rotated.subject, &rotated.scope, &rotated.claims, None, &rotated.id)
}

async fn password_grant(tenant: &Tenant, basic: &BasicAuth, data: &TokenForm) -> JsonResult {
    let client = authenticate_client(tenant, basic, data)?;
    if !client.allows_grant("password") || !tenant.allow_password_grant {
        err!(UnauthorizedClient, "password grant is not allowed for this client");
    }

    let (Some(username), Some(password)) = (&data.username, &data.password) else {
        err!(InvalidRequest, "username and password cannot be blank");
    };

    let validation = validator::validate_credentials(tenant, username, password).await?;

    let requested = scope::parse_scope(data.scope.as_deref());
    let granted = scope::resolve_scopes(&requested, &client, tenant)?;

    let refresh = REFRESH_STORE.issue(
        &client.id,
        &tenant.name,
        &validation.subject,
        &granted,
        validation.claims.clone(),
        tenant.refresh_ttl(),
    );

    info!("User {} obtained tokens via password grant on tenant {}", username, tenant.name);

    // No user agent involved, so no SSO cookie is set
    token_response(tenant, &client, &validation.subject, &granted, &validation.claims, None, &refresh.id)
}

/// Shared response body: signed access token, the opaque refresh token and,
/// with `openid` in scope, an ID token.
fn token_response(
    tenant: &Tenant,
    client: &Client,
    subject: &str,
    scopes: &[String],
    raw_claims: &Map<String, Value>,
    nonce: Option<String>,
    refresh_token: &str,
) -> JsonResult {
    let projected = scope::project_claims(raw_claims, tenant, scopes);
    let token_ttl = tenant.token_ttl();

    let access = AccessTokenClaims::new(subject, &client.id, &tenant.name, token_ttl, scopes, projected.clone());
    let access_token = auth::encode_access_token(&access)?;

    let mut body = json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": token_ttl,
        "refresh_token": refresh_token,
        "scope": scopes.join(" "),
    });

    if scopes.iter().any(|s| s == "openid") {
        let id = IdTokenClaims::new(subject, &client.id, &tenant.name, token_ttl, nonce, projected);
        body["id_token"] = Value::String(auth::encode_id_token(&id)?);
    }

    Ok(Json(body))
}
