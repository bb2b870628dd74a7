//
// Browser-facing half of the flow engine: /authorize, /login and /logout.
//
use chrono::Utc;
use rocket::form::Form;
use rocket::http::{CookieJar, Status};
use rocket::response::content::RawHtml as Html;
use rocket::response::status::Custom;
use rocket::response::Redirect;
use rocket::Route;
use serde_json::{Map, Value};
use url::Url;

use crate::{
    api::ApiResult,
    auth::{self, ClientIp, LoginChallengeClaims, RequestContext},
    error::ErrorKind,
    ratelimit,
    registry::{Client, Tenant, REGISTRY},
    scope, session,
    store::{AuthorizationCode, CODE_STORE},
    validator, CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![authorize, login, logout]
}

#[derive(Responder)]
pub enum FlowResponse {
    Redirect(Redirect),
    Page(Html<String>),
    Error(Custom<Html<String>>),
}

// 302 on purpose, user agents must not rewrite the method on these hops
fn redirect_to(url: String) -> FlowResponse {
    FlowResponse::Redirect(Redirect::found(url))
}

/// Redirect-less error page. Used wherever redirecting would hand control
/// to an unverified target, and for unknown tenants.
fn render_error_page(status: Status, error: &str, message: &str) -> FlowResponse {
    let html = CONFIG
        .render_template("error", &json!({ "error": error, "message": message }))
        .unwrap_or_else(|_| format!("{error}: {message}"));
    FlowResponse::Error(Custom(status, Html(html)))
}

/// RFC 6749 error redirect; only reachable after the redirect_uri passed
/// the exact-match allow-list. `state` is echoed verbatim when present.
fn redirect_error(redirect_uri: &str, kind: ErrorKind, description: &str, state: Option<&str>) -> FlowResponse {
    let mut url = match Url::parse(redirect_uri) {
        Ok(url) => url,
        Err(_) => return render_error_page(Status::BadRequest, kind.wire_label(), description),
    };

    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("error", kind.wire_label());
        if !description.is_empty() {
            pairs.append_pair("error_description", description);
        }
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }

    redirect_to(url.to_string())
}

fn render_login_page(tenant: &Tenant, challenge: &LoginChallengeClaims, error: Option<&str>) -> ApiResult<FlowResponse> {
    let location = auth::encode_login_challenge(challenge.clone())?;
    let data = json!({
        "tenant_name": tenant.name,
        "serviceUrl": CONFIG.domain(),
        "requestUri": challenge.return_location,
        "mode": challenge.mode,
        "location": location,
        "error": error,
        "requestInfo": tenant.informations,
    });
    let html = CONFIG.render_template("login", &data)?;
    Ok(FlowResponse::Page(Html(html)))
}

/// Common tail of the interactive and silent paths: store the pending
/// authorization and bounce back to the client with `code` and `state`.
pub(super) fn issue_code(
    tenant: &Tenant,
    challenge: &LoginChallengeClaims,
    subject: &str,
    claims: Map<String, Value>,
) -> ApiResult<FlowResponse> {
    let record = AuthorizationCode {
        client_id: challenge.client_id.clone(),
        tenant_name: tenant.name.clone(),
        subject: subject.to_string(),
        redirect_uri: challenge.redirect_uri.clone(),
        scope: challenge.scope.clone(),
        code_challenge: challenge.code_challenge.clone(),
        code_challenge_method: challenge.code_challenge_method.clone(),
        nonce: challenge.nonce.clone(),
        state: challenge.state.clone(),
        claims,
        expires_at: Utc::now().timestamp() + tenant.code_ttl(),
    };

    let code = CODE_STORE.put(record);

    let mut url = Url::parse(&challenge.redirect_uri)?;
    url.query_pairs_mut().append_pair("code", &code).append_pair("state", &challenge.state);

    debug!("Issued authorization code for client {} on tenant {}", challenge.client_id, tenant.name);
    Ok(redirect_to(url.to_string()))
}

/// Normalizes the PKCE method. RFC 7636 spells it `plain`, some clients
/// send `PLAIN`; both are accepted.
fn normalize_challenge_method(method: Option<&str>) -> Option<&'static str> {
    match method {
        Some("S256") => Some("S256"),
        // RFC 7636 defaults to plain when the method is omitted
        Some("PLAIN") | Some("plain") | None => Some("plain"),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
#[get("/authorize?<response_type>&<client_id>&<redirect_uri>&<scope>&<state>&<code_challenge>&<code_challenge_method>&<nonce>")]
fn authorize(
    ctx: RequestContext,
    cookies: &CookieJar<'_>,
    response_type: Option<String>,
    client_id: Option<String>,
    redirect_uri: Option<String>,
    scope: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    nonce: Option<String>,
) -> FlowResponse {
    authorize_inner(
        ctx,
        cookies,
        response_type,
        client_id,
        redirect_uri,
        scope,
        state,
        code_challenge,
        code_challenge_method,
        nonce,
    )
    .unwrap_or_else(|e| {
        error!("authorize failed: {e:?}");
        render_error_page(Status::InternalServerError, "server_error", "The request could not be processed")
    })
}

#[allow(clippy::too_many_arguments)]
fn authorize_inner(
    ctx: RequestContext,
    cookies: &CookieJar<'_>,
    response_type: Option<String>,
    client_id: Option<String>,
    redirect_uri: Option<String>,
    scope: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    nonce: Option<String>,
) -> ApiResult<FlowResponse> {
    // 1. Tenant by Host. No tenant, no OAuth surface.
    let Some(tenant) = ctx.tenant.clone() else {
        return Ok(render_error_page(Status::NotFound, "invalid_request", "No tenant is configured for this host"));
    };

    // 2. Client
    let Some(client_id) = client_id.filter(|c| !c.is_empty()) else {
        return Ok(render_error_page(Status::BadRequest, "invalid_request", "client_id is required"));
    };
    let Some(client) = REGISTRY.lookup_client(&client_id).filter(|c| c.tenant_name == tenant.name) else {
        return Ok(render_error_page(Status::BadRequest, "invalid_client", "Unknown client for this tenant"));
    };

    // 3. Exact-match redirect_uri. On mismatch, do not redirect.
    let Some(redirect_uri) = redirect_uri.filter(|uri| client.allows_redirect(uri)) else {
        warn!("authorize: redirect_uri not registered for client {client_id}");
        return Ok(render_error_page(
            Status::BadRequest,
            "invalid_request",
            "The redirect_uri is not registered for this client",
        ));
    };

    // From here on errors may bounce back to the verified redirect target.
    let Some(state) = state.filter(|s| !s.is_empty()) else {
        return Ok(redirect_error(&redirect_uri, ErrorKind::InvalidRequest, "state is required", None));
    };

    // 4. response_type and scope
    if response_type.as_deref() != Some("code") {
        return Ok(redirect_error(
            &redirect_uri,
            ErrorKind::UnsupportedResponseType,
            "only response_type=code is supported",
            Some(&state),
        ));
    }

    let requested = scope::parse_scope(scope.as_deref());
    let granted = match scope::resolve_scopes(&requested, &client, &tenant) {
        Ok(granted) => granted,
        Err(e) => return Ok(redirect_error(&redirect_uri, e.kind(), e.description(), Some(&state))),
    };

    // 5. PKCE binding
    let challenge_method = match normalize_challenge_method(code_challenge_method.as_deref()) {
        Some(method) => method,
        None => {
            return Ok(redirect_error(
                &redirect_uri,
                ErrorKind::InvalidRequest,
                "code_challenge_method must be S256 or PLAIN",
                Some(&state),
            ))
        }
    };
    if client.pkce_required() && code_challenge.is_none() {
        return Ok(redirect_error(
            &redirect_uri,
            ErrorKind::InvalidRequest,
            "code_challenge is required for this client",
            Some(&state),
        ));
    }

    // 6. Responsibility context, computed once by the request guard
    let hash = ctx.responsibility_hash.clone().unwrap_or_default();

    let challenge = LoginChallengeClaims {
        exp: 0,
        iss: String::new(),
        client_id: client.id.clone(),
        redirect_uri,
        scope: granted,
        state,
        response_type: "code".to_string(),
        code_challenge: code_challenge.clone(),
        code_challenge_method: code_challenge.is_some().then(|| challenge_method.to_string()),
        nonce,
        return_location: format!("/authorize?client_id={}", client.id),
        mode: "login".to_string(),
    };

    // 7. Silent path: a valid cookie for this responsibility hash naming
    // this tenant skips the login page entirely.
    if let Some(sso) = session::parse(cookies, &tenant, &hash) {
        session::rotate(cookies, &tenant, &hash, &sso)?;
        info!("Silent sign-in for client {} on tenant {}", client.id, tenant.name);
        return issue_code(&tenant, &challenge, &sso.sub, sso.claims);
    }

    // 8. Interactive path
    render_login_page(&tenant, &challenge, None)
}

#[derive(FromForm)]
struct LoginForm {
    username: String,
    password: String,
    location: String,
    mode: Option<String>,
}

#[post("/login", data = "<data>")]
async fn login(ctx: RequestContext, cookies: &CookieJar<'_>, ip: ClientIp, data: Form<LoginForm>) -> FlowResponse {
    match login_inner(ctx, cookies, ip, data).await {
        Ok(response) => response,
        Err(e) => {
            error!("login failed: {e:?}");
            render_error_page(Status::InternalServerError, "server_error", "The request could not be processed")
        }
    }
}

async fn login_inner(
    ctx: RequestContext,
    cookies: &CookieJar<'_>,
    ip: ClientIp,
    data: Form<LoginForm>,
) -> ApiResult<FlowResponse> {
    if ratelimit::check_limit_login(&ip.ip).is_err() {
        return Ok(render_error_page(Status::TooManyRequests, "rate_limited", "Too many login attempts, slow down"));
    }

    let Some(tenant) = ctx.tenant.clone() else {
        return Ok(render_error_page(Status::NotFound, "invalid_request", "No tenant is configured for this host"));
    };

    // Reject tampered or expired challenges outright
    let Ok(mut challenge) = auth::decode_login_challenge(&data.location) else {
        return Ok(render_error_page(Status::BadRequest, "invalid_request", "The login request is invalid or has expired"));
    };
    if let Some(mode) = &data.mode {
        challenge.mode.clone_from(mode);
    }

    // The challenge must belong to a client of the tenant serving this host
    let client_ok = REGISTRY.lookup_client(&challenge.client_id).is_some_and(|c: Client| c.tenant_name == tenant.name);
    if !client_ok {
        return Ok(render_error_page(Status::BadRequest, "invalid_client", "Unknown client for this tenant"));
    }

    match validator::validate_credentials(&tenant, &data.username, &data.password).await {
        Ok(validation) => {
            let hash = ctx.responsibility_hash.clone().unwrap_or_default();
            session::mint(cookies, &validation.subject, &tenant, &hash, validation.claims.clone())?;
            info!("User {} signed in on tenant {}. IP: {}", data.username, tenant.name, ip.ip);
            issue_code(&tenant, &challenge, &validation.subject, validation.claims)
        }
        Err(e) => match e.kind() {
            ErrorKind::AccessDenied => {
                info!("Failed sign-in on tenant {}. IP: {}", tenant.name, ip.ip);
                render_login_page(&tenant, &challenge, Some("Invalid username or password"))
            }
            ErrorKind::RateLimited | ErrorKind::TemporarilyUnavailable => {
                render_login_page(&tenant, &challenge, Some("Please try again in a moment"))
            }
            _ => Err(e),
        },
    }
}

#[get("/logout?<post_logout_redirect_uri>&<client_id>")]
fn logout(
    ctx: RequestContext,
    cookies: &CookieJar<'_>,
    post_logout_redirect_uri: Option<String>,
    client_id: Option<String>,
) -> FlowResponse {
    if let (Some(tenant), Some(hash)) = (&ctx.tenant, &ctx.responsibility_hash) {
        session::revoke(cookies, hash);

        if let Some(uri) = post_logout_redirect_uri {
            // Mandatory allow-list membership; otherwise stay on our page
            let allowed = match &client_id {
                Some(id) => REGISTRY
                    .lookup_client(id)
                    .filter(|c| c.tenant_name == tenant.name)
                    .is_some_and(|c| c.allows_post_logout_redirect(&uri)),
                None => REGISTRY.clients_for_tenant(&tenant.name).iter().any(|c| c.allows_post_logout_redirect(&uri)),
            };

            if allowed {
                return redirect_to(uri);
            }
            warn!("logout: post_logout_redirect_uri not in any allow-list, rendering logout page");
        }
    }

    let html = CONFIG
        .render_template("logout", &json!({}))
        .unwrap_or_else(|_| "You have been signed out".to_string());
    FlowResponse::Page(Html(html))
}
