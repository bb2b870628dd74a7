//
// OIDC userinfo endpoint. Bearer access token in, the scope-projected
// claim subset out. Anything else is a 401 with a Bearer challenge.
//
use rocket::http::Header;
use rocket::serde::json::Json;
use rocket::Route;
use serde_json::Value;

use crate::{
    auth::{self, BearerToken},
    registry::REGISTRY,
    scope,
};

pub fn routes() -> Vec<Route> {
    routes![userinfo]
}

#[derive(Responder)]
#[response(status = 401)]
struct Unauthorized {
    inner: Json<Value>,
    www_authenticate: Header<'static>,
}

fn unauthorized() -> Unauthorized {
    Unauthorized {
        inner: Json(json!({ "error": "invalid_token" })),
        www_authenticate: Header::new("WWW-Authenticate", "Bearer error=\"invalid_token\""),
    }
}

#[get("/userinfo")]
fn userinfo(token: Option<BearerToken>) -> Result<Json<Value>, Unauthorized> {
    let Some(BearerToken(raw)) = token else {
        return Err(unauthorized());
    };

    let claims = auth::decode_access_token(&raw).map_err(|_| unauthorized())?;

    // Audience and tenant must still exist in the registry
    let Some(tenant) = REGISTRY.lookup_tenant_by_name(&claims.tenant) else {
        return Err(unauthorized());
    };
    if !REGISTRY.lookup_client(&claims.aud).is_some_and(|c| c.tenant_name == tenant.name) {
        return Err(unauthorized());
    }

    let scopes = claims.scope_vec();
    let projected = scope::project_claims(&claims.claims, &tenant, &scopes);

    let mut body = serde_json::Map::new();
    body.insert("sub".to_string(), Value::String(claims.sub));
    body.extend(projected);

    Ok(Json(Value::Object(body)))
}
