//
// Discovery metadata, the JWKS document and the liveness probe.
//
use data_encoding::BASE64URL_NOPAD;
use ring::digest;
use rocket::serde::json::Json;
use rocket::Route;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde_json::Value;

use crate::{
    api::JsonResult,
    auth,
    error::{Error, ErrorKind},
    CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![openid_configuration, jwks, alive]
}

fn signing_alg() -> &'static str {
    match auth::jwt_algorithm() {
        jsonwebtoken::Algorithm::RS256 => "RS256",
        _ => "HS256",
    }
}

#[get("/.well-known/openid-configuration")]
fn openid_configuration() -> Json<Value> {
    let domain = CONFIG.domain();
    Json(json!({
        "issuer": domain,
        "authorization_endpoint": format!("{domain}/authorize"),
        "token_endpoint": format!("{domain}/token"),
        "userinfo_endpoint": format!("{domain}/userinfo"),
        "end_session_endpoint": format!("{domain}/logout"),
        "jwks_uri": format!("{domain}/jwks.json"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token", "password"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": [signing_alg()],
        "scopes_supported": ["openid", "email", "profile", "phone", "address"],
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post"],
        "code_challenge_methods_supported": ["S256", "plain"],
    }))
}

/// RFC 7638 thumbprint over the canonical members, used as the key id.
fn jwk_thumbprint(n: &str, e: &str) -> Result<String, Error> {
    let canonical = json!({
        "e": e,
        "kty": "RSA",
        "n": n,
    });
    let bytes = serde_json::to_vec(&canonical)?;
    let hash = digest::digest(&digest::SHA256, &bytes);
    Ok(BASE64URL_NOPAD.encode(hash.as_ref()))
}

#[get("/jwks.json")]
fn jwks() -> JsonResult {
    // Under HS256 there is no public key to publish
    let Some(path) = CONFIG.public_rsa_key() else {
        return Ok(Json(json!({ "keys": [] })));
    };

    let pem = std::fs::read_to_string(&path)?;
    let key = RsaPublicKey::from_public_key_pem(&pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
        .map_err(|e| Error::with_log(ErrorKind::ServerError, "internal error", format!("Failed to parse public RSA key: {e}")))?;

    let n = BASE64URL_NOPAD.encode(&key.n().to_bytes_be());
    let e = BASE64URL_NOPAD.encode(&key.e().to_bytes_be());
    let kid = jwk_thumbprint(&n, &e)?;

    Ok(Json(json!({
        "keys": [{
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": kid,
            "n": n,
            "e": e,
        }]
    })))
}

#[get("/alive")]
fn alive() -> Json<String> {
    Json(chrono::Utc::now().naive_utc().to_string())
}
