mod authorize;
mod meta;
mod token;
mod userinfo;

pub use crate::api::{
    authorize::routes as authorize_routes,
    meta::routes as meta_routes,
    token::routes as token_routes,
    userinfo::routes as userinfo_routes,
};

use rocket::serde::json::Json;
use serde_json::Value;

// Type aliases for API methods results
pub type ApiResult<T> = Result<T, crate::error::Error>;
pub type JsonResult = ApiResult<Json<Value>>;
