mod auth_code;
mod refresh;

pub use auth_code::{AuthorizationCode, AuthorizationCodeStore, ConsumeError, CODE_STORE};
pub use refresh::{RefreshError, RefreshToken, RefreshTokenStore, REFRESH_STORE};
