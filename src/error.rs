//
// OAuth error plumbing. Every recoverable fault is folded into one of the
// RFC 6749 wire kinds before it leaves the flow engine.
//
use std::fmt;

use serde_json::{json, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    InvalidScope,
    UnauthorizedClient,
    AccessDenied,
    UnsupportedResponseType,
    UnsupportedGrantType,
    ServerError,
    TemporarilyUnavailable,
    RateLimited,
}

impl ErrorKind {
    pub fn wire_label(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::InvalidClient => "invalid_client",
            ErrorKind::InvalidGrant => "invalid_grant",
            ErrorKind::InvalidScope => "invalid_scope",
            ErrorKind::UnauthorizedClient => "unauthorized_client",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::UnsupportedResponseType => "unsupported_response_type",
            ErrorKind::UnsupportedGrantType => "unsupported_grant_type",
            ErrorKind::ServerError => "server_error",
            ErrorKind::TemporarilyUnavailable => "temporarily_unavailable",
            ErrorKind::RateLimited => "rate_limited",
        }
    }

    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::InvalidClient => 401,
            ErrorKind::RateLimited => 429,
            ErrorKind::TemporarilyUnavailable => 503,
            ErrorKind::ServerError => 500,
            _ => 400,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_label())
    }
}

pub struct Error {
    kind: ErrorKind,
    // Returned to the caller as `error_description`
    message: String,
    // Internal detail, logged but never returned
    log_message: String,
    // Suppress the warn! line, used where failures are routine
    silent: bool,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        let message = message.into();
        let log_message = message.clone();
        Error {
            kind,
            message,
            log_message,
            silent: false,
        }
    }

    pub fn with_log<M: Into<String>, L: Into<String>>(kind: ErrorKind, message: M, log_message: L) -> Self {
        Error {
            kind,
            message: message.into(),
            log_message: log_message.into(),
            silent: false,
        }
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn wire_label(&self) -> &'static str {
        self.kind.wire_label()
    }

    pub fn description(&self) -> &str {
        &self.message
    }

    // First value goes to the client, the log line stays internal.
    // `server_error` swaps the description for an opaque reference id so no
    // internal detail crosses the wire.
    fn render(&self) -> (Value, Option<String>) {
        match self.kind {
            ErrorKind::ServerError => {
                let reference = uuid::Uuid::new_v4().to_string();
                let body = json!({
                    "error": self.kind.wire_label(),
                    "error_description": format!("unexpected error, reference {reference}"),
                });
                (body, Some(reference))
            }
            _ => {
                let body = json!({
                    "error": self.kind.wire_label(),
                    "error_description": self.message,
                });
                (body, None)
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.wire_label(), self.message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.wire_label(), self.log_message)
    }
}

//
// From impls for foreign error types that can only mean an internal fault.
// Each maps to `server_error`; the cause is kept for the log.
//
macro_rules! make_error {
    ( $( $name:ident ( $ty:ty ) ),+ $(,)? ) => {
        $(impl From<$ty> for Error {
            fn from(err: $ty) -> Self {
                Error::with_log(
                    ErrorKind::ServerError,
                    "internal error",
                    format!(concat!(stringify!($name), ": {}"), err),
                )
            }
        })+
    };
}

make_error! {
    IoError(std::io::Error),
    SerdeError(serde_json::Error),
    JwtError(jsonwebtoken::errors::Error),
    TemplateError(handlebars::RenderError),
    UrlError(url::ParseError),
    RingError(ring::error::Unspecified),
    RocketError(rocket::Error),
}

pub trait MapResult<S> {
    fn map_res(self, msg: &str) -> Result<S, Error>;
}

impl<S, E: Into<Error>> MapResult<S> for Result<S, E> {
    fn map_res(self, msg: &str) -> Result<S, Error> {
        self.map_err(|e| {
            let err: Error = e.into();
            Error::with_log(err.kind, msg, err.log_message)
        })
    }
}

impl<S> MapResult<S> for Option<S> {
    fn map_res(self, msg: &str) -> Result<S, Error> {
        self.ok_or_else(|| Error::new(ErrorKind::ServerError, msg))
    }
}

//
// Rocket responder impl
//
use std::io::Cursor;

use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};

impl Responder<'_, 'static> for Error {
    fn respond_to(self, _: &Request<'_>) -> response::Result<'static> {
        let (body, reference) = self.render();

        if !self.silent {
            match reference {
                Some(reference) => error!("[{reference}] {}: {}", self.kind.wire_label(), self.log_message),
                None => warn!("{}: {}", self.kind.wire_label(), self.log_message),
            }
        }

        let body = body.to_string();
        Response::build()
            .status(Status::new(self.kind.status_code()))
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

///
/// Error return macros
///
#[macro_export]
macro_rules! err {
    ($kind:ident, $msg:expr) => {{
        return Err($crate::error::Error::new($crate::error::ErrorKind::$kind, $msg));
    }};
    ($kind:ident, $usr_msg:expr, $log_msg:expr) => {{
        return Err($crate::error::Error::with_log(
            $crate::error::ErrorKind::$kind,
            $usr_msg,
            $log_msg,
        ));
    }};
}

#[macro_export]
macro_rules! err_handler {
    ($expr:expr) => {{
        error!(target: "auth", "Unauthorized Error: {}", $expr);
        return ::rocket::request::Outcome::Error((::rocket::http::Status::Unauthorized, $expr));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_labels_are_stable() {
        assert_eq!(ErrorKind::InvalidGrant.wire_label(), "invalid_grant");
        assert_eq!(ErrorKind::UnsupportedResponseType.wire_label(), "unsupported_response_type");
        assert_eq!(ErrorKind::RateLimited.wire_label(), "rate_limited");
    }

    #[test]
    fn status_codes_follow_rfc6749() {
        assert_eq!(ErrorKind::InvalidRequest.status_code(), 400);
        assert_eq!(ErrorKind::InvalidClient.status_code(), 401);
        assert_eq!(ErrorKind::RateLimited.status_code(), 429);
    }

    #[test]
    fn server_error_hides_detail() {
        let err = Error::with_log(ErrorKind::ServerError, "internal error", "secret detail");
        let (body, reference) = err.render();
        let description = body["error_description"].as_str().unwrap();
        assert!(reference.is_some());
        assert!(!description.contains("secret detail"));
    }
}
