//
// Web Headers and logging fairings
//
use rocket::{
    fairing::{Fairing, Info, Kind},
    http::Method,
    Data, Orbit, Request, Response, Rocket,
};

pub struct AppHeaders();

#[rocket::async_trait]
impl Fairing for AppHeaders {
    fn info(&self) -> Info {
        Info {
            name: "Application Headers",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r Request<'_>, res: &mut Response<'r>) {
        res.set_raw_header("Referrer-Policy", "same-origin");
        res.set_raw_header("X-Frame-Options", "SAMEORIGIN");
        res.set_raw_header("X-Content-Type-Options", "nosniff");

        // Token and login responses must never be cached by intermediaries
        if !res.headers().contains("cache-control") {
            res.set_raw_header("Cache-Control", "no-cache, no-store, max-age=0");
            res.set_raw_header("Pragma", "no-cache");
        }
    }
}

// Log all the routes from the main paths list
// Effectively ignores any static file route and the alive endpoint
const LOGGED_ROUTES: [&str; 6] = ["/authorize", "/login", "/token", "/userinfo", "/logout", "/.well-known"];

// Boolean is extra debug, when true, we ignore the whitelist above and also print the mounts
pub struct BetterLogging(pub bool);

#[rocket::async_trait]
impl Fairing for BetterLogging {
    fn info(&self) -> Info {
        Info {
            name: "Better Logging",
            kind: Kind::Liftoff | Kind::Request | Kind::Response,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        if self.0 {
            info!(target: "routes", "Routes loaded:");
            let mut routes: Vec<_> = rocket.routes().collect();
            routes.sort_by_key(|r| r.uri.path());
            for route in routes {
                if route.rank < 0 {
                    info!(target: "routes", "{:<6} {}", route.method, route.uri);
                } else {
                    info!(target: "routes", "{:<6} {} [{}]", route.method, route.uri, route.rank);
                }
            }
        }

        let config = rocket.config();
        let scheme = if config.tls_enabled() {
            "https"
        } else {
            "http"
        };
        let addr = format!("{}://{}:{}", &scheme, &config.address, &config.port);
        info!(target: "start", "Rocket has launched from {}", addr);
    }

    async fn on_request(&self, request: &mut Request<'_>, _data: &mut Data<'_>) {
        let method = request.method();
        if !self.0 && method == Method::Options {
            return;
        }
        let uri = request.uri();
        let uri_path = uri.path().as_str();
        if self.0 || LOGGED_ROUTES.iter().any(|r| uri_path.starts_with(r)) {
            // Query strings on these routes can carry `state` and challenge
            // material, keep them out of the log
            info!(target: "request", "{} {}", method, uri_path);
        }
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        if !self.0 && request.method() == Method::Options {
            return;
        }
        let uri_path = request.uri().path().as_str();
        if self.0 || LOGGED_ROUTES.iter().any(|r| uri_path.starts_with(r)) {
            let status = response.status();
            if let Some(route) = request.route() {
                info!(target: "response", "{} => {}", route, status)
            } else {
                info!(target: "response", "{}", status)
            }
        }
    }
}

//
// Env methods
//
use std::env;
use std::str::FromStr;

const TRUE_VALUES: &[&str] = &["true", "t", "yes", "y", "1"];
const FALSE_VALUES: &[&str] = &["false", "f", "no", "n", "0"];

/// Wrapper around `env::var` that supports `KEY_FILE` indirection, so
/// secrets can be mounted as files instead of environment values.
pub fn get_env_str_value(key: &str) -> Option<String> {
    let key_file = format!("{key}_FILE");
    let value_from_env = env::var(key);
    let value_file = env::var(&key_file);

    match (value_from_env, value_file) {
        (Ok(_), Ok(_)) => panic!("You should not define both {key} and {key_file}!"),
        (Ok(v_env), Err(_)) => Some(v_env),
        (Err(_), Ok(v_file)) => match std::fs::read_to_string(v_file) {
            Ok(content) => Some(content.trim().to_string()),
            Err(e) => panic!("Failed to load {key}: {e:?}"),
        },
        _ => None,
    }
}

pub fn get_env<V>(key: &str) -> Option<V>
where
    V: FromStr,
{
    get_env_str_value(key).and_then(|v| v.parse::<V>().ok())
}

pub fn get_env_bool(key: &str) -> Option<bool> {
    get_env_str_value(key).map(|val| {
        let val = val.to_lowercase();
        if TRUE_VALUES.contains(&val.as_str()) {
            true
        } else if FALSE_VALUES.contains(&val.as_str()) {
            false
        } else {
            println!("[WARNING] Using false, what does {key}={val} mean?");
            false
        }
    })
}

pub fn read_file(path: &str) -> Result<Vec<u8>, crate::error::Error> {
    let contents = std::fs::read(path)?;
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_accepts_common_spellings() {
        env::set_var("UITSMIJTER_TEST_BOOL", "yes");
        assert_eq!(get_env_bool("UITSMIJTER_TEST_BOOL"), Some(true));
        env::set_var("UITSMIJTER_TEST_BOOL", "0");
        assert_eq!(get_env_bool("UITSMIJTER_TEST_BOOL"), Some(false));
        env::remove_var("UITSMIJTER_TEST_BOOL");
        assert_eq!(get_env_bool("UITSMIJTER_TEST_BOOL"), None);
    }
}
