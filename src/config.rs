use std::process::exit;
use std::sync::{LazyLock, RwLock};

use handlebars::Handlebars;

use crate::{
    crypto,
    error::Error,
    util::{get_env, get_env_bool, get_env_str_value},
};

pub static CONFIG: LazyLock<Config> = LazyLock::new(|| {
    Config::load().unwrap_or_else(|e| {
        println!("Error loading config:\n  {e:?}\n");
        exit(12)
    })
});

pub type Pass = String;

// Hard ceilings; tenants can lower these but never raise them
pub const MAX_TOKEN_TTL: i64 = 24 * 3600;
pub const MAX_REFRESH_TTL: i64 = 90 * 24 * 3600;
pub const MAX_CODE_TTL: i64 = 60;
pub const MAX_SESSION_TTL: i64 = 8 * 3600;

pub struct Config {
    inner: RwLock<Inner>,
}

struct Inner {
    templates: Handlebars<'static>,
    config: ConfigItems,
}

#[derive(Clone)]
struct ConfigItems {
    domain: String,
    domain_set: bool,

    jwt_secret: Pass,
    private_rsa_key: Option<String>,
    public_rsa_key: Option<String>,

    tenants_file: String,
    templates_folder: String,
    reload_templates: bool,

    token_ttl: i64,
    refresh_ttl: i64,
    code_ttl: i64,
    session_ttl: i64,

    validator_timeout_seconds: u64,
    validator_concurrency: usize,

    login_ratelimit_seconds: u64,
    login_ratelimit_max_burst: u32,
    token_ratelimit_seconds: u64,
    token_ratelimit_max_burst: u32,

    responsibility_hash_sha256: bool,

    registry_reload_schedule: String,
    store_sweep_schedule: String,
    job_poll_interval_ms: u64,

    ip_header: String,
    ip_header_enabled: bool,

    log_level: String,
    log_file: Option<String>,
    log_timestamp_format: String,
    use_syslog: bool,
    extended_logging: bool,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        let env_file = get_env("ENV_FILE").unwrap_or_else(|| String::from(".env"));
        if let Err(e) = dotenvy::from_path(&env_file) {
            match e {
                dotenvy::Error::LineParse(msg, pos) => {
                    println!("[ERROR] Failed parsing environment file `{env_file}`\nNear {msg:?} on position {pos}\n");
                    exit(255);
                }
                dotenvy::Error::Io(ioerr) if ioerr.kind() != std::io::ErrorKind::NotFound => {
                    println!("[ERROR] Reading environment file `{env_file}` failed:\n{ioerr:?}\n");
                    exit(255);
                }
                _ => (),
            }
        }

        let domain = get_env::<String>("DOMAIN").map(|d| d.trim_end_matches('/').to_string());
        let domain_set = domain.is_some();
        let domain = domain.unwrap_or_else(|| String::from("http://localhost:8000"));

        let private_rsa_key = get_env::<String>("PRIVATE_RSA_KEY");
        let public_rsa_key = get_env::<String>("PUBLIC_RSA_KEY");

        let jwt_secret = match get_env_str_value("JWT_SECRET") {
            Some(secret) => secret,
            None => {
                if private_rsa_key.is_none() {
                    println!("[WARNING] No JWT_SECRET configured, tokens will not survive a restart.");
                }
                crypto::get_random_string_alphanum(64)
            }
        };

        let config = ConfigItems {
            domain,
            domain_set,
            jwt_secret,
            private_rsa_key,
            public_rsa_key,
            tenants_file: get_env("TENANTS_FILE").unwrap_or_else(|| String::from("data/tenants.json")),
            templates_folder: get_env("TEMPLATES_FOLDER").unwrap_or_else(|| String::from("data/templates")),
            reload_templates: get_env_bool("RELOAD_TEMPLATES").unwrap_or(false),
            token_ttl: get_env("TOKEN_TTL").unwrap_or(3600),
            refresh_ttl: get_env("REFRESH_TTL").unwrap_or(30 * 24 * 3600),
            code_ttl: get_env("CODE_TTL").unwrap_or(60),
            session_ttl: get_env("SESSION_TTL").unwrap_or(MAX_SESSION_TTL),
            validator_timeout_seconds: get_env("VALIDATOR_TIMEOUT_SECONDS").unwrap_or(5),
            validator_concurrency: get_env("VALIDATOR_CONCURRENCY").unwrap_or(32),
            login_ratelimit_seconds: get_env("LOGIN_RATELIMIT_SECONDS").unwrap_or(60),
            login_ratelimit_max_burst: get_env("LOGIN_RATELIMIT_MAX_BURST").unwrap_or(15),
            token_ratelimit_seconds: get_env("TOKEN_RATELIMIT_SECONDS").unwrap_or(60),
            token_ratelimit_max_burst: get_env("TOKEN_RATELIMIT_MAX_BURST").unwrap_or(30),
            responsibility_hash_sha256: get_env_bool("RESPONSIBILITY_HASH_SHA256").unwrap_or(false),
            registry_reload_schedule: get_env("REGISTRY_RELOAD_SCHEDULE").unwrap_or_else(|| String::from("30 * * * * *")),
            store_sweep_schedule: get_env("STORE_SWEEP_SCHEDULE").unwrap_or_else(|| String::from("0 * * * * *")),
            job_poll_interval_ms: get_env("JOB_POLL_INTERVAL_MS").unwrap_or(30_000),
            ip_header: get_env("IP_HEADER").unwrap_or_else(|| String::from("X-Real-IP")),
            ip_header_enabled: true,
            log_level: get_env("LOG_LEVEL").unwrap_or_else(|| String::from("info")),
            log_file: get_env("LOG_FILE"),
            log_timestamp_format: get_env("LOG_TIMESTAMP_FORMAT").unwrap_or_else(|| String::from("%Y-%m-%d %H:%M:%S.%3f")),
            use_syslog: get_env_bool("USE_SYSLOG").unwrap_or(false),
            extended_logging: get_env_bool("EXTENDED_LOGGING").unwrap_or(true),
        };

        validate_config(&config)?;

        Ok(Config {
            inner: RwLock::new(Inner {
                templates: load_templates(&config.templates_folder),
                config,
            }),
        })
    }
}

fn validate_config(cfg: &ConfigItems) -> Result<(), Error> {
    use crate::error::ErrorKind;

    if url::Url::parse(&cfg.domain).is_err() {
        return Err(Error::new(ErrorKind::ServerError, format!("DOMAIN is not a valid URL: {}", cfg.domain)));
    }
    if cfg.token_ttl <= 0 || cfg.token_ttl > MAX_TOKEN_TTL {
        return Err(Error::new(ErrorKind::ServerError, "TOKEN_TTL must be between 1s and 24h"));
    }
    if cfg.refresh_ttl <= 0 || cfg.refresh_ttl > MAX_REFRESH_TTL {
        return Err(Error::new(ErrorKind::ServerError, "REFRESH_TTL must be between 1s and 90d"));
    }
    if cfg.code_ttl <= 0 || cfg.code_ttl > MAX_CODE_TTL {
        return Err(Error::new(ErrorKind::ServerError, "CODE_TTL must be between 1s and 60s"));
    }
    if cfg.session_ttl <= 0 || cfg.session_ttl > MAX_SESSION_TTL {
        return Err(Error::new(ErrorKind::ServerError, "SESSION_TTL must be between 1s and 8h"));
    }
    if cfg.private_rsa_key.is_some() != cfg.public_rsa_key.is_some() {
        return Err(Error::new(ErrorKind::ServerError, "PRIVATE_RSA_KEY and PUBLIC_RSA_KEY must be set together"));
    }
    Ok(())
}

macro_rules! config_getter {
    ($name:ident, $ty:ty) => {
        pub fn $name(&self) -> $ty {
            self.inner.read().unwrap().config.$name.clone()
        }
    };
}

impl Config {
    config_getter!(domain, String);
    config_getter!(domain_set, bool);
    config_getter!(jwt_secret, Pass);
    config_getter!(private_rsa_key, Option<String>);
    config_getter!(public_rsa_key, Option<String>);
    config_getter!(tenants_file, String);
    config_getter!(templates_folder, String);
    config_getter!(reload_templates, bool);
    config_getter!(token_ttl, i64);
    config_getter!(refresh_ttl, i64);
    config_getter!(code_ttl, i64);
    config_getter!(session_ttl, i64);
    config_getter!(validator_timeout_seconds, u64);
    config_getter!(validator_concurrency, usize);
    config_getter!(login_ratelimit_seconds, u64);
    config_getter!(login_ratelimit_max_burst, u32);
    config_getter!(token_ratelimit_seconds, u64);
    config_getter!(token_ratelimit_max_burst, u32);
    config_getter!(responsibility_hash_sha256, bool);
    config_getter!(registry_reload_schedule, String);
    config_getter!(store_sweep_schedule, String);
    config_getter!(job_poll_interval_ms, u64);
    config_getter!(ip_header, String);
    config_getter!(log_level, String);
    config_getter!(log_file, Option<String>);
    config_getter!(log_timestamp_format, String);
    config_getter!(use_syslog, bool);
    config_getter!(extended_logging, bool);

    pub fn _ip_header_enabled(&self) -> bool {
        self.inner.read().unwrap().config.ip_header_enabled
    }

    pub fn uses_rsa_keys(&self) -> bool {
        self.inner.read().unwrap().config.private_rsa_key.is_some()
    }

    pub fn render_template<T: serde::ser::Serialize>(&self, name: &str, data: &T) -> Result<String, Error> {
        if self.reload_templates() {
            warn!("RELOAD_TEMPLATES is enabled, this is only intended for development");
            let hb = load_templates(CONFIG.templates_folder());
            hb.render(name, data).map_err(Into::into)
        } else {
            let hb = &CONFIG.inner.read().unwrap().templates;
            hb.render(name, data).map_err(Into::into)
        }
    }
}

fn load_templates<P>(path: P) -> Handlebars<'static>
where
    P: AsRef<std::path::Path>,
{
    let mut hb = Handlebars::new();

    macro_rules! reg {
        ($name:expr) => {{
            let template = include_str!(concat!("static/templates/", $name, ".hbs"));
            hb.register_template_string($name, template).unwrap();
        }};
    }

    // First register default templates here, then load the tenant-provided
    // folder to overwrite them
    reg!("login");
    reg!("error");
    reg!("logout");

    if path.as_ref().is_dir() {
        hb.register_templates_directory(path, handlebars::DirectorySourceOptions::default()).unwrap();
    }

    hb
}
