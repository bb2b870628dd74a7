#[macro_use]
extern crate rocket;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate log;

use std::{process::exit, str::FromStr, thread, time::Duration};

mod error;

mod api;
mod auth;
mod config;
mod crypto;
mod ratelimit;
mod registry;
mod scope;
mod session;
mod store;
mod util;
mod validator;


pub use config::CONFIG;
pub use error::{Error, MapResult};

use crate::registry::REGISTRY;
use crate::store::{CODE_STORE, REFRESH_STORE};

pub const VERSION: Option<&str> = option_env!("UITSMIJTER_VERSION");

#[rocket::main]
async fn main() -> Result<(), Error> {
    parse_args();
    launch_info();

    let level = init_logging()?;
    let extra_debug = matches!(level, log::LevelFilter::Trace | log::LevelFilter::Debug);

    if !CONFIG.domain_set() {
        warn!("DOMAIN is not configured, tokens will carry the default issuer. Set DOMAIN for production use.");
    }

    auth::load_keys();
    load_registry();
    schedule_jobs();

    launch_rocket(extra_debug).await
}

const HELP: &str = "\
Alternatively, you can use the following command-line arguments:

        -h, --help       Prints help information
        -v, --version    Prints the app version
";

pub fn parse_args() {
    const NO_VERSION: &str = "(Version info from Git not present)";
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        println!("Uitsmijter {}", VERSION.unwrap_or(NO_VERSION));
        print!("{HELP}");
        exit(0);
    } else if pargs.contains(["-v", "--version"]) {
        println!("Uitsmijter {}", VERSION.unwrap_or(NO_VERSION));
        exit(0);
    }
}

fn launch_info() {
    println!(
        "\
/--------------------------------------------------------------------\\
|                        Starting Uitsmijter                         |"
    );

    if let Some(version) = VERSION {
        println!("|{:^68}|", format!("Version {version}"));
    }

    println!(
        "\
|--------------------------------------------------------------------|
| This is a multi-tenant OAuth2 / OIDC authorization server.         |
| Routing users to their tenant login and handing signed tokens to   |
| registered clients is all it does.                                 |
\\--------------------------------------------------------------------/
"
    );
}

fn init_logging() -> Result<log::LevelFilter, Error> {
    use crate::error::ErrorKind;

    let level = log::LevelFilter::from_str(&CONFIG.log_level()).map_err(|_| {
        Error::new(ErrorKind::ServerError, "Valid values for LOG_LEVEL are: off, error, warn, info, debug, trace")
    })?;

    let mut logger = fern::Dispatch::new()
        .level(level)
        // Rocket announces itself loudly enough through BetterLogging
        .level_for("rocket::launch", log::LevelFilter::Error)
        .level_for("rocket::rocket", log::LevelFilter::Warn)
        .level_for("rocket::server", log::LevelFilter::Warn)
        .level_for("rocket::shield::shield", log::LevelFilter::Warn)
        .level_for("hyper::proto", log::LevelFilter::Off)
        .level_for("hyper::client", log::LevelFilter::Off)
        .chain(std::io::stdout());

    if CONFIG.extended_logging() {
        logger = logger.format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format(&CONFIG.log_timestamp_format()),
                record.target(),
                record.level(),
                message
            ))
        });
    } else {
        logger = logger.format(|out, message, _| out.finish(format_args!("{message}")));
    }

    if let Some(log_file) = CONFIG.log_file() {
        logger = logger.chain(fern::log_file(log_file)?);
    }

    #[cfg(not(windows))]
    {
        if cfg!(feature = "enable_syslog") || CONFIG.use_syslog() {
            logger = chain_syslog(logger);
        }
    }

    logger
        .apply()
        .map_err(|e| Error::new(ErrorKind::ServerError, format!("Failed to initialize logging: {e}")))?;

    Ok(level)
}

#[cfg(not(windows))]
fn chain_syslog(logger: fern::Dispatch) -> fern::Dispatch {
    let syslog_fmt = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_USER,
        hostname: None,
        process: "uitsmijter".into(),
        pid: 0,
    };

    match syslog::unix(syslog_fmt) {
        Ok(sl) => logger.chain(sl),
        Err(e) => {
            error!("Unable to connect to syslog: {e:?}");
            logger
        }
    }
}

fn load_registry() {
    let path = CONFIG.tenants_file();
    if let Err(e) = REGISTRY.load_from_file(&path) {
        warn!("Could not load tenants from `{path}`: {e:?}. Serving an empty registry until the next reload.");
    }
}

fn schedule_jobs() {
    let poll_interval = CONFIG.job_poll_interval_ms();

    thread::Builder::new()
        .name("job-scheduler".to_string())
        .spawn(move || {
            use job_scheduler_ng::{Job, JobScheduler};
            let mut sched = JobScheduler::new();

            // Lazy sweeps of the short lived protocol state
            sched.add(Job::new(CONFIG.store_sweep_schedule().parse().unwrap(), || {
                CODE_STORE.sweep();
                REFRESH_STORE.sweep();
            }));

            // Out-of-band registry refresh, swapped atomically
            sched.add(Job::new(CONFIG.registry_reload_schedule().parse().unwrap(), || {
                if let Err(e) = REGISTRY.load_from_file(&CONFIG.tenants_file()) {
                    warn!("Registry reload failed: {e:?}");
                }
            }));

            loop {
                sched.tick();
                thread::sleep(Duration::from_millis(poll_interval));
            }
        })
        .expect("Error spawning job scheduler thread");
}

async fn launch_rocket(extra_debug: bool) -> Result<(), Error> {
    let instance = rocket::build()
        .mount("/", api::authorize_routes())
        .mount("/", api::token_routes())
        .mount("/", api::userinfo_routes())
        .mount("/", api::meta_routes())
        .attach(util::AppHeaders())
        .attach(util::BetterLogging(extra_debug))
        .ignite()
        .await?;

    let shutdown = instance.shutdown();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.expect("Error setting Ctrl-C handler");
        info!("Exiting Uitsmijter!");
        shutdown.notify();
    });

    instance.launch().await?;

    info!("Uitsmijter process exited!");
    Ok(())
}
