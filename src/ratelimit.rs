use std::{net::IpAddr, num::NonZeroU32, sync::LazyLock, time::Duration};

use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};

use crate::{
    error::{Error, ErrorKind},
    CONFIG,
};

type Limiter<T = IpAddr> = RateLimiter<T, DashMapStateStore<T>, DefaultClock>;

static LIMITER_LOGIN: LazyLock<Limiter> = LazyLock::new(|| {
    let seconds = Duration::from_secs(CONFIG.login_ratelimit_seconds());
    let burst = NonZeroU32::new(CONFIG.login_ratelimit_max_burst()).expect("Non-zero login ratelimit burst");
    RateLimiter::keyed(Quota::with_period(seconds).expect("Non-zero login ratelimit seconds").allow_burst(burst))
});

static LIMITER_TOKEN: LazyLock<Limiter> = LazyLock::new(|| {
    let seconds = Duration::from_secs(CONFIG.token_ratelimit_seconds());
    let burst = NonZeroU32::new(CONFIG.token_ratelimit_max_burst()).expect("Non-zero token ratelimit burst");
    RateLimiter::keyed(Quota::with_period(seconds).expect("Non-zero token ratelimit seconds").allow_burst(burst))
});

static LIMITER_TOKEN_CLIENT: LazyLock<Limiter<String>> = LazyLock::new(|| {
    let seconds = Duration::from_secs(CONFIG.token_ratelimit_seconds());
    let burst = NonZeroU32::new(CONFIG.token_ratelimit_max_burst()).expect("Non-zero token ratelimit burst");
    RateLimiter::keyed(Quota::with_period(seconds).expect("Non-zero token ratelimit seconds").allow_burst(burst))
});

// The 429 bodies never say whether the blocked credentials were valid

pub fn check_limit_login(ip: &IpAddr) -> Result<(), Error> {
    match LIMITER_LOGIN.check_key(ip) {
        Ok(_) => Ok(()),
        Err(_e) => Err(Error::new(ErrorKind::RateLimited, "Too many login requests")),
    }
}

pub fn check_limit_token(ip: &IpAddr, client_id: Option<&str>) -> Result<(), Error> {
    if LIMITER_TOKEN.check_key(ip).is_err() {
        return Err(Error::new(ErrorKind::RateLimited, "Too many token requests"));
    }
    if let Some(client_id) = client_id {
        if LIMITER_TOKEN_CLIENT.check_key(&client_id.to_string()).is_err() {
            return Err(Error::new(ErrorKind::RateLimited, "Too many token requests"));
        }
    }
    Ok(())
}
