use axum::Server;
use chrono::Utc;
use clap::Parser;
use eyre::{eyre, WrapErr};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, Level};

use webfront_auth::{
    cookie_mode_parser, critical_span_parser, secure_policy_parser, AuthService, BoxError,
    CookieMode, CookieSecurePolicy, DynamicOptions, FixedOptions, LoginService, OptionsWatch,
    SchemeUsage, UserInfo, UserLoginResult,
};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    dotenv()?;

    let config = Config::parse();
    webfront_auth::logging::init(config.log_level)?;

    let fixed = FixedOptions {
        auth_cookie_name: config.cookie_name,
        bearer_header_name: config.bearer_header,
        cookie_mode: config.cookie_mode,
        cookie_secure_policy: config.cookie_secure_policy,
        entry_path: config.entry_path,
        allowed_return_urls: config.allowed_return_urls,
    };
    let dynamic = DynamicOptions {
        expire_time_span: chrono::Duration::seconds(config.expire_seconds),
        sliding_expiration_time: chrono::Duration::seconds(config.sliding_seconds),
        unsafe_expire_time_span: chrono::Duration::days(config.unsafe_expire_days),
        use_long_term_cookie: !config.no_long_term_cookie,
        schemes_critical_time_span: config.critical_time_spans.into_iter().collect(),
    };

    // the sender stays alive for the lifetime of the server so dynamic
    // options could be pushed by an operator channel later on
    let (_options, watch) = OptionsWatch::channel(dynamic);

    let backend = Arc::new(StaticUsers::from_specs(&config.users)?);
    let service = Arc::new(
        AuthService::builder(&config.protector_key, fixed, watch, backend).build(),
    );
    let router = webfront_auth::router(service);

    info!(address = %config.address, "serving the authentication endpoints");
    Server::bind(&config.address)
        .serve(router.into_make_service())
        .with_graceful_shutdown(shutdown())
        .await
        .wrap_err("failed to start server")?;

    Ok(())
}

/// Pull a local .env into the environment when one is present
fn dotenv() -> eyre::Result<()> {
    match dotenvy::dotenv() {
        Ok(_) => Ok(()),
        Err(error) if error.not_found() => Ok(()),
        Err(error) => Err(error).wrap_err("failed to load .env"),
    }
}

/// Ask hyper to drain in-flight requests once SIGINT (ctrl+c) or SIGTERM
/// arrives
async fn shutdown() {
    let interrupt = async {
        signal::ctrl_c()
            .await
            .expect("the ctrl+c handler must install")
    };
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("the sigterm handler must install")
            .recv()
            .await
    };

    tokio::select! {
        _ = interrupt => info!("interrupted, draining connections"),
        _ = terminate => info!("terminated, draining connections"),
    }
}

/// A development server for the web front authentication endpoints
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Config {
    /// The address for the server to listen on
    #[arg(long, default_value = "127.0.0.1:4243", env = "ADDRESS")]
    address: SocketAddr,

    /// The secret the envelope protectors derive their keys from
    ///
    /// This should be a long, random string
    #[arg(long, env = "PROTECTOR_KEY")]
    protector_key: String,

    /// The name of the session cookie
    #[arg(long, default_value = ".webFront", env = "COOKIE_NAME")]
    cookie_name: String,

    /// The header carrying bearer envelopes
    #[arg(long, default_value = "authorization", env = "BEARER_HEADER")]
    bearer_header: String,

    /// Where the authentication cookies live
    #[arg(
        long,
        default_value = "webfront-path",
        value_parser = cookie_mode_parser,
        env = "COOKIE_MODE",
    )]
    cookie_mode: CookieMode,

    /// When the session cookie is marked secure
    #[arg(
        long,
        default_value = "same-as-request",
        value_parser = secure_policy_parser,
        env = "COOKIE_SECURE_POLICY",
    )]
    cookie_secure_policy: CookieSecurePolicy,

    /// The path prefix of the authentication endpoints
    #[arg(long, default_value = "/c", env = "ENTRY_PATH")]
    entry_path: String,

    /// Comma separated prefixes a returnUrl may start with
    #[arg(long, value_delimiter = ',', env = "ALLOWED_RETURN_URLS")]
    allowed_return_urls: Vec<String>,

    /// Authentication lifetime in seconds
    #[arg(long, default_value_t = 3600, env = "EXPIRE_SECONDS")]
    expire_seconds: i64,

    /// Sliding window in seconds; 0 disables sliding
    #[arg(long, default_value_t = 0, env = "SLIDING_SECONDS")]
    sliding_seconds: i64,

    /// Long-term cookie lifetime in days
    #[arg(long, default_value_t = 365, env = "UNSAFE_EXPIRE_DAYS")]
    unsafe_expire_days: i64,

    /// Disable the long-term cookie entirely
    #[arg(long, env = "NO_LONG_TERM_COOKIE")]
    no_long_term_cookie: bool,

    /// Comma separated `scheme=seconds` critical window pairs
    #[arg(
        long,
        value_delimiter = ',',
        value_parser = critical_span_parser,
        env = "CRITICAL_TIME_SPANS",
    )]
    critical_time_spans: Vec<(String, chrono::Duration)>,

    /// Comma separated `name:password:id` development users
    #[arg(long, value_delimiter = ',', env = "USERS")]
    users: Vec<String>,

    /// The default level to log at
    #[arg(long, default_value_t = Level::INFO, env = "LOG_LEVEL")]
    log_level: Level,
}

/// An in-memory user table for development setups
struct StaticUsers {
    users: HashMap<String, (String, u64)>,
}

impl StaticUsers {
    /// Parse `name:password:id` entries
    fn from_specs(specs: &[String]) -> eyre::Result<Self> {
        let mut users = HashMap::new();
        for spec in specs {
            let mut parts = spec.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(name), Some(password), Some(id)) => {
                    let id = id
                        .parse()
                        .wrap_err_with(|| format!("invalid user id in {spec:?}"))?;
                    users.insert(name.to_owned(), (password.to_owned(), id));
                }
                _ => return Err(eyre!("expected 'name:password:id', got {spec:?}")),
            }
        }

        Ok(Self { users })
    }
}

#[axum::async_trait]
impl LoginService for StaticUsers {
    async fn login(
        &self,
        scheme: &str,
        _payload: serde_json::Value,
        _actual_login: bool,
    ) -> Result<UserLoginResult, BoxError> {
        // only basic login exists in the development backend
        Ok(UserLoginResult::failure(1, format!("unknown scheme '{scheme}'")))
    }

    async fn basic_login(
        &self,
        user_name: &str,
        password: &str,
        _actual_login: bool,
    ) -> Result<UserLoginResult, BoxError> {
        match self.users.get(user_name) {
            Some((expected, id)) if expected == password => {
                Ok(UserLoginResult::success(UserInfo::new(
                    *id,
                    user_name,
                    vec![SchemeUsage {
                        name: String::from("Basic"),
                        last_used: Utc::now(),
                    }],
                )))
            }
            _ => Ok(UserLoginResult::failure(1, "invalid credentials")),
        }
    }
}
