use chrono::Duration;
use eyre::eyre;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Where the authentication cookies live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieMode {
    /// No session cookie at all; bearer tokens only
    None,
    /// Cookies on `/`, shared with the whole application
    RootPath,
    /// Cookies scoped to the web front entry path
    WebFrontPath,
}

/// When the session cookie carries the `Secure` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieSecurePolicy {
    None,
    Always,
    SameAsRequest,
}

/// Options captured once at service construction and never re-read
#[derive(Debug, Clone)]
pub struct FixedOptions {
    /// Name of the session cookie; the long-term cookie appends `LT`
    pub auth_cookie_name: String,
    /// Header carrying `Bearer <envelope>` values
    pub bearer_header_name: String,
    pub cookie_mode: CookieMode,
    pub cookie_secure_policy: CookieSecurePolicy,
    /// Path prefix the authentication endpoints are mounted under
    pub entry_path: String,
    /// Ordinal prefixes a `returnUrl` must match one of
    pub allowed_return_urls: Vec<String>,
}

impl FixedOptions {
    pub fn long_term_cookie_name(&self) -> String {
        format!("{}LT", self.auth_cookie_name)
    }

    /// The path both cookies are scoped to
    pub fn cookie_path(&self) -> &str {
        match self.cookie_mode {
            CookieMode::WebFrontPath => &self.entry_path,
            CookieMode::RootPath | CookieMode::None => "/",
        }
    }
}

impl Default for FixedOptions {
    fn default() -> Self {
        Self {
            auth_cookie_name: String::from(".webFront"),
            bearer_header_name: String::from("authorization"),
            cookie_mode: CookieMode::WebFrontPath,
            cookie_secure_policy: CookieSecurePolicy::SameAsRequest,
            entry_path: String::from("/c"),
            allowed_return_urls: Vec::new(),
        }
    }
}

/// Options re-read on every request through the watch channel
#[derive(Debug, Clone)]
pub struct DynamicOptions {
    /// Lifetime of a fresh authentication
    pub expire_time_span: Duration,
    /// Sliding window; zero disables sliding and the refresh endpoint
    pub sliding_expiration_time: Duration,
    /// Lifetime of the long-term cookie
    pub unsafe_expire_time_span: Duration,
    pub use_long_term_cookie: bool,
    /// Critical window per calling scheme; zero and missing both mean none
    pub schemes_critical_time_span: HashMap<String, Duration>,
}

impl Default for DynamicOptions {
    fn default() -> Self {
        Self {
            expire_time_span: Duration::hours(1),
            sliding_expiration_time: Duration::zero(),
            unsafe_expire_time_span: Duration::days(365),
            use_long_term_cookie: true,
            schemes_critical_time_span: HashMap::new(),
        }
    }
}

/// The monitored source of dynamic options
///
/// Every operation reads a fresh snapshot; pushing a new value through the
/// sender takes effect on the next request.
#[derive(Clone)]
pub struct OptionsWatch {
    rx: watch::Receiver<Arc<DynamicOptions>>,
}

impl OptionsWatch {
    /// Create the channel, keeping the sender for hot reloads
    pub fn channel(initial: DynamicOptions) -> (watch::Sender<Arc<DynamicOptions>>, Self) {
        let (tx, rx) = watch::channel(Arc::new(initial));
        (tx, Self { rx })
    }

    /// A fixed source that never changes, for tests and simple setups
    pub fn fixed(options: DynamicOptions) -> Self {
        // the receiver keeps serving the last value after the sender drops
        let (_tx, watch) = Self::channel(options);
        watch
    }

    /// The current snapshot
    pub fn current(&self) -> Arc<DynamicOptions> {
        self.rx.borrow().clone()
    }
}

/// Parse a cookie mode from a command line argument
pub fn cookie_mode_parser(raw: &str) -> eyre::Result<CookieMode> {
    match raw.to_lowercase().as_str() {
        "none" => Ok(CookieMode::None),
        "root" | "root-path" => Ok(CookieMode::RootPath),
        "webfront" | "webfront-path" => Ok(CookieMode::WebFrontPath),
        _ => Err(eyre!(
            "invalid cookie mode, must be one of: 'none', 'root-path' or 'webfront-path'"
        )),
    }
}

/// Parse a secure policy from a command line argument
pub fn secure_policy_parser(raw: &str) -> eyre::Result<CookieSecurePolicy> {
    match raw.to_lowercase().as_str() {
        "none" => Ok(CookieSecurePolicy::None),
        "always" => Ok(CookieSecurePolicy::Always),
        "same-as-request" => Ok(CookieSecurePolicy::SameAsRequest),
        _ => Err(eyre!(
            "invalid secure policy, must be one of: 'none', 'always' or 'same-as-request'"
        )),
    }
}

/// Parse a `scheme=seconds` critical time span pair
pub fn critical_span_parser(raw: &str) -> eyre::Result<(String, Duration)> {
    let (scheme, seconds) = raw
        .split_once('=')
        .ok_or_else(|| eyre!("expected 'scheme=seconds'"))?;
    let seconds: i64 = seconds.parse()?;

    Ok((scheme.to_owned(), Duration::seconds(seconds)))
}

#[cfg(test)]
mod tests {
    use super::{
        cookie_mode_parser, critical_span_parser, secure_policy_parser, CookieMode,
        CookieSecurePolicy, DynamicOptions, FixedOptions, OptionsWatch,
    };
    use chrono::Duration;
    use std::sync::Arc;

    #[test]
    fn long_term_name_appends_suffix() {
        let options = FixedOptions::default();
        assert_eq!(options.long_term_cookie_name(), ".webFrontLT");
    }

    #[test]
    fn cookie_path_follows_mode() {
        let mut options = FixedOptions::default();
        assert_eq!(options.cookie_path(), "/c");

        options.cookie_mode = CookieMode::RootPath;
        assert_eq!(options.cookie_path(), "/");
    }

    #[test]
    fn parsers_accept_known_values() {
        assert_eq!(cookie_mode_parser("none").unwrap(), CookieMode::None);
        assert_eq!(
            cookie_mode_parser("Root-Path").unwrap(),
            CookieMode::RootPath
        );
        assert_eq!(
            secure_policy_parser("same-as-request").unwrap(),
            CookieSecurePolicy::SameAsRequest
        );
        assert!(cookie_mode_parser("sideways").is_err());
        assert!(secure_policy_parser("sometimes").is_err());

        let (scheme, span) = critical_span_parser("Basic=300").unwrap();
        assert_eq!(scheme, "Basic");
        assert_eq!(span, Duration::seconds(300));
        assert!(critical_span_parser("Basic").is_err());
    }

    #[test]
    fn watch_reflects_pushed_updates() {
        let (tx, watch) = OptionsWatch::channel(DynamicOptions::default());
        assert!(watch.current().use_long_term_cookie);

        tx.send(Arc::new(DynamicOptions {
            use_long_term_cookie: false,
            ..DynamicOptions::default()
        }))
        .unwrap();

        assert!(!watch.current().use_long_term_cookie);
    }
}
