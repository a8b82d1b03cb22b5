use axum::{
    http::{HeaderMap, Request},
    response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use std::{
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::RwLock;
use tower::{Layer, Service};
use tracing::{instrument, warn, Span};

use crate::cookies::{self, LongTermPayload};
use crate::envelope::{self, unprotect_auth};
use crate::info::{mint_device_id, AuthLevel, AuthenticationInfo, FrontAuthentication, UserInfo};
use crate::options::{CookieMode, DynamicOptions};
use crate::service::AuthService;

/// A shared reference to the request's authentication slot
pub type Handle = Arc<RwLock<RequestAuth>>;

/// The per-request authentication slot
///
/// The middleware resolves it once; every extractor and handler on the same
/// request observes the same value.
#[derive(Debug)]
pub struct RequestAuth {
    auth: FrontAuthentication,
    action: CookieAction,
}

impl RequestAuth {
    /// The resolved authentication
    pub fn current(&self) -> &FrontAuthentication {
        &self.auth
    }

    /// Replace the authentication and schedule a cookie refresh
    pub fn replace(&mut self, auth: FrontAuthentication) {
        self.auth = auth;
        self.action = CookieAction::Write;
    }

    /// Schedule deletion of both cookies without touching the resolved info
    pub fn schedule_logout(&mut self) {
        self.action = CookieAction::Clear;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CookieAction {
    Keep,
    Write,
    Clear,
}

/// Resolve the request's authentication and maintain its cookies
#[derive(Clone)]
pub struct AuthLayer {
    service: Arc<AuthService>,
}

impl AuthLayer {
    pub fn new(service: Arc<AuthService>) -> Self {
        Self { service }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            layer: self.clone(),
        }
    }
}

/// The middleware implementation
#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    layer: AuthLayer,
}

impl<S, Body> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Body: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    #[instrument(name = "auth", skip_all, fields(level, user))]
    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let service = self.layer.service.clone();

        let inner = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, inner);

        Box::pin(async move {
            let jar = CookieJar::from_headers(req.headers());
            let secure_request = is_https(&req);
            let now = Utc::now();
            let dynamic = service.dynamic().current();

            let (auth, action) =
                resolve(&service, req.headers(), &jar, req.uri().path(), &dynamic, now);

            Span::current()
                .record("level", tracing::field::debug(auth.info.level_at(now)))
                .record("user", auth.info.user().user_id());

            let handle: Handle = Arc::new(RwLock::new(RequestAuth { auth, action }));
            req.extensions_mut().insert(handle.clone());

            let response = inner.call(req).await?;

            let slot = Arc::try_unwrap(handle)
                .expect("authentication slot still has owners")
                .into_inner();

            let jar = match slot.action {
                CookieAction::Keep => return Ok(response),
                CookieAction::Write => cookies::set_cookies(
                    jar,
                    &slot.auth,
                    service.protectors(),
                    service.fixed(),
                    &dynamic,
                    secure_request,
                    now,
                ),
                CookieAction::Clear => {
                    cookies::clear_cookies(jar, service.fixed(), secure_request)
                }
            };

            Ok((jar, response).into_response())
        })
    }
}

/// Pick the first usable credential: bearer header, then session cookie, then
/// long-term cookie; otherwise synthesize a device identity where cookies are
/// welcome
fn resolve(
    service: &AuthService,
    headers: &HeaderMap,
    jar: &CookieJar,
    path: &str,
    dynamic: &DynamicOptions,
    now: DateTime<Utc>,
) -> (FrontAuthentication, CookieAction) {
    let fixed = service.fixed();
    let protectors = service.protectors();

    if let Some(token) = bearer_token(headers, &fixed.bearer_header_name) {
        match unprotect_auth(&protectors.token, token) {
            Ok(auth) => return (checked(auth, now), CookieAction::Keep),
            Err(error) => discard(&error, "bearer token"),
        }
    }

    if fixed.cookie_mode != CookieMode::None {
        if let Some(cookie) = jar.get(&fixed.auth_cookie_name) {
            match unprotect_auth(&protectors.cookie, cookie.value()) {
                Ok(auth) => {
                    let mut auth = checked(auth, now);

                    // sliding renewal applies to root-path cookies only
                    if fixed.cookie_mode == CookieMode::RootPath
                        && dynamic.sliding_expiration_time > Duration::zero()
                        && auth.info.level_at(now) >= AuthLevel::Normal
                    {
                        let half = dynamic.sliding_expiration_time / 2;
                        if auth.info.expires().is_some_and(|expires| expires <= now + half) {
                            auth.info = auth
                                .info
                                .set_expires(Some(now + dynamic.sliding_expiration_time));
                            return (auth, CookieAction::Write);
                        }
                    }

                    return (auth, CookieAction::Keep);
                }
                Err(error) => discard(&error, "session cookie"),
            }
        }
    }

    if dynamic.use_long_term_cookie {
        if let Some(cookie) = jar.get(&fixed.long_term_cookie_name()) {
            match serde_json::from_str::<LongTermPayload>(cookie.value()) {
                Ok(payload) => return (from_long_term(payload), CookieAction::Keep),
                Err(error) => warn!(%error, "discarding unreadable long-term cookie"),
            }
        }
    }

    let entry = match fixed.cookie_mode {
        CookieMode::RootPath => true,
        CookieMode::WebFrontPath => path.starts_with(&fixed.entry_path),
        CookieMode::None => false,
    };

    if entry {
        (
            FrontAuthentication::anonymous(mint_device_id()),
            CookieAction::Write,
        )
    } else {
        (FrontAuthentication::none(), CookieAction::Keep)
    }
}

/// Extract the token following a case-insensitive `Bearer ` prefix
fn bearer_token<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    let value = headers.get(name)?.to_str().ok()?;
    let prefix = value.get(..7)?;

    if prefix.eq_ignore_ascii_case("bearer ") {
        Some(value.get(7..)?.trim())
    } else {
        None
    }
}

fn checked(auth: FrontAuthentication, now: DateTime<Utc>) -> FrontAuthentication {
    FrontAuthentication {
        info: auth.info.check_expiration(now),
        remember_me: auth.remember_me,
    }
}

/// Build an unsafe-level authentication from the long-term payload
///
/// Anonymous long-term flows never remember; downstream code relies on it.
fn from_long_term(payload: LongTermPayload) -> FrontAuthentication {
    let device_id = payload.device_id.unwrap_or_default();
    let user = match payload.user_id {
        Some(id) if id != 0 => UserInfo::new(
            id,
            payload.user_name.unwrap_or_default(),
            payload.schemes.unwrap_or_default(),
        ),
        _ => UserInfo::anonymous(),
    };
    let remember_me = !user.is_anonymous();

    FrontAuthentication {
        info: AuthenticationInfo::new(user, None, None, device_id),
        remember_me,
    }
}

/// A broken envelope is an absent envelope, never an authentication failure
fn discard(error: &envelope::Error, kind: &str) {
    use std::error::Error;

    match error.source() {
        Some(source) => warn!(%error, %source, kind, "discarding unreadable envelope"),
        None => warn!(%error, kind, "discarding unreadable envelope"),
    }
}

fn is_https<B>(req: &Request<B>) -> bool {
    if let Some(scheme) = req.uri().scheme_str() {
        return scheme == "https";
    }

    req.headers()
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}
