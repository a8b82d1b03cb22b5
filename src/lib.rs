//! Stateless web front authentication: envelopes carried as a bearer token
//! or cookies, a pluggable multi-scheme login pipeline, sliding expiration,
//! critical-level elevation, device identity and impersonation.
//!
//! The [`AuthLayer`] resolves every request's authentication into a
//! request-scoped slot; the [`Auth`]/[`AuthMut`] extractors read it; the
//! [`router`] exposes the login endpoints under the configured entry path.

mod cookies;
mod envelope;
mod extract;
mod handlers;
mod info;
pub mod logging;
mod login;
mod middleware;
mod options;
mod response;
mod service;

pub use envelope::{Error as EnvelopeError, ExtraData, Protector, Protectors};
pub use extract::{Auth, AuthMut};
pub use info::{
    mint_device_id, AuthLevel, AuthenticationInfo, FrontAuthentication, SchemeUsage, UserInfo,
};
pub use login::{
    error_ids, flow_keys, AutoBindService, AutoCreateService, BoxError, CallMode, ContextError,
    FlowProperties, ImpersonationService, ImpersonationTarget, LoginContext, LoginService,
    LoginValidator, RemoteChallenger, UserLoginResult,
};
pub use middleware::{AuthLayer, Handle, RequestAuth};
pub use options::{
    cookie_mode_parser, critical_span_parser, secure_policy_parser, CookieMode,
    CookieSecurePolicy, DynamicOptions, FixedOptions, OptionsWatch,
};
pub use service::{AuthService, Builder};

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

/// Setup the authentication endpoints under the configured entry path
pub fn router(service: Arc<AuthService>) -> Router {
    let entry = service.fixed().entry_path.clone();

    let endpoints = Router::new()
        .route("/token", get(handlers::token))
        .route("/refresh", get(handlers::refresh))
        .route("/basicLogin", post(handlers::basic_login))
        .route("/unsafeDirectLogin", post(handlers::unsafe_direct_login))
        .route("/startLogin", get(handlers::start_login))
        .route("/logout", get(handlers::logout))
        .route("/impersonate", post(handlers::impersonate));

    Router::new()
        .nest(&entry, endpoints)
        .with_state(service.clone())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(AuthLayer::new(service))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
