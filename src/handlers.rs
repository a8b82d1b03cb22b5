use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{error, instrument};

use crate::extract::{Auth, AuthMut};
use crate::login::{BoxError, CallMode, ImpersonationTarget, LoginContext};
use crate::response;
use crate::service::AuthService;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// The current authentication as a bearer-usable response
#[instrument(name = "token", skip_all)]
pub(crate) async fn token(State(service): State<Arc<AuthService>>, auth: Auth) -> Json<Value> {
    Json(response::auth_body(&service, auth.current()))
}

/// The current authentication after the resolver's sliding renewal
#[instrument(name = "refresh", skip_all)]
pub(crate) async fn refresh(State(service): State<Arc<AuthService>>, auth: Auth) -> Json<Value> {
    Json(response::auth_body(&service, auth.current()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BasicLoginBody {
    user_name: String,
    password: String,
    #[serde(default)]
    remember_me: bool,
    #[serde(default)]
    impersonate_actual_user: bool,
}

#[instrument(name = "basic_login", skip_all)]
pub(crate) async fn basic_login(
    State(service): State<Arc<AuthService>>,
    mut auth: AuthMut,
    Json(body): Json<BasicLoginBody>,
) -> Response {
    let mut ctx = LoginContext::new(CallMode::Direct, "Basic", auth.current().clone());
    ctx.remember_me = body.remember_me;
    ctx.impersonate_actual_user = body.impersonate_actual_user;

    if let Some(updated) = service
        .basic_login(&mut ctx, body.user_name, body.password)
        .await
    {
        auth.replace(updated);
    }

    let body = response::login_body(&service, &ctx, auth.current());
    response::deliver(&ctx, body)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DirectLoginBody {
    provider: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    remember_me: bool,
    #[serde(default)]
    impersonate_actual_user: bool,
}

/// Direct login with a raw scheme payload, bypassing the interactive flow
#[instrument(name = "unsafe_direct_login", skip_all, fields(provider = %body.provider))]
pub(crate) async fn unsafe_direct_login(
    State(service): State<Arc<AuthService>>,
    mut auth: AuthMut,
    Json(body): Json<DirectLoginBody>,
) -> Response {
    let mut ctx = LoginContext::new(CallMode::Direct, body.provider, auth.current().clone());
    ctx.remember_me = body.remember_me;
    ctx.impersonate_actual_user = body.impersonate_actual_user;
    ctx.payload = body.payload.clone();

    if let Some(updated) = service.scheme_login(&mut ctx, body.payload).await {
        auth.replace(updated);
    }

    let body = response::login_body(&service, &ctx, auth.current());
    response::deliver(&ctx, body)
}

/// Begin an interactive flow: validate, pack the flow properties and bounce
/// to the remote scheme
#[instrument(name = "start_login", skip_all)]
pub(crate) async fn start_login(
    State(service): State<Arc<AuthService>>,
    Query(params): Query<Vec<(String, String)>>,
    auth: Auth,
) -> Result<Response> {
    let mut scheme = None;
    let mut return_url = None;
    let mut caller_origin = None;
    let mut remember_me = false;
    let mut impersonate_actual_user = false;
    let mut user_data = Vec::new();

    for (key, value) in params {
        match key.as_str() {
            "scheme" => scheme = Some(value),
            "returnUrl" => return_url = Some(value),
            "callerOrigin" => caller_origin = Some(value),
            "rememberMe" => remember_me = flag(&value),
            "impersonateActualUser" => impersonate_actual_user = flag(&value),
            _ => {
                if let Some(name) = key.strip_prefix("userData.") {
                    user_data.push((name.to_owned(), Some(value)));
                }
            }
        }
    }

    let scheme = scheme.ok_or(Error::MissingScheme)?;

    let mut ctx = LoginContext::new(CallMode::StartLogin, scheme, auth.current().clone());
    ctx.return_url = return_url;
    ctx.caller_origin = caller_origin;
    ctx.remember_me = remember_me;
    ctx.impersonate_actual_user = impersonate_actual_user;
    ctx.user_data = user_data;

    match service.start_login(&mut ctx) {
        Some(url) => {
            Ok((StatusCode::FOUND, [(axum::http::header::LOCATION, url)]).into_response())
        }
        None => {
            let body = response::login_body(&service, &ctx, auth.current());
            Ok(response::deliver(&ctx, body))
        }
    }
}

/// A query flag is set unless explicitly turned off
fn flag(value: &str) -> bool {
    !matches!(value, "false" | "False" | "0")
}

/// Clear both cookies; the in-flight authentication is left as resolved
#[instrument(name = "logout", skip_all)]
pub(crate) async fn logout(mut auth: AuthMut) -> StatusCode {
    auth.schedule_logout();
    StatusCode::OK
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImpersonateBody {
    user_id: Option<u64>,
    user_name: Option<String>,
}

#[instrument(name = "impersonate", skip_all)]
pub(crate) async fn impersonate(
    State(service): State<Arc<AuthService>>,
    mut auth: AuthMut,
    Json(body): Json<ImpersonateBody>,
) -> Result<Json<Value>> {
    if !service.has_impersonation() {
        return Err(Error::ImpersonationUnavailable);
    }

    let target = match (body.user_id, body.user_name) {
        (Some(id), None) => ImpersonationTarget::UserId(id),
        (None, Some(name)) => ImpersonationTarget::UserName(name),
        _ => return Err(Error::AmbiguousImpersonationTarget),
    };

    let updated = service
        .impersonate(auth.current(), target, Utc::now())
        .await?
        .ok_or(Error::ImpersonationDenied)?;
    auth.replace(updated);

    Ok(Json(response::auth_body(&service, auth.current())))
}

/// Errors that can occur in request handlers
#[derive(Debug)]
pub(crate) enum Error {
    /// An interactive flow needs the scheme to challenge
    MissingScheme,
    /// No impersonation service is configured
    ImpersonationUnavailable,
    /// The impersonation target is missing or doubled
    AmbiguousImpersonationTarget,
    /// The impersonation service declined the target
    ImpersonationDenied,
    Impersonation(BoxError),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingScheme => write!(f, "missing scheme parameter"),
            Self::ImpersonationUnavailable => write!(f, "impersonation is not available"),
            Self::AmbiguousImpersonationTarget => write!(f, "ambiguous impersonation target"),
            Self::ImpersonationDenied => write!(f, "impersonation denied"),
            Self::Impersonation(_) => write!(f, "unexpected impersonation error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Impersonation(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<BoxError> for Error {
    fn from(error: BoxError) -> Self {
        Self::Impersonation(error)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        use std::error::Error as _;

        match self {
            Self::MissingScheme => {
                return ApiError::response(
                    "the scheme parameter is required",
                    StatusCode::UNPROCESSABLE_ENTITY,
                )
            }
            Self::ImpersonationUnavailable => {
                return ApiError::response("impersonation is not available", StatusCode::NOT_FOUND)
            }
            Self::AmbiguousImpersonationTarget => {
                return ApiError::response(
                    "exactly one of userId and userName is required",
                    StatusCode::UNPROCESSABLE_ENTITY,
                )
            }
            Self::ImpersonationDenied => {
                return ApiError::response("forbidden", StatusCode::FORBIDDEN)
            }
            Self::Impersonation(error) => match error.source() {
                Some(source) => error!(%error, %source, "impersonation service failed"),
                None => error!(%error, "impersonation service failed"),
            },
        };

        ApiError::internal_server_error()
    }
}

#[derive(Serialize)]
struct ApiError {
    message: &'static str,
}

impl ApiError {
    fn response(message: &'static str, status: StatusCode) -> Response {
        (status, Json(ApiError { message })).into_response()
    }

    fn internal_server_error() -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError {
                message: "internal server error",
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use crate::envelope::protect_auth;
    use crate::info::{AuthenticationInfo, FrontAuthentication, UserInfo};
    use crate::login::{BoxError, LoginService, UserLoginResult};
    use crate::options::{DynamicOptions, FixedOptions, OptionsWatch};
    use crate::service::AuthService;
    use axum::{body::Body, http::Request, Router};
    use chrono::{Duration, Utc};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Accepts Alice with the right password, everything else fails
    struct AliceOnly;

    #[axum::async_trait]
    impl LoginService for AliceOnly {
        async fn login(
            &self,
            _scheme: &str,
            _payload: Value,
            _actual_login: bool,
        ) -> Result<UserLoginResult, BoxError> {
            Ok(UserLoginResult::failure(1, "unknown provider"))
        }

        async fn basic_login(
            &self,
            user_name: &str,
            password: &str,
            _actual_login: bool,
        ) -> Result<UserLoginResult, BoxError> {
            if user_name == "Alice" && password == "pw" {
                Ok(UserLoginResult::success(UserInfo::new(1, "Alice", vec![])))
            } else {
                Ok(UserLoginResult::failure(1, "invalid credentials"))
            }
        }
    }

    fn router() -> (Arc<AuthService>, Router) {
        let service = Arc::new(
            AuthService::builder(
                "a test secret",
                FixedOptions {
                    allowed_return_urls: vec![String::from("https://good/")],
                    ..FixedOptions::default()
                },
                OptionsWatch::fixed(DynamicOptions::default()),
                Arc::new(AliceOnly),
            )
            .build(),
        );

        (service.clone(), crate::router(service))
    }

    fn alice_auth() -> FrontAuthentication {
        FrontAuthentication {
            info: AuthenticationInfo::new(
                UserInfo::new(1, "Alice", vec![]),
                Some(Utc::now() + Duration::hours(6)),
                None,
                "D1",
            ),
            remember_me: false,
        }
    }

    fn set_cookies(response: &axum::response::Response) -> Vec<String> {
        response
            .headers()
            .get_all("set-cookie")
            .iter()
            .map(|value| value.to_str().unwrap().to_owned())
            .collect()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn basic_login_commits_and_sets_the_cookie() {
        let (_, router) = router();

        let request = Request::builder()
            .method("POST")
            .uri("/c/basicLogin")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"userName": "Alice", "password": "pw", "rememberMe": true}).to_string(),
            ))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        let cookies = set_cookies(&response);
        assert!(cookies.iter().any(|c| c.starts_with(".webFront=")));
        assert!(cookies.iter().any(|c| c.starts_with(".webFrontLT=")));

        let body = body_json(response).await;
        assert_eq!(body["info"]["user"]["userId"], 1);
        assert!(body["token"].is_string());
        assert_eq!(body["rememberMe"], true);
        assert!(body.get("loginFailureCode").is_none());
    }

    #[tokio::test]
    async fn a_failed_basic_login_reports_and_resets() {
        let (service, router) = router();

        // Alice is currently authenticated with device D1
        let cookie = protect_auth(&service.protectors().cookie, &alice_auth());

        let request = Request::builder()
            .method("POST")
            .uri("/c/basicLogin")
            .header("content-type", "application/json")
            .header("cookie", format!(".webFront={cookie}"))
            .body(Body::from(
                json!({"userName": "Alice", "password": "wrong"}).to_string(),
            ))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        // the session cookie goes away, the device survives in the long-term
        // cookie
        let cookies = set_cookies(&response);
        assert!(cookies
            .iter()
            .any(|c| c.starts_with(".webFront=") && c.contains("Max-Age=0")));
        let device = cookies
            .iter()
            .find(|c| c.starts_with(".webFrontLT="))
            .expect("the device cookie must survive");
        assert!(device.contains("D1"));

        let body = body_json(response).await;
        assert_eq!(body["loginFailureCode"], 1);
        assert_eq!(body["loginFailureReason"], "invalid credentials");
        assert!(body["info"].is_null());
    }

    #[tokio::test]
    async fn logout_clears_the_cookies() {
        let (service, router) = router();

        let mut auth = alice_auth();
        auth.remember_me = true;
        let cookie = protect_auth(&service.protectors().cookie, &auth);

        let request = Request::builder()
            .uri("/c/logout")
            .header("cookie", format!(".webFront={cookie}"))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), 200);
        assert!(set_cookies(&response)
            .iter()
            .any(|c| c.starts_with(".webFront=") && c.contains("Max-Age=0")));
    }

    #[tokio::test]
    async fn impersonation_is_not_found_without_the_capability() {
        let (_, router) = router();

        let request = Request::builder()
            .method("POST")
            .uri("/c/impersonate")
            .header("content-type", "application/json")
            .body(Body::from(json!({"userId": 2}).to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn start_login_rejects_a_disallowed_return_url() {
        let (_, router) = router();

        let request = Request::builder()
            .uri("/c/startLogin?scheme=Provider&returnUrl=https%3A%2F%2Fevil%2Fcb")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), 302);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "https://evil/cb?errorId=DisallowedReturnUrl"
        );
    }

    #[tokio::test]
    async fn the_token_endpoint_reflects_the_bearer() {
        let (service, router) = router();

        let token = protect_auth(&service.protectors().token, &alice_auth());

        let request = Request::builder()
            .uri("/c/token")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();

        let body = body_json(response).await;
        assert_eq!(body["info"]["user"]["userName"], "Alice");
    }
}
