//! Renders login outcomes: the JSON bodies and the redirect or popup
//! delivery of interactive flows.

use axum::{
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
};
use serde_json::{json, Value};

use crate::info::{AuthLevel, FrontAuthentication};
use crate::login::LoginContext;
use crate::service::AuthService;

/// The body every authentication-bearing endpoint answers with
pub(crate) fn auth_body(service: &AuthService, auth: &FrontAuthentication) -> Value {
    let info = (auth.info.level() > AuthLevel::None)
        .then(|| serde_json::to_value(&auth.info).expect("authentication info must serialize"));

    json!({
        "info": info,
        "token": service.create_token(auth),
        "refreshable": service.refreshable(auth),
        "rememberMe": auth.remember_me,
    })
}

/// The login body: the authentication plus error and failure details
pub(crate) fn login_body(
    service: &AuthService,
    ctx: &LoginContext,
    auth: &FrontAuthentication,
) -> Value {
    let mut body = auth_body(service, auth);
    let map = body.as_object_mut().expect("the auth body is an object");

    if !ctx.has_error() && ctx.failed.is_none() {
        return body;
    }

    if let Some(error) = ctx.error() {
        map.insert(String::from("errorId"), json!(error.id));
        if error.text != error.id {
            map.insert(String::from("errorText"), json!(error.text));
        }
    }
    if let Some(scheme) = &ctx.initial_scheme {
        map.insert(String::from("initialScheme"), json!(scheme));
    }
    map.insert(String::from("callingScheme"), json!(ctx.calling_scheme));
    if !ctx.user_data.is_empty() {
        map.insert(String::from("userData"), json!(ctx.user_data));
    }
    if let Some(failed) = &ctx.failed {
        map.insert(String::from("loginFailureCode"), json!(failed.failure_code));
        if let Some(reason) = &failed.failure_reason {
            map.insert(String::from("loginFailureReason"), json!(reason));
        }
    }

    body
}

/// Deliver `body` the way the flow asked for it: a redirect when a return
/// URL drives the flow, a popup message for an opener window, plain JSON
/// otherwise
pub(crate) fn deliver(ctx: &LoginContext, body: Value) -> Response {
    if let Some(url) = &ctx.return_url {
        redirect(url, ctx)
    } else if let Some(origin) = &ctx.caller_origin {
        popup(origin, &body)
    } else {
        Json(body).into_response()
    }
}

/// A `302 Found` to the return URL with the error parameters appended
fn redirect(url: &str, ctx: &LoginContext) -> Response {
    let mut query = form_urlencoded::Serializer::new(String::new());

    if let Some(error) = ctx.error() {
        query.append_pair("errorId", &error.id);
        if error.text != error.id {
            query.append_pair("errorText", &error.text);
        }
    }
    if let Some(failed) = &ctx.failed {
        query.append_pair("loginFailureCode", &failed.failure_code.to_string());
        if let Some(scheme) = &ctx.initial_scheme {
            query.append_pair("initialScheme", scheme);
        }
        query.append_pair("callingScheme", &ctx.calling_scheme);
    }

    let query = query.finish();
    let target = if query.is_empty() {
        url.to_owned()
    } else if url.contains('?') {
        format!("{url}&{query}")
    } else {
        format!("{url}?{query}")
    };

    (StatusCode::FOUND, [(header::LOCATION, target)]).into_response()
}

/// An HTML page that posts the body to the opener and closes itself
fn popup(origin: &str, body: &Value) -> Response {
    let payload = escaped_json(body);
    let target = escaped_json(&json!(origin));

    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"></head>\n<body>\n<script>\n\
         (function() {{\n  window.opener.postMessage({payload}, {target});\n  window.close();\n}})();\n\
         </script>\n</body>\n</html>\n"
    ))
    .into_response()
}

/// Serialize for embedding in a script element: `<` must never appear
fn escaped_json(value: &Value) -> String {
    serde_json::to_string(value)
        .expect("response body must serialize")
        .replace('<', "\\u003c")
}

#[cfg(test)]
mod tests {
    use super::{auth_body, deliver, login_body};
    use crate::info::{AuthenticationInfo, FrontAuthentication, UserInfo};
    use crate::login::{
        error_ids, BoxError, CallMode, LoginContext, LoginService, UserLoginResult,
    };
    use crate::options::{DynamicOptions, FixedOptions, OptionsWatch};
    use crate::service::AuthService;
    use axum::http::StatusCode;
    use chrono::{Duration, Utc};
    use serde_json::Value;
    use std::sync::Arc;

    struct NoLogin;

    #[axum::async_trait]
    impl LoginService for NoLogin {
        async fn login(
            &self,
            _scheme: &str,
            _payload: Value,
            _actual_login: bool,
        ) -> Result<UserLoginResult, BoxError> {
            Ok(UserLoginResult::failure(1, "unsupported"))
        }
    }

    fn service(sliding: Duration) -> AuthService {
        AuthService::builder(
            "a test secret",
            FixedOptions::default(),
            OptionsWatch::fixed(DynamicOptions {
                sliding_expiration_time: sliding,
                ..DynamicOptions::default()
            }),
            Arc::new(NoLogin),
        )
        .build()
    }

    fn alice() -> FrontAuthentication {
        FrontAuthentication {
            info: AuthenticationInfo::new(
                UserInfo::new(1, "Alice", vec![]),
                Some(Utc::now() + Duration::hours(6)),
                None,
                "D1",
            ),
            remember_me: true,
        }
    }

    #[test]
    fn success_body_carries_info_and_token() {
        let service = service(Duration::minutes(10));
        let body = auth_body(&service, &alice());

        assert_eq!(body["info"]["user"]["userId"], 1);
        assert!(body["token"].is_string());
        assert_eq!(body["refreshable"], true);
        assert_eq!(body["rememberMe"], true);
    }

    #[test]
    fn empty_authentication_has_null_info_and_token() {
        let service = service(Duration::minutes(10));
        let body = auth_body(&service, &FrontAuthentication::none());

        assert!(body["info"].is_null());
        assert!(body["token"].is_null());
        assert_eq!(body["refreshable"], false);
    }

    #[test]
    fn refreshable_requires_a_sliding_window() {
        let service = service(Duration::zero());
        let body = auth_body(&service, &alice());

        assert_eq!(body["refreshable"], false);
    }

    #[test]
    fn error_text_is_omitted_when_it_repeats_the_id() {
        let service = service(Duration::zero());

        let mut ctx = LoginContext::new(CallMode::Direct, "Basic", FrontAuthentication::none());
        ctx.set_error(
            error_ids::DISALLOWED_RETURN_URL,
            error_ids::DISALLOWED_RETURN_URL,
        );
        let body = login_body(&service, &ctx, &FrontAuthentication::none());

        assert_eq!(body["errorId"], error_ids::DISALLOWED_RETURN_URL);
        assert!(body.get("errorText").is_none());
        assert_eq!(body["callingScheme"], "Basic");
    }

    #[test]
    fn failure_body_reports_the_backend_code() {
        let service = service(Duration::zero());

        let mut ctx = LoginContext::new(CallMode::Direct, "Basic", alice());
        ctx.failed = Some(UserLoginResult::failure(1, "invalid credentials"));
        let body = login_body(&service, &ctx, &FrontAuthentication::anonymous("D1"));

        assert!(body.get("errorId").is_none());
        assert_eq!(body["loginFailureCode"], 1);
        assert_eq!(body["loginFailureReason"], "invalid credentials");
        assert!(body["info"].is_null());
    }

    #[test]
    fn a_clean_login_body_has_no_error_keys() {
        let service = service(Duration::zero());

        let ctx = LoginContext::new(CallMode::Direct, "Basic", FrontAuthentication::none());
        let body = login_body(&service, &ctx, &alice());

        assert!(body.get("errorId").is_none());
        assert!(body.get("callingScheme").is_none());
        assert!(body.get("loginFailureCode").is_none());
    }

    #[test]
    fn errors_redirect_to_the_return_url() {
        let mut ctx = LoginContext::new(CallMode::StartLogin, "Provider", FrontAuthentication::none());
        ctx.return_url = Some(String::from("https://evil/cb"));
        ctx.set_error(
            error_ids::DISALLOWED_RETURN_URL,
            error_ids::DISALLOWED_RETURN_URL,
        );

        let response = deliver(&ctx, Value::Null);
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "https://evil/cb?errorId=DisallowedReturnUrl"
        );
    }

    #[test]
    fn redirects_append_to_an_existing_query() {
        let mut ctx = LoginContext::new(CallMode::StartLogin, "Provider", FrontAuthentication::none());
        ctx.return_url = Some(String::from("https://good/cb?state=7"));
        ctx.failed = Some(UserLoginResult::failure(2, "expired"));

        let response = deliver(&ctx, Value::Null);
        let location = response.headers().get("location").unwrap().to_str().unwrap();

        assert!(location.starts_with("https://good/cb?state=7&"));
        assert!(location.contains("loginFailureCode=2"));
        assert!(location.contains("callingScheme=Provider"));
    }

    #[test]
    fn popup_flows_post_to_the_caller_origin() {
        let service = service(Duration::zero());

        let mut ctx = LoginContext::new(CallMode::StartLogin, "Provider", FrontAuthentication::none());
        ctx.caller_origin = Some(String::from("https://good"));
        let body = login_body(&service, &ctx, &alice());

        let response = deliver(&ctx, body);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/html"));
    }

    #[test]
    fn script_payloads_never_contain_an_open_angle() {
        let escaped = super::escaped_json(&serde_json::json!({
            "userName": "</script><script>alert(1)</script>",
        }));

        assert!(!escaped.contains('<'));
    }
}
