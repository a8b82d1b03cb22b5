use axum_extra::extract::CookieJar;
use chrono::{DateTime, Utc};
use cookie::{Cookie, SameSite};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::envelope::{protect_auth, Protectors};
use crate::info::{AuthLevel, FrontAuthentication, SchemeUsage};
use crate::options::{CookieMode, CookieSecurePolicy, DynamicOptions, FixedOptions};

/// Plaintext payload of the long-term cookie
///
/// The client-side SDK inspects this JSON, so the key names are fixed. An
/// entry holding only a device id is valid.
#[derive(Debug, Default, Deserialize, Serialize)]
pub(crate) struct LongTermPayload {
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(rename = "userName", default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemes: Option<Vec<SchemeUsage>>,
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Emit or clear both cookies so they reflect `auth`
///
/// Each cookie that fails its precondition is explicitly deleted so the
/// browser discards any stale copy.
pub(crate) fn set_cookies(
    jar: CookieJar,
    auth: &FrontAuthentication,
    protectors: &Protectors,
    fixed: &FixedOptions,
    dynamic: &DynamicOptions,
    secure_request: bool,
    now: DateTime<Utc>,
) -> CookieJar {
    let jar = set_long_term_cookie(jar, auth, fixed, dynamic, now);
    set_session_cookie(jar, auth, protectors, fixed, secure_request, now)
}

/// Delete both cookies, leaving the request's authentication untouched
pub(crate) fn clear_cookies(
    jar: CookieJar,
    fixed: &FixedOptions,
    secure_request: bool,
) -> CookieJar {
    let jar = remove(jar, fixed.long_term_cookie_name(), fixed, false);
    match fixed.cookie_mode {
        CookieMode::None => jar,
        _ => {
            let secure = session_secure(fixed, secure_request);
            remove(jar, fixed.auth_cookie_name.clone(), fixed, secure)
        }
    }
}

fn set_long_term_cookie(
    jar: CookieJar,
    auth: &FrontAuthentication,
    fixed: &FixedOptions,
    dynamic: &DynamicOptions,
    now: DateTime<Utc>,
) -> CookieJar {
    let remembered = auth.remember_me && !auth.info.actual_user().is_anonymous();
    let device_id = auth.info.device_id();

    if !dynamic.use_long_term_cookie || (!remembered && device_id.is_empty()) {
        return remove(jar, fixed.long_term_cookie_name(), fixed, false);
    }

    let mut payload = if remembered {
        let actual = auth.info.actual_user();
        LongTermPayload {
            user_id: Some(actual.user_id()),
            user_name: Some(actual.user_name().to_owned()),
            schemes: Some(actual.schemes().to_vec()),
            device_id: None,
        }
    } else {
        LongTermPayload::default()
    };
    if !device_id.is_empty() {
        payload.device_id = Some(device_id.to_owned());
    }

    let value = serde_json::to_string(&payload).expect("long-term payload must serialize");
    let cookie = Cookie::build(fixed.long_term_cookie_name(), value)
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(false)
        .path(fixed.cookie_path().to_owned())
        .expires(expiration(now + dynamic.unsafe_expire_time_span))
        .finish();

    jar.add(cookie)
}

fn set_session_cookie(
    jar: CookieJar,
    auth: &FrontAuthentication,
    protectors: &Protectors,
    fixed: &FixedOptions,
    secure_request: bool,
    now: DateTime<Utc>,
) -> CookieJar {
    if fixed.cookie_mode == CookieMode::None {
        return jar;
    }

    let secure = session_secure(fixed, secure_request);
    if auth.info.level_at(now) < AuthLevel::Normal {
        return remove(jar, fixed.auth_cookie_name.clone(), fixed, secure);
    }

    let mut cookie = Cookie::build(
        fixed.auth_cookie_name.clone(),
        protect_auth(&protectors.cookie, auth),
    )
    .http_only(true)
    .same_site(SameSite::Lax)
    .secure(secure)
    .path(fixed.cookie_path().to_owned())
    .finish();

    // a session-scoped cookie unless the client asked to be remembered
    if auth.remember_me {
        if let Some(expires) = auth.info.expires() {
            cookie.set_expires(expiration(expires));
        }
    }

    jar.add(cookie)
}

fn session_secure(fixed: &FixedOptions, secure_request: bool) -> bool {
    match fixed.cookie_secure_policy {
        CookieSecurePolicy::None => false,
        CookieSecurePolicy::Always => true,
        CookieSecurePolicy::SameAsRequest => secure_request,
    }
}

fn remove(jar: CookieJar, name: String, fixed: &FixedOptions, secure: bool) -> CookieJar {
    let cookie = Cookie::build(name, "")
        .http_only(true)
        .secure(secure)
        .path(fixed.cookie_path().to_owned())
        .finish();

    jar.remove(cookie)
}

fn expiration(instant: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(instant.timestamp()).expect("timestamp must be valid")
}

#[cfg(test)]
mod tests {
    use super::{clear_cookies, set_cookies, LongTermPayload};
    use crate::envelope::{unprotect_auth, Protectors};
    use crate::info::{AuthenticationInfo, FrontAuthentication, UserInfo};
    use crate::options::{CookieMode, CookieSecurePolicy, DynamicOptions, FixedOptions};
    use axum_extra::extract::CookieJar;
    use chrono::{Duration, Utc};

    fn alice(remember_me: bool) -> FrontAuthentication {
        FrontAuthentication {
            info: AuthenticationInfo::new(
                UserInfo::new(1, "Alice", vec![]),
                Some(Utc::now() + Duration::hours(6)),
                None,
                "D1",
            ),
            remember_me,
        }
    }

    #[test]
    fn session_cookie_is_persistent_only_when_remembered() {
        let protectors = Protectors::new("a test secret");
        let fixed = FixedOptions::default();
        let dynamic = DynamicOptions::default();
        let now = Utc::now();

        let jar = set_cookies(
            CookieJar::new(),
            &alice(true),
            &protectors,
            &fixed,
            &dynamic,
            false,
            now,
        );
        let cookie = jar.get(".webFront").expect("session cookie must be set");
        assert!(cookie.expires().is_some());
        assert_eq!(cookie.path(), Some("/c"));
        assert_eq!(cookie.http_only(), Some(true));

        let jar = set_cookies(
            CookieJar::new(),
            &alice(false),
            &protectors,
            &fixed,
            &dynamic,
            false,
            now,
        );
        let cookie = jar.get(".webFront").expect("session cookie must be set");
        assert!(cookie.expires().is_none());
    }

    #[test]
    fn session_cookie_value_holds_the_envelope() {
        let protectors = Protectors::new("a test secret");
        let fixed = FixedOptions::default();
        let auth = alice(true);

        let jar = set_cookies(
            CookieJar::new(),
            &auth,
            &protectors,
            &fixed,
            &DynamicOptions::default(),
            false,
            Utc::now(),
        );
        let cookie = jar.get(".webFront").unwrap();

        let recovered = unprotect_auth(&protectors.cookie, cookie.value()).unwrap();
        assert_eq!(recovered.info.user().user_id(), 1);
        assert!(recovered.remember_me);
    }

    #[test]
    fn below_normal_clears_the_session_cookie() {
        let protectors = Protectors::new("a test secret");
        let fixed = FixedOptions::default();
        let auth = FrontAuthentication::anonymous("D1");

        let jar = set_cookies(
            jar_with(".webFront=stale"),
            &auth,
            &protectors,
            &fixed,
            &DynamicOptions::default(),
            false,
            Utc::now(),
        );

        let removal = set_cookie_headers(jar)
            .into_iter()
            .find(|h| h.starts_with(".webFront="))
            .expect("a removal cookie must be emitted");
        assert!(removal.contains("Max-Age=0"));
    }

    #[test]
    fn long_term_cookie_remembers_the_actual_user() {
        let protectors = Protectors::new("a test secret");
        let fixed = FixedOptions::default();

        let jar = set_cookies(
            CookieJar::new(),
            &alice(true),
            &protectors,
            &fixed,
            &DynamicOptions::default(),
            false,
            Utc::now(),
        );
        let cookie = jar.get(".webFrontLT").expect("long-term cookie must be set");
        assert_eq!(cookie.secure(), Some(false));

        let payload: LongTermPayload = serde_json::from_str(cookie.value()).unwrap();
        assert_eq!(payload.user_id, Some(1));
        assert_eq!(payload.user_name.as_deref(), Some("Alice"));
        assert_eq!(payload.device_id.as_deref(), Some("D1"));
    }

    #[test]
    fn long_term_cookie_keeps_only_the_device_without_remember() {
        let protectors = Protectors::new("a test secret");
        let fixed = FixedOptions::default();

        let jar = set_cookies(
            CookieJar::new(),
            &alice(false),
            &protectors,
            &fixed,
            &DynamicOptions::default(),
            false,
            Utc::now(),
        );
        let payload: LongTermPayload =
            serde_json::from_str(jar.get(".webFrontLT").unwrap().value()).unwrap();

        assert_eq!(payload.user_id, None);
        assert_eq!(payload.device_id.as_deref(), Some("D1"));
    }

    #[test]
    fn disabling_the_long_term_cookie_clears_it() {
        let protectors = Protectors::new("a test secret");
        let fixed = FixedOptions::default();
        let dynamic = DynamicOptions {
            use_long_term_cookie: false,
            ..DynamicOptions::default()
        };

        let jar = set_cookies(
            jar_with(".webFrontLT=stale"),
            &alice(true),
            &protectors,
            &fixed,
            &dynamic,
            false,
            Utc::now(),
        );
        let removal = set_cookie_headers(jar)
            .into_iter()
            .find(|h| h.starts_with(".webFrontLT="))
            .expect("a removal cookie must be emitted");
        assert!(removal.contains("Max-Age=0"));
    }

    #[test]
    fn secure_follows_the_policy() {
        let protectors = Protectors::new("a test secret");
        let mut fixed = FixedOptions::default();
        fixed.cookie_secure_policy = CookieSecurePolicy::Always;

        let jar = set_cookies(
            CookieJar::new(),
            &alice(true),
            &protectors,
            &fixed,
            &DynamicOptions::default(),
            false,
            Utc::now(),
        );
        assert_eq!(jar.get(".webFront").unwrap().secure(), Some(true));

        fixed.cookie_secure_policy = CookieSecurePolicy::SameAsRequest;
        let jar = set_cookies(
            CookieJar::new(),
            &alice(true),
            &protectors,
            &fixed,
            &DynamicOptions::default(),
            true,
            Utc::now(),
        );
        assert_eq!(jar.get(".webFront").unwrap().secure(), Some(true));
    }

    #[test]
    fn logout_clears_both_cookies() {
        let mut fixed = FixedOptions::default();
        fixed.cookie_mode = CookieMode::RootPath;

        let jar = jar_with(".webFront=stale; .webFrontLT=stale");
        let headers = set_cookie_headers(clear_cookies(jar, &fixed, false));

        assert!(headers
            .iter()
            .any(|h| h.starts_with(".webFront=") && h.contains("Max-Age=0")));
        assert!(headers
            .iter()
            .any(|h| h.starts_with(".webFrontLT=") && h.contains("Max-Age=0")));
    }

    /// A jar seeded with request cookies, so removals register in the delta
    fn jar_with(header: &str) -> CookieJar {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::COOKIE, header.parse().unwrap());
        CookieJar::from_headers(&headers)
    }

    /// Render the jar's delta as its `Set-Cookie` header values
    fn set_cookie_headers(jar: CookieJar) -> Vec<String> {
        use axum::http::header::SET_COOKIE;
        use axum::response::IntoResponse;

        let response = jar.into_response();
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|value| value.to_str().unwrap().to_owned())
            .collect()
    }
}
