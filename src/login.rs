//! Contracts honored by the pluggable login collaborators and the context a
//! login operation accumulates while it runs.

use axum::async_trait;
use serde_json::Value;

use crate::envelope::ExtraData;
use crate::info::{FrontAuthentication, UserInfo};

/// Errors raised by external collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stable error identifiers surfaced to clients
pub mod error_ids {
    /// Exactly one of `returnUrl` and `callerOrigin` must be provided
    pub const RETURN_X_OR_CALLER: &str = "ReturnXOrCaller";
    /// The `returnUrl` does not match any allowed prefix
    pub const DISALLOWED_RETURN_URL: &str = "DisallowedReturnUrl";
    /// Logging in while impersonating requires `impersonateActualUser`
    pub const LOGIN_WHILE_IMPERSONATION: &str = "LoginWhileImpersonation";
    /// An unregistered user cannot be bound to the current account
    pub const AUTO_BINDING_DISABLED: &str = "Account.AutoBindingDisabled";
    /// An unregistered user cannot be registered on the fly
    pub const AUTO_REGISTRATION_DISABLED: &str = "User.AutoRegistrationDisabled";
    /// A collaborator failed; details are in the logs
    pub const INTERNAL_ERROR: &str = "InternalError";
}

/// Keys of the authentication properties propagated through redirect-based
/// flows
pub mod flow_keys {
    /// The protected envelope of the authentication at flow start
    pub const CURRENT_AUTH: &str = "WFA2C";
    /// The scheme that initiated the flow
    pub const INITIAL_SCHEME: &str = "WFA2S";
    /// Origin of the opener window for popup flows
    pub const CALLER_ORIGIN: &str = "WFA2O";
    /// Redirect target for full-page flows
    pub const RETURN_URL: &str = "WFA2R";
    /// The protected extra-data dictionary
    pub const USER_DATA: &str = "WFA2D";
    /// Present (with an empty value) when re-logging the actual user
    pub const IMPERSONATE_ACTUAL_USER: &str = "WFA2I";
}

/// Outcome of a backend login attempt
///
/// Success is carrying a user; everything else describes the failure.
#[derive(Debug, Clone, PartialEq)]
pub struct UserLoginResult {
    pub user_info: Option<UserInfo>,
    pub failure_code: i32,
    pub failure_reason: Option<String>,
    pub is_unregistered_user: bool,
}

impl UserLoginResult {
    pub fn success(user: UserInfo) -> Self {
        Self {
            user_info: Some(user),
            failure_code: 0,
            failure_reason: None,
            is_unregistered_user: false,
        }
    }

    pub fn failure(code: i32, reason: impl Into<String>) -> Self {
        Self {
            user_info: None,
            failure_code: code,
            failure_reason: Some(reason.into()),
            is_unregistered_user: false,
        }
    }

    /// A failure because the provider account maps to no registered user
    pub fn unregistered(code: i32, reason: impl Into<String>) -> Self {
        Self {
            user_info: None,
            failure_code: code,
            failure_reason: Some(reason.into()),
            is_unregistered_user: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.user_info.is_some()
    }
}

/// The login backend
///
/// `actual_login` distinguishes a dry run (a configured validator has not
/// approved the login yet) from the real thing; backends must only record
/// side effects on the actual call.
#[async_trait]
pub trait LoginService: Send + Sync {
    async fn login(
        &self,
        scheme: &str,
        payload: Value,
        actual_login: bool,
    ) -> Result<UserLoginResult, BoxError>;

    /// Direct user name and password login, when the backend supports it
    async fn basic_login(
        &self,
        _user_name: &str,
        _password: &str,
        _actual_login: bool,
    ) -> Result<UserLoginResult, BoxError> {
        Err("basic login is not supported by this backend".into())
    }
}

/// Approves or rejects a successful dry-run login before it is committed
///
/// Rejection is signaled by setting an error on the context.
#[async_trait]
pub trait LoginValidator: Send + Sync {
    async fn validate(
        &self,
        ctx: &mut LoginContext,
        candidate: &UserLoginResult,
    ) -> Result<(), BoxError>;
}

/// Registers an unknown user on the fly when nobody is logged in
///
/// `None` means "not my responsibility": the orchestrator falls back to the
/// registration-disabled error.
#[async_trait]
pub trait AutoCreateService: Send + Sync {
    async fn try_create(&self, ctx: &mut LoginContext) -> Result<Option<UserLoginResult>, BoxError>;
}

/// Binds an unknown provider account to the logged-in user
///
/// Same `None` semantics as [`AutoCreateService`].
#[async_trait]
pub trait AutoBindService: Send + Sync {
    async fn try_bind(&self, ctx: &mut LoginContext) -> Result<Option<UserLoginResult>, BoxError>;
}

/// Resolves the target of an impersonation request, or declines
#[async_trait]
pub trait ImpersonationService: Send + Sync {
    async fn impersonate(
        &self,
        actual_user: &UserInfo,
        target: &ImpersonationTarget,
    ) -> Result<Option<UserInfo>, BoxError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpersonationTarget {
    UserId(u64),
    UserName(String),
}

/// Turns packed flow properties into the remote scheme's challenge URL
pub trait RemoteChallenger: Send + Sync {
    fn challenge_url(&self, scheme: &str, properties: &FlowProperties) -> Result<String, BoxError>;
}

/// Authentication properties carried across a redirect-based flow
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowProperties {
    pub current_auth: Option<String>,
    pub initial_scheme: Option<String>,
    pub caller_origin: Option<String>,
    pub return_url: Option<String>,
    pub user_data: Option<String>,
    pub impersonate_actual_user: bool,
}

impl FlowProperties {
    /// Render the properties as `WFA2*` query pairs
    pub fn to_query(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());

        if let Some(value) = &self.current_auth {
            query.append_pair(flow_keys::CURRENT_AUTH, value);
        }
        if let Some(value) = &self.initial_scheme {
            query.append_pair(flow_keys::INITIAL_SCHEME, value);
        }
        if let Some(value) = &self.caller_origin {
            query.append_pair(flow_keys::CALLER_ORIGIN, value);
        }
        if let Some(value) = &self.return_url {
            query.append_pair(flow_keys::RETURN_URL, value);
        }
        if let Some(value) = &self.user_data {
            query.append_pair(flow_keys::USER_DATA, value);
        }
        if self.impersonate_actual_user {
            query.append_pair(flow_keys::IMPERSONATE_ACTUAL_USER, "");
        }

        query.finish()
    }

    /// Rebuild the properties from `WFA2*` query pairs, ignoring foreign keys
    pub fn from_pairs<'p>(pairs: impl Iterator<Item = (&'p str, &'p str)>) -> Self {
        let mut properties = Self::default();

        for (key, value) in pairs {
            match key {
                flow_keys::CURRENT_AUTH => properties.current_auth = Some(value.to_owned()),
                flow_keys::INITIAL_SCHEME => properties.initial_scheme = Some(value.to_owned()),
                flow_keys::CALLER_ORIGIN => properties.caller_origin = Some(value.to_owned()),
                flow_keys::RETURN_URL => properties.return_url = Some(value.to_owned()),
                flow_keys::USER_DATA => properties.user_data = Some(value.to_owned()),
                flow_keys::IMPERSONATE_ACTUAL_USER => properties.impersonate_actual_user = true,
                _ => {}
            }
        }

        properties
    }
}

/// How the login was invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Response goes straight back as JSON
    Direct,
    /// Interactive flow ending in a redirect or a popup message
    StartLogin,
}

/// An error recorded on the login context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextError {
    pub id: String,
    pub text: String,
}

/// Everything a single login operation accumulates
///
/// Built by the entry point, threaded through the orchestrator and the
/// optional collaborators, and finally rendered by the response builder.
#[derive(Debug)]
pub struct LoginContext {
    pub mode: CallMode,
    pub calling_scheme: String,
    pub initial_scheme: Option<String>,
    pub return_url: Option<String>,
    pub caller_origin: Option<String>,
    pub remember_me: bool,
    pub impersonate_actual_user: bool,
    pub user_data: ExtraData,
    /// The backend payload, available to auto-create and auto-bind services
    pub payload: Value,
    /// The authentication resolved at request entry
    pub initial: FrontAuthentication,
    /// The failed backend result, when a failure branch is running
    pub failed: Option<UserLoginResult>,
    error: Option<ContextError>,
}

impl LoginContext {
    pub fn new(mode: CallMode, calling_scheme: impl Into<String>, initial: FrontAuthentication) -> Self {
        Self {
            mode,
            calling_scheme: calling_scheme.into(),
            initial_scheme: None,
            return_url: None,
            caller_origin: None,
            remember_me: false,
            impersonate_actual_user: false,
            user_data: ExtraData::new(),
            payload: Value::Null,
            initial,
            failed: None,
            error: None,
        }
    }

    /// Record an error; the first one wins
    pub fn set_error(&mut self, id: impl Into<String>, text: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(ContextError {
                id: id.into(),
                text: text.into(),
            });
        }
    }

    pub fn error(&self) -> Option<&ContextError> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::{CallMode, FlowProperties, LoginContext, UserLoginResult};
    use crate::info::{FrontAuthentication, UserInfo};

    #[test]
    fn success_is_carrying_a_user() {
        assert!(UserLoginResult::success(UserInfo::new(1, "Alice", vec![])).is_success());
        assert!(!UserLoginResult::failure(1, "nope").is_success());
        assert!(UserLoginResult::unregistered(4, "unknown account").is_unregistered_user);
    }

    #[test]
    fn flow_properties_roundtrip_through_a_query() {
        let properties = FlowProperties {
            current_auth: Some(String::from("envelope")),
            initial_scheme: Some(String::from("Provider")),
            caller_origin: None,
            return_url: Some(String::from("https://good/cb?x=1&y=2")),
            user_data: Some(String::from("extra")),
            impersonate_actual_user: true,
        };

        let query = properties.to_query();
        let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let recovered =
            FlowProperties::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        assert_eq!(recovered, properties);
    }

    #[test]
    fn first_context_error_wins() {
        let mut ctx = LoginContext::new(CallMode::Direct, "Basic", FrontAuthentication::none());
        ctx.set_error("First", "first error");
        ctx.set_error("Second", "second error");

        assert_eq!(ctx.error().unwrap().id, "First");
    }
}
