use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, instrument, warn};

use crate::envelope::{protect_auth, protect_extra, unprotect_auth, unprotect_extra, Protectors};
use crate::info::{mint_device_id, AuthLevel, AuthenticationInfo, FrontAuthentication};
use crate::login::{
    error_ids, AutoBindService, AutoCreateService, BoxError, CallMode, FlowProperties,
    ImpersonationService, ImpersonationTarget, LoginContext, LoginService, LoginValidator,
    RemoteChallenger, UserLoginResult,
};
use crate::options::{FixedOptions, OptionsWatch};

/// The web front authentication service
///
/// Owns the protectors and options and orchestrates every login-producing
/// path. Optional collaborators are capabilities: absence means the matching
/// branch reports a policy error instead of no-oping.
pub struct AuthService {
    protectors: Protectors,
    fixed: FixedOptions,
    dynamic: OptionsWatch,
    login: Arc<dyn LoginService>,
    validator: Option<Arc<dyn LoginValidator>>,
    auto_create: Option<Arc<dyn AutoCreateService>>,
    auto_bind: Option<Arc<dyn AutoBindService>>,
    impersonation: Option<Arc<dyn ImpersonationService>>,
    challenger: Option<Arc<dyn RemoteChallenger>>,
}

/// Assembles an [`AuthService`] with its optional capabilities
pub struct Builder {
    service: AuthService,
}

impl Builder {
    pub fn validator(mut self, validator: Arc<dyn LoginValidator>) -> Self {
        self.service.validator = Some(validator);
        self
    }

    pub fn auto_create(mut self, auto_create: Arc<dyn AutoCreateService>) -> Self {
        self.service.auto_create = Some(auto_create);
        self
    }

    pub fn auto_bind(mut self, auto_bind: Arc<dyn AutoBindService>) -> Self {
        self.service.auto_bind = Some(auto_bind);
        self
    }

    pub fn impersonation(mut self, impersonation: Arc<dyn ImpersonationService>) -> Self {
        self.service.impersonation = Some(impersonation);
        self
    }

    pub fn challenger(mut self, challenger: Arc<dyn RemoteChallenger>) -> Self {
        self.service.challenger = Some(challenger);
        self
    }

    pub fn build(self) -> AuthService {
        self.service
    }
}

impl AuthService {
    pub fn builder(
        secret: &str,
        fixed: FixedOptions,
        dynamic: OptionsWatch,
        login: Arc<dyn LoginService>,
    ) -> Builder {
        Builder {
            service: AuthService {
                protectors: Protectors::new(secret),
                fixed,
                dynamic,
                login,
                validator: None,
                auto_create: None,
                auto_bind: None,
                impersonation: None,
                challenger: None,
            },
        }
    }

    pub(crate) fn protectors(&self) -> &Protectors {
        &self.protectors
    }

    pub(crate) fn fixed(&self) -> &FixedOptions {
        &self.fixed
    }

    pub(crate) fn dynamic(&self) -> &OptionsWatch {
        &self.dynamic
    }

    pub fn has_impersonation(&self) -> bool {
        self.impersonation.is_some()
    }

    /// The bearer-usable envelope, absent for the empty authentication
    pub fn create_token(&self, auth: &FrontAuthentication) -> Option<String> {
        (auth.info.level() > AuthLevel::None).then(|| protect_auth(&self.protectors.token, auth))
    }

    /// Whether a refresh can extend the expiration
    pub fn refreshable(&self, auth: &FrontAuthentication) -> bool {
        auth.info.level() >= AuthLevel::Normal
            && self.dynamic.current().sliding_expiration_time > Duration::zero()
    }

    /// Run the full login state machine around `login_fn`
    ///
    /// `login_fn` receives the `actual_login` flag: when a validator is
    /// configured the first call is a dry run and the commit call follows the
    /// validator's approval. Returns the committed authentication, or `None`
    /// when the context carries the error to report.
    #[instrument(name = "AuthService::unified_login", skip_all, fields(scheme = %ctx.calling_scheme))]
    pub async fn unified_login<F>(
        &self,
        ctx: &mut LoginContext,
        mut login_fn: F,
    ) -> Option<FrontAuthentication>
    where
        F: FnMut(bool) -> BoxFuture<'static, Result<UserLoginResult, BoxError>> + Send,
    {
        if !self.validate_core_parameters(ctx) {
            return None;
        }

        let now = Utc::now();
        let has_validator = self.validator.is_some();

        let mut result = self.safe_call(ctx, login_fn(!has_validator)).await?;

        if result.is_success() {
            if let Some(validator) = self.validator.clone() {
                if let Err(error) = validator.validate(ctx, &result).await {
                    error!(%error, "login validator failed");
                    ctx.set_error(error_ids::INTERNAL_ERROR, error.to_string());
                    return None;
                }
                if ctx.has_error() {
                    return None;
                }

                result = self.safe_call(ctx, login_fn(true)).await?;
            }
        }

        if result.is_success() {
            return Some(self.commit(ctx, result, now));
        }

        if ctx.impersonate_actual_user {
            // re-logging the actual user must not destroy the impersonation
            ctx.failed = Some(result);
            return None;
        }

        if result.is_unregistered_user {
            return self.handle_unregistered(ctx, result, now).await;
        }

        Some(self.fail_to_anonymous(ctx, result))
    }

    /// Login with a user name and password through the backend
    pub async fn basic_login(
        &self,
        ctx: &mut LoginContext,
        user_name: String,
        password: String,
    ) -> Option<FrontAuthentication> {
        let backend = self.login.clone();

        self.unified_login(ctx, move |actual_login| {
            let backend = backend.clone();
            let user_name = user_name.clone();
            let password = password.clone();

            Box::pin(async move { backend.basic_login(&user_name, &password, actual_login).await })
        })
        .await
    }

    /// Login with a scheme-specific payload through the backend
    ///
    /// The payload must also be on the context for the auto services.
    pub async fn scheme_login(
        &self,
        ctx: &mut LoginContext,
        payload: Value,
    ) -> Option<FrontAuthentication> {
        let backend = self.login.clone();
        let scheme = ctx.calling_scheme.clone();

        self.unified_login(ctx, move |actual_login| {
            let backend = backend.clone();
            let scheme = scheme.clone();
            let payload = payload.clone();

            Box::pin(async move { backend.login(&scheme, payload, actual_login).await })
        })
        .await
    }

    /// Validate and pack an interactive flow, returning the challenge URL
    #[instrument(name = "AuthService::start_login", skip_all, fields(scheme = %ctx.calling_scheme))]
    pub fn start_login(&self, ctx: &mut LoginContext) -> Option<String> {
        if !self.validate_core_parameters(ctx) {
            return None;
        }

        let Some(challenger) = &self.challenger else {
            ctx.set_error(
                error_ids::INTERNAL_ERROR,
                format!(
                    "no remote challenger is configured for scheme '{}'",
                    ctx.calling_scheme
                ),
            );
            return None;
        };

        let properties = self.pack_flow_properties(ctx);
        match challenger.challenge_url(&ctx.calling_scheme, &properties) {
            Ok(url) => Some(url),
            Err(error) => {
                error!(%error, "remote challenger failed");
                ctx.set_error(error_ids::INTERNAL_ERROR, error.to_string());
                None
            }
        }
    }

    /// Entry point for the remote scheme callback glue: rebuild the flow
    /// context and run the unified login with the provider's payload
    pub async fn remote_login(
        &self,
        scheme: &str,
        properties: &FlowProperties,
        payload: Value,
    ) -> (LoginContext, Option<FrontAuthentication>) {
        let initial = properties
            .current_auth
            .as_deref()
            .and_then(|value| match unprotect_auth(&self.protectors.token, value) {
                Ok(auth) => Some(auth),
                Err(error) => {
                    warn!(%error, "discarding unreadable flow envelope");
                    None
                }
            })
            .unwrap_or_else(FrontAuthentication::none);

        let mut ctx = LoginContext::new(CallMode::StartLogin, scheme, initial);
        ctx.remember_me = ctx.initial.remember_me;
        ctx.initial_scheme = properties.initial_scheme.clone();
        ctx.return_url = properties.return_url.clone();
        ctx.caller_origin = properties.caller_origin.clone();
        ctx.impersonate_actual_user = properties.impersonate_actual_user;
        ctx.payload = payload.clone();
        if let Some(value) = &properties.user_data {
            match unprotect_extra(&self.protectors.extra, value) {
                Ok(data) => ctx.user_data = data,
                Err(error) => warn!(%error, "discarding unreadable flow user data"),
            }
        }

        let auth = self.scheme_login(&mut ctx, payload).await;
        (ctx, auth)
    }

    /// Impersonate `target`, or clear the impersonation when the target is
    /// the actual user
    ///
    /// Returns `None` when the capability is missing, the caller is not
    /// authenticated, or the impersonation service declines.
    pub async fn impersonate(
        &self,
        current: &FrontAuthentication,
        target: ImpersonationTarget,
        now: DateTime<Utc>,
    ) -> Result<Option<FrontAuthentication>, BoxError> {
        let Some(service) = &self.impersonation else {
            return Ok(None);
        };

        let info = current.info.check_expiration(now);
        if info.level_at(now) < AuthLevel::Normal {
            return Ok(None);
        }

        let target_is_actual = match &target {
            ImpersonationTarget::UserId(id) => *id == info.actual_user().user_id(),
            ImpersonationTarget::UserName(name) => name == info.actual_user().user_name(),
        };

        let updated = if target_is_actual {
            info.clear_impersonation()
        } else {
            match service.impersonate(info.actual_user(), &target).await? {
                Some(user) => info.impersonate(user),
                None => return Ok(None),
            }
        };

        Ok(Some(FrontAuthentication {
            info: updated,
            remember_me: current.remember_me,
        }))
    }

    fn validate_core_parameters(&self, ctx: &mut LoginContext) -> bool {
        if ctx.mode == CallMode::StartLogin
            && ctx.return_url.is_some() == ctx.caller_origin.is_some()
        {
            warn!("a login requires exactly one of returnUrl and callerOrigin");
            ctx.set_error(error_ids::RETURN_X_OR_CALLER, error_ids::RETURN_X_OR_CALLER);
            return false;
        }

        if ctx.initial.info.is_impersonated() && !ctx.impersonate_actual_user {
            warn!(
                user = ctx.initial.info.user().user_id(),
                "rejected a new login while impersonating"
            );
            ctx.set_error(
                error_ids::LOGIN_WHILE_IMPERSONATION,
                error_ids::LOGIN_WHILE_IMPERSONATION,
            );
            return false;
        }

        if let Some(url) = &ctx.return_url {
            let allowed = self
                .fixed
                .allowed_return_urls
                .iter()
                .any(|prefix| url.starts_with(prefix.as_str()));
            if !allowed {
                warn!(%url, "rejected a return url outside the allowed prefixes");
                ctx.set_error(
                    error_ids::DISALLOWED_RETURN_URL,
                    error_ids::DISALLOWED_RETURN_URL,
                );
                return false;
            }
        }

        true
    }

    async fn safe_call(
        &self,
        ctx: &mut LoginContext,
        call: BoxFuture<'_, Result<UserLoginResult, BoxError>>,
    ) -> Option<UserLoginResult> {
        match call.await {
            Ok(result) => Some(result),
            Err(error) => {
                error!(%error, scheme = %ctx.calling_scheme, "login backend failed");
                ctx.set_error(error_ids::INTERNAL_ERROR, error.to_string());
                None
            }
        }
    }

    async fn handle_unregistered(
        &self,
        ctx: &mut LoginContext,
        result: UserLoginResult,
        now: DateTime<Utc>,
    ) -> Option<FrontAuthentication> {
        let logged_in = !ctx.initial.info.user().is_anonymous();
        ctx.failed = Some(result);

        if logged_in {
            match self.auto_bind.clone() {
                Some(binder) => match binder.try_bind(ctx).await {
                    Ok(Some(bound)) if bound.is_success() => {
                        ctx.failed = None;
                        return Some(self.commit(ctx, bound, now));
                    }
                    Ok(Some(bound)) => return Some(self.fail_to_anonymous(ctx, bound)),
                    Ok(None) => ctx.set_error(
                        error_ids::AUTO_BINDING_DISABLED,
                        "automatic account binding is disabled",
                    ),
                    Err(error) => {
                        error!(%error, "auto-binding service failed");
                        ctx.set_error(error_ids::INTERNAL_ERROR, error.to_string());
                    }
                },
                None => ctx.set_error(
                    error_ids::AUTO_BINDING_DISABLED,
                    "automatic account binding is disabled",
                ),
            }
        } else {
            match self.auto_create.clone() {
                Some(creator) => match creator.try_create(ctx).await {
                    Ok(Some(created)) if created.is_success() => {
                        ctx.failed = None;
                        return Some(self.commit(ctx, created, now));
                    }
                    Ok(Some(created)) => return Some(self.fail_to_anonymous(ctx, created)),
                    Ok(None) => ctx.set_error(
                        error_ids::AUTO_REGISTRATION_DISABLED,
                        "automatic user registration is disabled",
                    ),
                    Err(error) => {
                        error!(%error, "auto-creation service failed");
                        ctx.set_error(error_ids::INTERNAL_ERROR, error.to_string());
                    }
                },
                None => ctx.set_error(
                    error_ids::AUTO_REGISTRATION_DISABLED,
                    "automatic user registration is disabled",
                ),
            }
        }

        None
    }

    /// A failed login discards residual authentication but keeps the device
    fn fail_to_anonymous(
        &self,
        ctx: &mut LoginContext,
        result: UserLoginResult,
    ) -> FrontAuthentication {
        ctx.failed = Some(result);
        FrontAuthentication::anonymous(ctx.initial.info.device_id())
    }

    fn commit(
        &self,
        ctx: &LoginContext,
        result: UserLoginResult,
        now: DateTime<Utc>,
    ) -> FrontAuthentication {
        let dynamic = self.dynamic.current();
        let user = result.user_info.expect("committed logins carry a user");

        let mut expires = now + dynamic.expire_time_span;
        let mut critical_expires = None;
        if let Some(span) = dynamic.schemes_critical_time_span.get(&ctx.calling_scheme) {
            if *span > Duration::zero() {
                let critical = now + *span;
                if expires < critical {
                    expires = critical;
                }
                critical_expires = Some(critical);
            }
        }

        let initial = &ctx.initial.info;
        let info = if !initial.actual_user().is_anonymous()
            && user.user_id() != initial.actual_user().user_id()
        {
            // logging in as somebody else while authenticated keeps the
            // operator's identity and impersonates the new user
            // TODO: apply the scheme critical time span in this branch too;
            // only `expires` is refreshed today
            initial.impersonate(user).set_expires(Some(expires))
        } else {
            let device_id = if initial.device_id().is_empty() {
                mint_device_id()
            } else {
                initial.device_id().to_owned()
            };

            AuthenticationInfo::new(user, Some(expires), critical_expires, device_id)
        };

        FrontAuthentication {
            info,
            remember_me: ctx.remember_me,
        }
    }

    fn pack_flow_properties(&self, ctx: &LoginContext) -> FlowProperties {
        let current = (ctx.initial.info.level() > AuthLevel::None).then(|| {
            let auth = FrontAuthentication {
                info: ctx.initial.info.clone(),
                remember_me: ctx.remember_me,
            };
            protect_auth(&self.protectors.token, &auth)
        });

        FlowProperties {
            current_auth: current,
            initial_scheme: Some(ctx.calling_scheme.clone()),
            caller_origin: ctx.caller_origin.clone(),
            return_url: ctx.return_url.clone(),
            user_data: (!ctx.user_data.is_empty())
                .then(|| protect_extra(&self.protectors.extra, &ctx.user_data)),
            impersonate_actual_user: ctx.impersonate_actual_user,
        }
    }
}
