use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How strongly the current request is authenticated
///
/// Levels are ordered: `None < Unsafe < Normal < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthLevel {
    /// No identity at all
    None,
    /// A remembered identity without a live expiration
    Unsafe,
    /// A live, verified identity
    Normal,
    /// A live identity within its critical window
    Critical,
}

/// A login scheme the user has authenticated with and when it was last used
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SchemeUsage {
    pub name: String,
    #[serde(rename = "lastUsed")]
    pub last_used: DateTime<Utc>,
}

/// An immutable user identity
///
/// User id `0` is the anonymous user: it has an empty name and no schemes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserInfo {
    #[serde(rename = "userId")]
    user_id: u64,
    #[serde(rename = "userName", default)]
    user_name: String,
    #[serde(default)]
    schemes: Vec<SchemeUsage>,
}

impl UserInfo {
    /// Create a user identity, normalizing id `0` to the anonymous user
    pub fn new(user_id: u64, user_name: impl Into<String>, schemes: Vec<SchemeUsage>) -> Self {
        if user_id == 0 {
            return Self::anonymous();
        }

        Self {
            user_id,
            user_name: user_name.into(),
            schemes,
        }
    }

    /// The anonymous user
    pub fn anonymous() -> Self {
        Self {
            user_id: 0,
            user_name: String::new(),
            schemes: Vec::new(),
        }
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn schemes(&self) -> &[SchemeUsage] {
        &self.schemes
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == 0
    }
}

/// Mint a fresh device id: a v4 UUID, base64url without padding
pub fn mint_device_id() -> String {
    BASE64_URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

/// The authentication state carried by an envelope
///
/// Values are immutable: every operation returns a new instance. `user` and
/// `actual_user` differ only while impersonating.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationInfo {
    actual_user: UserInfo,
    user: UserInfo,
    expires: Option<DateTime<Utc>>,
    critical_expires: Option<DateTime<Utc>>,
    device_id: String,
}

impl AuthenticationInfo {
    /// Create an authentication for `user`, clamping the critical expiration
    /// to never exceed `expires`
    pub fn new(
        user: UserInfo,
        expires: Option<DateTime<Utc>>,
        critical_expires: Option<DateTime<Utc>>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            actual_user: user.clone(),
            user,
            expires,
            critical_expires: clamp(critical_expires, expires),
            device_id: device_id.into(),
        }
    }

    /// The distinguished empty authentication: anonymous, no expirations, no
    /// device id
    pub fn none() -> Self {
        Self::new(UserInfo::anonymous(), None, None, "")
    }

    pub(crate) fn from_parts(
        actual_user: UserInfo,
        user: UserInfo,
        expires: Option<DateTime<Utc>>,
        critical_expires: Option<DateTime<Utc>>,
        device_id: String,
    ) -> Self {
        Self {
            actual_user,
            user,
            expires,
            critical_expires: clamp(critical_expires, expires),
            device_id,
        }
    }

    /// The real operator
    pub fn actual_user(&self) -> &UserInfo {
        &self.actual_user
    }

    /// The effective identity; equals [`Self::actual_user`] unless impersonated
    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    pub fn critical_expires(&self) -> Option<DateTime<Utc>> {
        self.critical_expires
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_impersonated(&self) -> bool {
        self.user != self.actual_user
    }

    /// The authentication level as observed at `now`
    pub fn level_at(&self, now: DateTime<Utc>) -> AuthLevel {
        if self.critical_expires.is_some_and(|t| t > now) {
            AuthLevel::Critical
        } else if self.expires.is_some_and(|t| t > now) {
            AuthLevel::Normal
        } else if self.actual_user.is_anonymous() {
            AuthLevel::None
        } else {
            AuthLevel::Unsafe
        }
    }

    pub fn level(&self) -> AuthLevel {
        self.level_at(Utc::now())
    }

    /// Replace the expiration, keeping the critical expiration clamped below it
    pub fn set_expires(&self, expires: Option<DateTime<Utc>>) -> Self {
        let mut updated = self.clone();
        updated.expires = expires;
        updated.critical_expires = clamp(updated.critical_expires, expires);
        updated
    }

    /// Replace the critical expiration, clamped to the current expiration
    pub fn set_critical_expires(&self, critical_expires: Option<DateTime<Utc>>) -> Self {
        let mut updated = self.clone();
        updated.critical_expires = clamp(critical_expires, updated.expires);
        updated
    }

    /// Become `other` while remaining operated by the same actual user
    pub fn impersonate(&self, other: UserInfo) -> Self {
        let mut updated = self.clone();
        updated.user = other;
        updated
    }

    /// Drop the impersonated identity
    pub fn clear_impersonation(&self) -> Self {
        let mut updated = self.clone();
        updated.user = updated.actual_user.clone();
        updated
    }

    /// Clear expirations that `now` has passed, demoting the level
    pub fn check_expiration(&self, now: DateTime<Utc>) -> Self {
        let mut updated = self.clone();
        if updated.critical_expires.is_some_and(|t| t <= now) {
            updated.critical_expires = None;
        }
        if updated.expires.is_some_and(|t| t <= now) {
            updated.expires = None;
        }
        updated
    }
}

/// Wire shape of [`AuthenticationInfo`]: `actualUser` is omitted when it
/// matches `user`, absent expirations and empty device ids are dropped
#[derive(Debug, Deserialize, Serialize)]
struct WireInfo {
    user: UserInfo,
    #[serde(
        rename = "actualUser",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    actual_user: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cexp: Option<DateTime<Utc>>,
    #[serde(rename = "deviceId", default, skip_serializing_if = "String::is_empty")]
    device_id: String,
}

impl Serialize for AuthenticationInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        WireInfo {
            user: self.user.clone(),
            actual_user: self
                .is_impersonated()
                .then(|| self.actual_user.clone()),
            exp: self.expires,
            cexp: self.critical_expires,
            device_id: self.device_id.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AuthenticationInfo {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = WireInfo::deserialize(deserializer)?;
        let actual_user = wire.actual_user.unwrap_or_else(|| wire.user.clone());

        Ok(Self::from_parts(
            actual_user,
            wire.user,
            wire.exp,
            wire.cexp,
            wire.device_id,
        ))
    }
}

fn clamp(
    critical: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (critical, expires) {
        (Some(c), Some(e)) => Some(c.min(e)),
        (Some(_), None) => None,
        (None, _) => None,
    }
}

/// An authentication plus whether the client asked to be remembered
///
/// `remember_me` decides if the session cookie is persistent and whether the
/// long-term cookie keeps the user identity in addition to the device id.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontAuthentication {
    pub info: AuthenticationInfo,
    pub remember_me: bool,
}

impl FrontAuthentication {
    /// The empty authentication; never remembered
    pub fn none() -> Self {
        Self {
            info: AuthenticationInfo::none(),
            remember_me: false,
        }
    }

    /// An anonymous authentication bound to a device
    pub fn anonymous(device_id: impl Into<String>) -> Self {
        Self {
            info: AuthenticationInfo::new(UserInfo::anonymous(), None, None, device_id),
            remember_me: false,
        }
    }
}
