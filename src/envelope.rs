//! Protection and binary encoding of authentication envelopes.
//!
//! A protector is an AES-256-GCM cipher keyed for a single purpose. Each
//! protected value is `nonce || ciphertext`, base64url-encoded without
//! padding so it can travel in a cookie, a header, or a query string.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};

use crate::info::{AuthenticationInfo, FrontAuthentication, SchemeUsage, UserInfo};

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

const NONCE_LEN: usize = 12;

/// Version suffix of every protector purpose; bump on any layout change
const PURPOSE_VERSION: &str = "v1";

/// An ordered bag of extra data carried across redirect-based flows
pub type ExtraData = Vec<(String, Option<String>)>;

/// Purpose-scoped authenticated encryption
pub struct Protector {
    cipher: Aes256Gcm,
}

impl Protector {
    /// Derive a purpose-scoped protector from the root secret
    fn derive(secret: &[u8], purpose: &str) -> Self {
        let key = {
            let mut hasher = Sha256::new();
            hasher.update(secret);
            hasher.update([0]);
            hasher.update(purpose.as_bytes());
            hasher.update(PURPOSE_VERSION.as_bytes());
            hasher.finalize()
        };
        let cipher = Aes256Gcm::new_from_slice(&key).expect("SHA-256 digest is a valid key");

        Self { cipher }
    }

    /// Encrypt and authenticate `plain` into a URL-safe string
    pub fn protect(&self, plain: &[u8]) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .expect("AES-GCM encryption is infallible for in-memory payloads");

        let mut data = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&ciphertext);
        BASE64_URL_SAFE_NO_PAD.encode(data)
    }

    /// Decrypt a previously protected value, failing on any tampering
    pub fn unprotect(&self, value: &str) -> Result<Vec<u8>> {
        let data = BASE64_URL_SAFE_NO_PAD.decode(value)?;
        if data.len() < NONCE_LEN {
            return Err(Error::TooShort);
        }

        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Integrity)
    }
}

/// The three protectors used by the front authentication
pub struct Protectors {
    /// Protects the session cookie envelope
    pub cookie: Protector,
    /// Protects the bearer token envelope
    pub token: Protector,
    /// Protects the extra-data bag carried across redirects
    pub extra: Protector,
}

impl Protectors {
    pub fn new(secret: &str) -> Self {
        Self {
            cookie: Protector::derive(secret.as_bytes(), "Cookie"),
            token: Protector::derive(secret.as_bytes(), "Token"),
            extra: Protector::derive(secret.as_bytes(), "Extra"),
        }
    }
}

/// Protect a full authentication envelope
pub(crate) fn protect_auth(protector: &Protector, auth: &FrontAuthentication) -> String {
    protector.protect(&encode(auth))
}

/// Recover an authentication envelope, failing as a unit on any corruption
pub(crate) fn unprotect_auth(protector: &Protector, value: &str) -> Result<FrontAuthentication> {
    decode(&protector.unprotect(value)?)
}

/// Protect the extra-data bag
pub(crate) fn protect_extra(protector: &Protector, data: &ExtraData) -> String {
    let json = serde_json::to_vec(data).expect("extra data must serialize");
    protector.protect(&json)
}

pub(crate) fn unprotect_extra(protector: &Protector, value: &str) -> Result<ExtraData> {
    Ok(serde_json::from_slice(&protector.unprotect(value)?)?)
}

/// Binary layout, little-endian: actual user, user, expiration flag+millis,
/// critical expiration flag+millis, device id, remember-me byte. Strings are
/// `u16` length-prefixed UTF-8.
fn encode(auth: &FrontAuthentication) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(128);
    put_user(&mut buffer, auth.info.actual_user());
    put_user(&mut buffer, auth.info.user());
    put_instant(&mut buffer, auth.info.expires());
    put_instant(&mut buffer, auth.info.critical_expires());
    put_str(&mut buffer, auth.info.device_id());
    buffer.push(auth.remember_me as u8);
    buffer
}

fn decode(bytes: &[u8]) -> Result<FrontAuthentication> {
    let mut reader = Reader { bytes, at: 0 };

    let actual_user = reader.user()?;
    let user = reader.user()?;
    let expires = reader.instant()?;
    let critical_expires = reader.instant()?;
    let device_id = reader.str()?;
    let remember_me = reader.u8()? != 0;

    if reader.at != bytes.len() {
        return Err(Error::Malformed("trailing bytes"));
    }

    Ok(FrontAuthentication {
        info: AuthenticationInfo::from_parts(actual_user, user, expires, critical_expires, device_id),
        remember_me,
    })
}

fn put_user(buffer: &mut Vec<u8>, user: &UserInfo) {
    buffer.extend_from_slice(&user.user_id().to_le_bytes());
    put_str(buffer, user.user_name());
    buffer.extend_from_slice(&(user.schemes().len() as u16).to_le_bytes());
    for scheme in user.schemes() {
        put_str(buffer, &scheme.name);
        buffer.extend_from_slice(&scheme.last_used.timestamp_millis().to_le_bytes());
    }
}

fn put_str(buffer: &mut Vec<u8>, value: &str) {
    buffer.extend_from_slice(&(value.len() as u16).to_le_bytes());
    buffer.extend_from_slice(value.as_bytes());
}

fn put_instant(buffer: &mut Vec<u8>, instant: Option<DateTime<Utc>>) {
    match instant {
        Some(instant) => {
            buffer.push(1);
            buffer.extend_from_slice(&instant.timestamp_millis().to_le_bytes());
        }
        None => buffer.push(0),
    }
}

struct Reader<'b> {
    bytes: &'b [u8],
    at: usize,
}

impl<'b> Reader<'b> {
    fn take(&mut self, len: usize) -> Result<&'b [u8]> {
        if self.bytes.len() - self.at < len {
            return Err(Error::TooShort);
        }

        let slice = &self.bytes[self.at..self.at + len];
        self.at += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("slice length is checked");
        Ok(u64::from_le_bytes(bytes))
    }

    fn i64(&mut self) -> Result<i64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("slice length is checked");
        Ok(i64::from_le_bytes(bytes))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Malformed("invalid UTF-8"))
    }

    fn millis(&mut self) -> Result<DateTime<Utc>> {
        let millis = self.i64()?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or(Error::Malformed("timestamp out of range"))
    }

    fn instant(&mut self) -> Result<Option<DateTime<Utc>>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.millis()?)),
            _ => Err(Error::Malformed("invalid presence flag")),
        }
    }

    fn user(&mut self) -> Result<UserInfo> {
        let user_id = self.u64()?;
        let user_name = self.str()?;
        let count = self.u16()? as usize;

        let mut schemes = Vec::with_capacity(count);
        for _ in 0..count {
            let name = self.str()?;
            let last_used = self.millis()?;
            schemes.push(SchemeUsage { name, last_used });
        }

        Ok(UserInfo::new(user_id, user_name, schemes))
    }
}

/// Errors that can occur when recovering a protected envelope
#[derive(Debug)]
pub enum Error {
    /// The value is not valid base64url
    Decode(base64::DecodeError),
    /// The payload is shorter than its fixed framing
    TooShort,
    /// Authentication of the ciphertext failed
    Integrity,
    /// The decrypted payload does not follow the binary layout
    Malformed(&'static str),
    /// The decrypted payload is not the expected JSON
    Json(serde_json::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(_) => write!(f, "value is not valid base64url"),
            Self::TooShort => write!(f, "payload is truncated"),
            Self::Integrity => write!(f, "payload failed authentication"),
            Self::Malformed(detail) => write!(f, "malformed payload: {detail}"),
            Self::Json(_) => write!(f, "payload is not the expected JSON"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<base64::DecodeError> for Error {
    fn from(error: base64::DecodeError) -> Self {
        Self::Decode(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error)
    }
}
