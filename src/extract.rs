//! Extractors over the request's authentication slot.
//!
//! Both panic when the [`AuthLayer`](crate::middleware::AuthLayer) is not
//! installed: that is a wiring mistake, not a runtime condition.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts, Extension};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

use crate::middleware::{Handle, RequestAuth};

/// Read-only access to the request's authentication
#[derive(Debug)]
pub struct Auth(OwnedRwLockReadGuard<RequestAuth>);

#[async_trait]
impl<S> FromRequestParts<S> for Auth
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(handle) = Extension::<Handle>::from_request_parts(parts, state)
            .await
            .expect("authentication extension missing, is the AuthLayer installed?");
        let slot = handle.read_owned().await;

        Ok(Self(slot))
    }
}

impl std::ops::Deref for Auth {
    type Target = RequestAuth;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Writable access to the request's authentication
///
/// Holding this guard blocks every other extractor on the same request, so
/// handlers keep it only for the duration of the write path.
#[derive(Debug)]
pub struct AuthMut(OwnedRwLockWriteGuard<RequestAuth>);

#[async_trait]
impl<S> FromRequestParts<S> for AuthMut
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(handle) = Extension::<Handle>::from_request_parts(parts, state)
            .await
            .expect("authentication extension missing, is the AuthLayer installed?");
        let slot = handle.write_owned().await;

        Ok(Self(slot))
    }
}

impl std::ops::Deref for AuthMut {
    type Target = RequestAuth;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for AuthMut {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
