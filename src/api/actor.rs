use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::api::response::ApiError;
use crate::service::Actor;

/// Set by the host's auth layer in front of this service.
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ADMIN_HEADER: &str = "x-actor-admin";

fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let id = headers
        .get(ACTOR_ID_HEADER)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|id| !id.is_empty())?;
    let is_admin = headers
        .get(ACTOR_ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1"));

    Some(Actor {
        id: id.to_string(),
        is_admin,
    })
}

/// The authenticated caller. Rejects anonymous requests.
pub struct CurrentActor(pub Actor);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentActor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, ApiError> {
        actor_from_headers(&parts.headers)
            .map(CurrentActor)
            .ok_or_else(|| ApiError::unauthorized(format!("Missing {ACTOR_ID_HEADER} header")))
    }
}

/// The caller when known; anonymous requests pass through as `None`.
pub struct MaybeActor(pub Option<Actor>);

#[axum::async_trait]
impl<S> FromRequestParts<S> for MaybeActor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, ApiError> {
        Ok(MaybeActor(actor_from_headers(&parts.headers)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_actor_headers() {
        let mut headers = HeaderMap::new();
        assert!(actor_from_headers(&headers).is_none());

        headers.insert(ACTOR_ID_HEADER, HeaderValue::from_static("user-1"));
        let actor = actor_from_headers(&headers).unwrap();
        assert_eq!(actor.id, "user-1");
        assert!(!actor.is_admin);

        headers.insert(ACTOR_ADMIN_HEADER, HeaderValue::from_static("true"));
        assert!(actor_from_headers(&headers).unwrap().is_admin);

        headers.insert(ACTOR_ID_HEADER, HeaderValue::from_static("  "));
        assert!(actor_from_headers(&headers).is_none());
    }
}
