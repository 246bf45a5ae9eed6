// HTTP middleware

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
};
use roomcast_sfu::PeerId;

use super::AppError;

/// Header carrying the caller's identity, set by the authenticating proxy
pub const USER_ID_HEADER: &str = "x-user-id";

/// Caller identity taken from [`USER_ID_HEADER`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: PeerId,
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::unauthorized("Missing X-User-Id header"))?;

        let user_id = header
            .to_str()
            .map_err(|_| AppError::unauthorized("Invalid X-User-Id header"))?
            .trim();
        if user_id.is_empty() {
            return Err(AppError::unauthorized("Empty X-User-Id header"));
        }

        Ok(Self {
            user_id: PeerId::new(user_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};

    async fn extract(request: Request<()>) -> Result<AuthUser, AppError> {
        let (mut parts, ()) = request.into_parts();
        AuthUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_extracts_user_id() {
        let request = Request::builder()
            .header(USER_ID_HEADER, " alice ")
            .body(())
            .unwrap();
        let user = extract(request).await.unwrap();
        assert_eq!(user.user_id.as_str(), "alice");
    }

    #[tokio::test]
    async fn test_rejects_missing_or_blank_header() {
        let missing = extract(Request::builder().body(()).unwrap()).await.unwrap_err();
        assert_eq!(missing.status, StatusCode::UNAUTHORIZED);

        let blank = Request::builder().header(USER_ID_HEADER, "  ").body(()).unwrap();
        assert_eq!(extract(blank).await.unwrap_err().status, StatusCode::UNAUTHORIZED);
    }
}
