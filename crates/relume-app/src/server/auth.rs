//! Bearer-credential extraction for handlers.

use axum::http::{header, HeaderMap};

use crate::server::problem::{ErrorKind, Problem};
use crate::services::auth::AuthenticatedUser;
use crate::services::context::AppContext;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Resolve the owner identity or produce the 401 problem document.
pub async fn authenticate(
    ctx: &AppContext,
    headers: &HeaderMap,
) -> Result<AuthenticatedUser, Problem> {
    let Some(token) = bearer_token(headers) else {
        return Err(Problem::new(ErrorKind::Unauthorized)
            .with_detail("missing bearer credential")
            .with_instance(request_id(headers)));
    };
    match ctx.verifier.verify(token).await {
        Ok(user) => Ok(user),
        Err(error) => {
            tracing::debug!(%error, "credential verification failed");
            Err(Problem::new(ErrorKind::Unauthorized)
                .with_detail("invalid bearer credential")
                .with_instance(request_id(headers)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_extraction_requires_scheme() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("dev-user-1"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer dev-user-1"),
        );
        assert_eq!(bearer_token(&headers), Some("dev-user-1"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(bearer_token(&headers).is_none());
    }
}
