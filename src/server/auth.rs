//! Handshake auth for every endpoint except the reachability probe and
//! `/version`. The token rides the `token` query parameter (the form CDP
//! clients can express), a bearer header, or `x-cdp-relay-token`.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use url::form_urlencoded;

#[derive(Clone, Debug)]
pub struct AuthPolicy {
    token: String,
}

impl AuthPolicy {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn allows(&self, provided: Option<&str>) -> bool {
        provided == Some(self.token.as_str())
    }
}

pub async fn relay_auth_middleware(
    State(policy): State<Arc<AuthPolicy>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = extract_token(&req);
    if policy.allows(provided.as_deref()) {
        Ok(next.run(req).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

fn extract_token(req: &Request<Body>) -> Option<String> {
    let headers = req.headers();
    if let Some(value) = headers.get("x-cdp-relay-token") {
        if let Ok(raw) = value.to_str() {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(raw) = value.to_str() {
            if let Some(token) = raw.strip_prefix("Bearer ") {
                let trimmed = token.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }

    if let Some(query) = req.uri().query() {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if key == "token" {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_match_is_exact() {
        let policy = AuthPolicy::new("secret");
        assert!(policy.allows(Some("secret")));
        assert!(!policy.allows(Some("Secret")));
        assert!(!policy.allows(None));
    }

    #[test]
    fn query_token_is_extracted() {
        let req = Request::builder()
            .uri("/cdp/test?token=secret&extensionId=abc")
            .body(Body::empty())
            .expect("request");
        assert_eq!(extract_token(&req).as_deref(), Some("secret"));
    }

    #[test]
    fn bearer_token_is_extracted() {
        let req = Request::builder()
            .uri("/status")
            .header("authorization", "Bearer secret")
            .body(Body::empty())
            .expect("request");
        assert_eq!(extract_token(&req).as_deref(), Some("secret"));
    }
}
