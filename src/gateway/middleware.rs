//! Authentication and rate limiting middleware
//!
//! Routes are matched by longest path prefix against the configured
//! [`RouteRule`]s. Unmatched paths are protected and counted against the
//! `default` endpoint class.
//!
//! | Outcome | Status | Headers |
//! |---------|--------|---------|
//! | Authentication failed | 401 | `WWW-Authenticate: Bearer` |
//! | Address locked out | 429 | `Retry-After` |
//! | Required role missing | 403 | rate limit headers |
//! | Throttled | 429 | rate limit headers, `Retry-After` |
//! | Admitted | handler | rate limit headers |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::AuthGateway;
use crate::Error;
use crate::audit::{self, AuditEvent};
use crate::config::RouteRule;
use crate::failsafe::{Caller, EndpointClass, RateDecision};
use crate::token::Identity;

/// Route rules ordered for longest-prefix matching
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
    fallback: RouteRule,
}

impl RouteTable {
    /// Build from configured rules
    #[must_use]
    pub fn new(mut rules: Vec<RouteRule>) -> Self {
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            rules,
            fallback: RouteRule {
                prefix: "/".to_string(),
                class: EndpointClass::default().to_string(),
                public: false,
                required_role: None,
            },
        }
    }

    /// Rule with the longest prefix matching `path` on a segment boundary
    #[must_use]
    pub fn resolve(&self, path: &str) -> &RouteRule {
        self.rules
            .iter()
            .find(|rule| prefix_matches(&rule.prefix, path))
            .unwrap_or(&self.fallback)
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    let Some(rest) = path.strip_prefix(prefix) else {
        return false;
    };
    prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/')
}

/// State shared by every request
pub struct MiddlewareState {
    /// Gateway performing authentication and rate checks
    pub gateway: Arc<AuthGateway>,
    /// Route rules
    pub routes: RouteTable,
    /// Take the client address from `X-Forwarded-For`
    pub trust_forwarded_for: bool,
}

/// Authenticate, rate limit and authorize one request
pub async fn auth_middleware(
    State(state): State<Arc<MiddlewareState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let rule = state.routes.resolve(&path).clone();
    let address = client_address(&request, state.trust_forwarded_for);

    // locked addresses never reach token verification
    if let Some(retry_after) = state.gateway.lockout().locked_for(address) {
        debug!(path = %path, %address, "Address locked out");
        return error_response(&Error::LockedOut { retry_after });
    }

    let caller = match bearer_token(request.headers()) {
        Some(token) => match state.gateway.authenticate(token).await {
            Ok(identity) => {
                state.gateway.lockout().clear(address);
                Caller::Authenticated(identity)
            }
            Err(e) => {
                warn!(path = %path, code = e.code(), "Authentication failed");
                audit::emit(&AuditEvent::denied(e.code()));
                return reject(&state, address, &e);
            }
        },
        None if rule.public => Caller::Anonymous(address),
        None => {
            debug!(path = %path, "Missing bearer token");
            return reject(&state, address, &Error::MissingCredentials);
        }
    };

    let decision = state
        .gateway
        .check_rate(&caller, &EndpointClass::new(rule.class.as_str()));
    if let RateDecision::Throttled { retry_after, .. } = &decision {
        warn!(path = %path, key = ?caller.key(), "Rate limit exceeded");
        let mut response = error_response(&Error::RateLimited {
            retry_after: *retry_after,
        });
        apply_rate_headers(response.headers_mut(), &decision);
        return response;
    }

    if let Some(role) = &rule.required_role {
        let Caller::Authenticated(identity) = &caller else {
            return reject(&state, address, &Error::MissingCredentials);
        };
        if !identity.has_role(role) {
            warn!(path = %path, user_id = %identity.user_id, role = %role, "Required role missing");
            let mut response = error_response(&Error::Forbidden(role.clone()));
            apply_rate_headers(response.headers_mut(), &decision);
            return response;
        }
    }

    if let Caller::Authenticated(identity) = caller {
        debug!(path = %path, user_id = %identity.user_id, "Authenticated request");
        request.extensions_mut().insert::<Identity>(identity);
    }

    let mut response = next.run(request).await;
    apply_rate_headers(response.headers_mut(), &decision);
    response
}

/// Count an authentication failure against `address`. Dependency failures are not counted.
fn reject(state: &MiddlewareState, address: IpAddr, error: &Error) -> Response {
    if !error.is_dependency_failure()
        && let Some(retry_after) = state.gateway.lockout().record_failure(address)
    {
        audit::emit(&AuditEvent::denied(Error::LockedOut { retry_after }.code()));
        return error_response(&Error::LockedOut { retry_after });
    }
    error_response(error)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn client_address(request: &Request<Body>, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(address) = forwarded {
            return address;
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |info| info.0.ip())
}

fn apply_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    let (limit, remaining, reset_at) = match decision {
        RateDecision::Allowed {
            limit,
            remaining,
            reset_at,
        } => (*limit, *remaining, *reset_at),
        RateDecision::Throttled {
            limit, reset_at, ..
        } => (*limit, 0, *reset_at),
        RateDecision::Exempt => return,
    };
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(reset_at));
}

/// Render an error with its stable code and fixed message
fn error_response(error: &Error) -> Response {
    let status = error.http_status();
    let body = Json(json!({
        "error": error.code(),
        "message": error.public_message(),
    }));

    match (status, error) {
        (StatusCode::UNAUTHORIZED, _) => {
            (status, [("WWW-Authenticate", "Bearer")], body).into_response()
        }
        (_, Error::RateLimited { retry_after } | Error::LockedOut { retry_after }) => {
            let seconds = retry_after.as_millis().div_ceil(1000).max(1);
            (status, [("Retry-After", seconds.to_string())], body).into_response()
        }
        _ => (status, body).into_response(),
    }
}
