//! Authorization pipeline
//!
//! Request-scoped pre-handler in front of every route except the documented
//! bypass paths. Extracts the bearer token, validates it (C4), projects the
//! claims into an [`AuthorizationContext`], enforces scopes, guards against
//! cross-user session reuse, and opportunistically refreshes tokens close to
//! expiry.

use super::context::{token_hash, AuthorizationContext};
use super::token::TokenValidator;
use crate::config::AuthorizationConfig;
use crate::store::SessionStore;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

const SESSION_ID_HEADER: &str = "mcp-session-id";
const BEARER_PREFIX: &str = "Bearer ";

/// Outbound OAuth client seam used for the server's own refresh calls. The
/// concrete client lives outside this crate.
#[async_trait::async_trait]
pub trait OAuthRefreshClient: Send + Sync {
    async fn refresh(
        &self,
        refresh: &crate::auth::context::TokenRefresh,
    ) -> anyhow::Result<RefreshedToken>;
}

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

#[derive(Clone)]
pub struct AuthState {
    pub config: Arc<AuthorizationConfig>,
    pub validator: Arc<TokenValidator>,
    pub store: Arc<dyn SessionStore>,
    pub refresher: Option<Arc<dyn OAuthRefreshClient>>,
}

/// Challenge returned on 401/403. Carries the `WWW-Authenticate` parameters
/// alongside the `{error, error_description}` body.
#[derive(Debug)]
pub struct AuthChallenge {
    status: StatusCode,
    code: &'static str,
    description: String,
    realm: String,
    challenge_error: Option<&'static str>,
    scope: Option<String>,
    resource_metadata: String,
}

impl AuthChallenge {
    fn unauthorized(
        config: &AuthorizationConfig,
        code: &'static str,
        description: impl Into<String>,
    ) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code,
            description: description.into(),
            realm: config.realm.clone(),
            challenge_error: Some("invalid_token"),
            scope: None,
            resource_metadata: config.resource_metadata_url(),
        }
    }

    fn forbidden(config: &AuthorizationConfig, description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "forbidden",
            description: description.into(),
            realm: config.realm.clone(),
            challenge_error: None,
            scope: None,
            resource_metadata: config.resource_metadata_url(),
        }
    }

    fn insufficient_scope(config: &AuthorizationConfig, missing: &[String]) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "insufficient_scope",
            description: "Request requires higher privileges than provided".to_string(),
            realm: config.realm.clone(),
            challenge_error: Some("insufficient_scope"),
            scope: Some(missing.join(" ")),
            resource_metadata: config.resource_metadata_url(),
        }
    }

    fn www_authenticate(&self) -> String {
        let mut value = format!("Bearer realm=\"{}\"", self.realm);
        if let Some(error) = self.challenge_error {
            value.push_str(&format!(", error=\"{error}\""));
        }
        if let Some(scope) = &self.scope {
            value.push_str(&format!(", scope=\"{scope}\""));
        }
        value.push_str(&format!(", resource_metadata=\"{}\"", self.resource_metadata));
        value
    }
}

impl IntoResponse for AuthChallenge {
    fn into_response(self) -> Response {
        let challenge = self.www_authenticate();
        let body = Json(json!({
            "error": self.code,
            "error_description": self.description,
        }));
        let mut response = (self.status, body).into_response();
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

/// Paths never subject to authorization.
pub fn is_bypass_path(path: &str) -> bool {
    path.starts_with("/.well-known/")
        || path.starts_with("/mcp/.well-known")
        || path == "/oauth/authorize"
}

/// The pipeline itself, mounted as axum middleware.
pub async fn authorize(
    State(state): State<AuthState>,
    request: Request,
    next: Next,
) -> Result<Response, AuthChallenge> {
    if !state.config.enabled || is_bypass_path(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let raw_token = extract_bearer(&request, &state.config)?;

    let claims = state.validator.validate(&raw_token).await.map_err(|err| {
        debug!(path = request.uri().path(), reason = %err, "token validation failed");
        AuthChallenge::unauthorized(&state.config, "invalid_token", err.to_string())
    })?;

    let ctx = AuthorizationContext::from_claims(&claims, &raw_token);

    let missing: Vec<String> = state
        .config
        .required_scopes
        .iter()
        .filter(|scope| !ctx.has_scope(scope))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(AuthChallenge::insufficient_scope(
            &state.config,
            &state.config.required_scopes,
        ));
    }

    let session_id = request
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(session_id) = &session_id {
        bind_session(&state, session_id, &ctx).await?;
        maybe_refresh(&state, session_id, &ctx).await;
    }

    let mut request = request;
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

fn extract_bearer(
    request: &Request,
    config: &AuthorizationConfig,
) -> Result<String, AuthChallenge> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AuthChallenge::unauthorized(
                config,
                "authorization_required",
                "Authorization header required",
            )
        })?;

    // A bare "Bearer" (the transport strips trailing whitespace) is still
    // the Bearer scheme, just with nothing after it.
    let token = if header_value == "Bearer" {
        ""
    } else {
        header_value.strip_prefix(BEARER_PREFIX).ok_or_else(|| {
            AuthChallenge::unauthorized(
                config,
                "invalid_token",
                "Authorization header must use Bearer scheme",
            )
        })?
    };

    if token.trim().is_empty() {
        return Err(AuthChallenge::unauthorized(
            config,
            "invalid_token",
            "Bearer token is empty",
        ));
    }
    Ok(token.trim().to_string())
}

/// Cross-user session guard plus token→session binding.
async fn bind_session(
    state: &AuthState,
    session_id: &str,
    ctx: &AuthorizationContext,
) -> Result<(), AuthChallenge> {
    let session = match state.store.get(session_id).await {
        Ok(Some(session)) => session,
        // Unknown sessions are the transport layer's problem, not an
        // authorization failure.
        Ok(None) => return Ok(()),
        Err(err) => {
            warn!(reason = %err, "session lookup failed during authorization");
            return Ok(());
        }
    };

    if let Some(existing) = &session.auth {
        if existing.subject != ctx.subject || existing.token_hash != ctx.token_hash {
            return Err(AuthChallenge::forbidden(
                &state.config,
                "Session is bound to a different principal or token",
            ));
        }
    }

    if state
        .store
        .update_authorization(session_id, ctx.clone(), None)
        .await
        .is_err()
    {
        warn!("failed to persist authorization context on session");
    }
    let _ = state.store.bind_token(&ctx.token_hash, session_id).await;
    Ok(())
}

/// Opportunistic refresh near expiry. Failures are logged, never fatal, and
/// bounded by the attempt counter carried in the refresh block.
async fn maybe_refresh(state: &AuthState, session_id: &str, ctx: &AuthorizationContext) {
    let Some(refresher) = &state.refresher else {
        return;
    };
    let window = state.config.refresh_window.as_secs() as i64;
    let within_window = ctx
        .expires_in(Utc::now())
        .map(|remaining| remaining <= window)
        .unwrap_or(false);
    if !within_window {
        return;
    }

    let Ok(Some(session)) = state.store.get(session_id).await else {
        return;
    };
    let Some(mut refresh) = session.refresh else {
        return;
    };
    if refresh.attempts >= state.config.max_refresh_attempts {
        debug!(session = session_id, "refresh attempt budget exhausted");
        return;
    }

    match refresher.refresh(&refresh).await {
        Ok(refreshed) => {
            refresh.attempts = 0;
            refresh.last_refresh = Some(Utc::now());
            if let Some(rotated) = refreshed.refresh_token {
                refresh.refresh_token = rotated;
            }
            let mut updated = ctx.clone();
            updated.token_hash = token_hash(&refreshed.access_token);
            if let Some(expires_in) = refreshed.expires_in {
                updated.expires_at =
                    Some(Utc::now() + chrono::Duration::seconds(expires_in as i64));
            }
            let _ = state
                .store
                .update_authorization(session_id, updated, Some(refresh))
                .await;
            debug!(session = session_id, "token refreshed");
        }
        Err(err) => {
            refresh.attempts += 1;
            let _ = state
                .store
                .update_authorization(session_id, ctx.clone(), Some(refresh))
                .await;
            warn!(session = session_id, reason = %err, "token refresh failed; continuing with existing context");
        }
    }
}
