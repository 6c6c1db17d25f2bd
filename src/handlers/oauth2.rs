//! OAuth2 redirect and callback endpoints
//!
//! The redirect endpoint is where a public connect link lands. It swaps the
//! redirect token for a short-lived callback cookie and sends the browser to
//! the provider. The callback endpoint reads that cookie back to learn which
//! actor started the flow.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::error::{ApiError, Error};
use crate::oauth2::{CALLBACK_PATH, CallbackParams};
use crate::server::AppState;

/// Cookie carrying the callback token between the two legs of the flow.
pub const CALLBACK_COOKIE: &str = "authproxy_oauth2_callback";

/// Query parameters of the redirect endpoint
#[derive(Debug, Deserialize, IntoParams)]
pub struct RedirectQuery {
    /// Signed redirect token from the public connect link
    pub token: String,
}

/// Body returned by the callback when the flow has no return-to URL
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CallbackResponse {
    pub connection_id: Uuid,
    pub cancel_session_after_auth: bool,
}

/// Verifies the redirect token and sends the browser to the provider
#[utoipa::path(
    get,
    path = "/oauth2/redirect",
    params(RedirectQuery),
    responses(
        (status = 302, description = "Redirect to the provider authorization endpoint"),
        (status = 400, description = "Invalid, expired or replayed redirect token", body = ApiError),
        (status = 404, description = "OAuth2 state no longer exists", body = ApiError)
    ),
    tag = "oauth2"
)]
pub async fn redirect(
    State(state): State<AppState>,
    Query(query): Query<RedirectQuery>,
) -> Result<Response, ApiError> {
    let outcome = state.flows.handle_redirect(&query.token).await?;

    let cookie = callback_cookie(
        &outcome.callback_token,
        outcome.callback_token_ttl,
        state.secure_cookies,
    );
    found(outcome.authorization_url.as_str(), &cookie)
}

/// Completes the authorization: validates the state, exchanges the code and
/// marks the connection ready
#[utoipa::path(
    get,
    path = "/oauth2/callback",
    params(
        ("state" = Option<String>, Query, description = "OAuth2 state id"),
        ("code" = Option<String>, Query, description = "Authorization code"),
        ("error" = Option<String>, Query, description = "Provider error code"),
        ("error_description" = Option<String>, Query, description = "Provider error description")
    ),
    responses(
        (status = 302, description = "Redirect to the return-to URL"),
        (status = 200, description = "Authorization completed", body = CallbackResponse),
        (status = 400, description = "Authorization failed", body = ApiError)
    ),
    tag = "oauth2"
)]
pub async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Result<Response, ApiError> {
    let token = read_cookie(&headers, CALLBACK_COOKIE)
        .ok_or_else(|| Error::AuthorizationFailed("missing callback cookie".into()))?;
    let claims = state.flows.verify_callback_token(&token).await?;

    let state_matches = params
        .state
        .as_deref()
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .is_some_and(|id| id == claims.sid);
    if !state_matches {
        return Err(Error::AuthorizationFailed(
            "callback cookie was issued for a different state".into(),
        )
        .into());
    }

    let outcome = state
        .flows
        .callback_from_3rd_party(claims.sub, &params)
        .await?;

    let clear = clear_callback_cookie(state.secure_cookies);
    match outcome.return_to_url {
        Some(return_to) => found(return_to.as_str(), &clear),
        None => {
            let mut response = Json(CallbackResponse {
                connection_id: outcome.connection_id,
                cancel_session_after_auth: outcome.cancel_session_after_auth,
            })
            .into_response();
            set_cookie(&mut response, &clear)?;
            Ok(response)
        }
    }
}

fn found(location: &str, cookie: &str) -> Result<Response, ApiError> {
    let location = HeaderValue::from_str(location).map_err(|_| {
        Error::Validation(format!("redirect location is not a valid header: {}", location))
    })?;

    let mut response = StatusCode::FOUND.into_response();
    response.headers_mut().insert(header::LOCATION, location);
    set_cookie(&mut response, cookie)?;
    Ok(response)
}

fn set_cookie(response: &mut Response, cookie: &str) -> Result<(), ApiError> {
    let value = HeaderValue::from_str(cookie)
        .map_err(|_| Error::Violation("callback cookie is not a valid header".into()))?;
    response.headers_mut().append(header::SET_COOKIE, value);
    Ok(())
}

fn callback_cookie(token: &str, ttl: Duration, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path={}; Max-Age={}; HttpOnly; SameSite=Lax",
        CALLBACK_COOKIE,
        token,
        CALLBACK_PATH,
        ttl.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn clear_callback_cookie(secure: bool) -> String {
    callback_cookie("", Duration::ZERO, secure)
}

/// Returns the first value of cookie `name` across all `Cookie` headers.
fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// True when the proxy is served over https, so cookies must be `Secure`.
pub fn requires_secure_cookies(public_base_url: &Url) -> bool {
    public_base_url.scheme() == "https"
}
