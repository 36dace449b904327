//! HTTP surface.
//!
//! All endpoints speak JSON. Identity rides in the `access_token` cookie,
//! silently reissued with refreshed expiry on every interaction. Every
//! response carries `X-Canvas-Version` so clients notice restarts and
//! protocol bumps without parsing bodies.

use std::net::{IpAddr, SocketAddr};

use axum::Json;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use mosaic_core::identity::{Claims, IdentityError, strip_uuid};
use mosaic_core::identity::TOKEN_VALIDITY_SECS;
use mosaic_core::ratelimit::RouteClass;

use crate::captcha::FraudVerdict;
use crate::error::ApiError;
use crate::place;
use crate::state::SharedState;

/// Cookie carrying the identity token.
pub const IDENTITY_COOKIE: &str = "access_token";

/// Header carrying the client's claimed subject id on placement.
pub const USER_HEADER: &str = "x-user";

/// Header carrying the fraud-check token.
pub const CAPTCHA_HEADER: &str = "x-captcha-token";

/// Builds the service router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/hello", get(hello))
        .route("/register", post(register))
        .route("/state", get(canvas_state))
        .route("/place", put(place_pixel))
        .route("/info", get(info))
        .route("/info/:x/:y", get(pixel_info))
        .route("/pngs/:name", get(chunk_image))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            version_header,
        ))
        .with_state(state)
}

/// Stamps `X-Canvas-Version` on every response.
pub async fn version_header(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&state.version.to_string()) {
        response.headers_mut().insert("x-canvas-version", value);
    }
    response
}

async fn index() -> &'static str {
    "mosaic canvas daemon\n\n\
     GET  /hello        - canvas metadata\n\
     POST /register     - mint an identity\n\
     GET  /state        - current chunk image manifest\n\
     PUT  /place        - place one pixel\n\
     GET  /info         - presence counters\n\
     GET  /info/{x}/{y} - pixel provenance\n"
}

/// Canvas metadata plus the caller's identity, if any.
pub async fn hello(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers, addr, state.config.server.trust_forwarded_for);
    state.limiter.check(RouteClass::State, ip)?;
    let now = Utc::now().timestamp();

    let claims = verify_identity(&state, &headers, ip)?;
    let mut cookie = None;
    let mut user = None;
    if let Some(claims) = claims {
        let known = {
            let history = state.history.clone();
            let stripped = strip_uuid(&claims.sub);
            tokio::task::spawn_blocking(move || history.touch_user(&stripped, now))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?
        };
        match known {
            Ok(true) => user = Some(claims.sub.clone()),
            Ok(false) => warn!(subject = %claims.sub, "identity unknown to history store"),
            Err(e) => warn!(error = %e, "history touch failed"),
        }
        let (_, token) = state.tokens.reissue(&claims, &ip.to_string(), now)?;
        cookie = Some(token);
    }

    let body = Json(json!({
        "w": state.store.width(),
        "h": state.store.height(),
        "c": state.palette.hex_list(),
        "s": state.store.chunk_size(),
        "u": user,
        "v": state.version,
    }));
    Ok(with_identity_cookie(body.into_response(), cookie, &state))
}

/// Mints a new identity, gated by the register window and the fraud check.
pub async fn register(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers, addr, state.config.server.trust_forwarded_for);
    state.limiter.check(RouteClass::Register, ip)?;
    let now = Utc::now().timestamp();

    let existing = verify_identity(&state, &headers, ip)?;
    if existing.as_ref().is_some_and(|c| c.nme.is_some()) {
        return Err(ApiError::BadRequest);
    }

    let captcha_token = header_str(&headers, CAPTCHA_HEADER);
    match state.captcha.verify(captcha_token, &ip.to_string()).await {
        FraudVerdict::Failed => {
            warn!(ip = %ip, "registration fraud check failed");
            return Err(ApiError::Forbidden);
        },
        // Identity minting is the abusable path: an unreachable oracle
        // blocks registration while the write path stays up.
        FraudVerdict::Unavailable => return Err(ApiError::UpstreamUnavailable),
        FraudVerdict::LowScore => warn!(ip = %ip, "low fraud score at registration"),
        FraudVerdict::Passed => {},
    }

    let claims = state
        .tokens
        .register(existing.as_ref().map(|c| c.sub.as_str()), &ip.to_string(), now);
    let (claims, token) = state.tokens.reissue(&claims, &ip.to_string(), now)?;

    {
        let history = state.history.clone();
        let stripped = strip_uuid(&claims.sub);
        let name = claims.nme.clone().unwrap_or_default();
        tokio::task::spawn_blocking(move || history.register_user(&stripped, &name, now))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(|e| {
                warn!(error = %e, "history store rejected registration");
                ApiError::UpstreamUnavailable
            })?;
    }

    info!(subject = %claims.sub, name = ?claims.nme, ip = %ip, "identity registered");
    let body = Json(json!({ "u": claims.sub }));
    Ok(with_identity_cookie(body.into_response(), Some(token), &state))
}

/// The chunk image manifest.
pub async fn canvas_state(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers, addr, state.config.server.trust_forwarded_for);
    state.limiter.check(RouteClass::State, ip)?;
    let now = Utc::now().timestamp();

    let claims = verify_identity(&state, &headers, ip)?.ok_or(ApiError::Forbidden)?;
    state.presence.note_viewing(&strip_uuid(&claims.sub));
    let (_, token) = state.tokens.reissue(&claims, &ip.to_string(), now)?;

    let manifest = state.publisher.manifest();
    let mut response = Json((*manifest).clone()).into_response();
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("max-age=1"));
    Ok(with_identity_cookie(response, Some(token), &state))
}

/// Places one pixel; the whole write pipeline lives in [`place`].
pub async fn place_pixel(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let ip = client_ip(&headers, addr, state.config.server.trust_forwarded_for);
    let outcome = place::run(&state, &headers, ip, &body).await?;

    let body = Json(json!({ "next": outcome.next_allowed_at }));
    Ok(with_identity_cookie(
        body.into_response(),
        Some(outcome.token),
        &state,
    ))
}

/// Presence counters.
pub async fn info(State(state): State<SharedState>) -> Response {
    let (viewing, active) = state.presence.counts();
    let mut response = Json(json!({ "viewing": viewing, "active": active })).into_response();
    response.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=120"),
    );
    response
}

/// Who painted a pixel, from the history collaborator.
pub async fn pixel_info(
    State(state): State<SharedState>,
    Path((x, y)): Path<(u32, u32)>,
) -> Result<Response, ApiError> {
    if x >= state.store.width() || y >= state.store.height() {
        return Err(ApiError::BadRequest);
    }

    let provenance = {
        let history = state.history.clone();
        tokio::task::spawn_blocking(move || history.pixel_provenance(x, y))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(|e| {
                warn!(error = %e, "provenance lookup failed");
                ApiError::UpstreamUnavailable
            })?
    };
    let provenance = provenance.ok_or(ApiError::NotFound)?;

    let mut response = Json(json!({
        "mod": provenance.modified_at,
        "usr": provenance.writer_fragment,
        "nme": provenance.writer_name,
    }))
    .into_response();
    response.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=60"),
    );
    Ok(response)
}

/// Serves a rendered chunk image. Filenames are versioned and immutable.
pub async fn chunk_image(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if !is_chunk_image_name(&name) {
        return Err(ApiError::BadRequest);
    }
    let path = state.config.canvas.images_dir.join(&name);
    let bytes = tokio::fs::read(path).await.map_err(|_| ApiError::NotFound)?;

    let mut response = bytes.into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
    response.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    Ok(response)
}

/// Validates `c_{t}_{cx}-{cy}.png` without touching the filesystem; anything
/// else (path traversal included) is rejected before the read.
fn is_chunk_image_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("c_") else {
        return false;
    };
    let Some(rest) = rest.strip_suffix(".png") else {
        return false;
    };
    let mut parts = rest.split('_');
    let (Some(t), Some(coords), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let mut coords = coords.split('-');
    let (Some(cx), Some(cy), None) = (coords.next(), coords.next(), coords.next()) else {
        return false;
    };
    [t, cx, cy]
        .iter()
        .all(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
}

/// Resolves the client IP, honoring `X-Forwarded-For` only when configured
/// to sit behind a trusted proxy.
pub fn client_ip(headers: &HeaderMap, addr: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return ip;
                }
            }
        }
    }
    addr.ip()
}

/// Extracts and verifies the identity cookie.
///
/// No cookie means no identity (`Ok(None)`); a cookie that fails
/// verification is an error, never a different identity. An IP change is
/// logged as an anomaly but does not invalidate the token.
pub fn verify_identity(
    state: &crate::state::AppState,
    headers: &HeaderMap,
    ip: IpAddr,
) -> Result<Option<Claims>, IdentityError> {
    let Some(raw) = read_cookie(headers, IDENTITY_COOKIE) else {
        return Ok(None);
    };
    let claims = state.tokens.verify(&raw)?;
    if claims.ip != ip.to_string() {
        info!(subject = %claims.sub, from = %claims.ip, to = %ip, "identity changed ip");
    }
    Ok(Some(claims))
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        for pair in value.split(';') {
            let pair = pair.trim();
            if let Some(token) = pair.strip_prefix(name) {
                if let Some(token) = token.strip_prefix('=') {
                    return Some(token.to_string());
                }
            }
        }
    }
    None
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn with_identity_cookie(
    mut response: Response,
    token: Option<String>,
    state: &crate::state::AppState,
) -> Response {
    if let Some(token) = token {
        let domain = state
            .config
            .server
            .cookie_domain
            .as_deref()
            .map(|d| format!("; Domain={d}"))
            .unwrap_or_default();
        let cookie = format!(
            "{IDENTITY_COOKIE}={token}; Path=/; Max-Age={TOKEN_VALIDITY_SECS}; HttpOnly; SameSite=Lax{domain}"
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_image_names_are_strictly_validated() {
        assert!(is_chunk_image_name("c_1651234567_0-1.png"));
        assert!(is_chunk_image_name("c_0_12-34.png"));

        assert!(!is_chunk_image_name("c_.._0-1.png"));
        assert!(!is_chunk_image_name("../etc/passwd"));
        assert!(!is_chunk_image_name("c_123_0-1.png.bak"));
        assert!(!is_chunk_image_name("c_123_0-1-2.png"));
        assert!(!is_chunk_image_name("c_123_01.png"));
        assert!(!is_chunk_image_name("d_123_0-1.png"));
        assert!(!is_chunk_image_name("c__0-1.png"));
    }

    #[test]
    fn cookie_parsing_handles_multiple_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; access_token=abc.def.ghi; lang=en"),
        );
        assert_eq!(
            read_cookie(&headers, IDENTITY_COOKIE).as_deref(),
            Some("abc.def.ghi")
        );
        assert_eq!(read_cookie(&headers, "missing"), None);
    }

    #[test]
    fn forwarded_header_is_ignored_unless_trusted() {
        let addr: SocketAddr = "198.51.100.7:9999".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.50, 10.0.0.1"),
        );

        let trusted = client_ip(&headers, addr, true);
        assert_eq!(trusted.to_string(), "203.0.113.50");

        let untrusted = client_ip(&headers, addr, false);
        assert_eq!(untrusted.to_string(), "198.51.100.7");
    }
}
