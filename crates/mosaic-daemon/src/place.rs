//! The placement pipeline.
//!
//! One write request runs a synchronous pipeline that fails fast at the
//! first violated precondition, in a fixed order: request shape, identity,
//! request volume, claimed-subject match, bounds and color, fraud check,
//! cooldown - then the write itself, snapshot notification, token reissue,
//! history record, response.
//!
//! The fraud check never blocks an otherwise-valid write on an ambiguous
//! signal: a low score (or an unreachable oracle) lengthens the *next*
//! cooldown instead. Only an explicit verification failure rejects.
//!
//! History emission is best-effort: the pixel is already applied and a
//! history outage must not roll it back.

use std::net::IpAddr;

use axum::http::HeaderMap;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mosaic_core::identity::strip_uuid;
use mosaic_core::ratelimit::RouteClass;

use crate::captcha::FraudVerdict;
use crate::error::ApiError;
use crate::history::ChangeRecord;
use crate::routes::{self, CAPTCHA_HEADER, USER_HEADER};
use crate::state::AppState;

/// Result of an accepted placement.
#[derive(Debug)]
pub struct PlaceOutcome {
    /// Epoch seconds of the identity's next allowed write.
    pub next_allowed_at: i64,
    /// Reissued identity token for the response cookie.
    pub token: String,
}

/// Runs the full placement pipeline for one request.
///
/// # Errors
///
/// Returns the first violated precondition, mapped per the error taxonomy.
pub async fn run(
    state: &AppState,
    headers: &HeaderMap,
    ip: IpAddr,
    body: &[u8],
) -> Result<PlaceOutcome, ApiError> {
    let now = Utc::now().timestamp();

    // Request shape: exactly [x, y, color], all integers.
    let (x, y, color) = parse_body(body)?;

    // Identity before anything expensive; an invalid token is "no identity".
    let claims = routes::verify_identity(state, headers, ip)?.ok_or(ApiError::Forbidden)?;

    // IP-level volume cap, independent of identity validity.
    state.limiter.check(RouteClass::Place, ip)?;

    // The explicit identity header must match the verified token. A stale
    // cached header after re-registration would otherwise attribute writes
    // to the wrong subject.
    let claimed = routes::header_str(headers, USER_HEADER).ok_or(ApiError::BadRequest)?;
    if claimed != claims.sub {
        warn!(header = claimed, token = %claims.sub, "subject header/token mismatch");
        return Err(ApiError::Forbidden);
    }

    // Bounds (exclusive) and palette range.
    let (x, y, color) = validate_coordinates(state, x, y, color)?;

    // Fraud check, graceful on ambiguity.
    let verdict = state
        .captcha
        .verify(routes::header_str(headers, CAPTCHA_HEADER), &ip.to_string())
        .await;
    if verdict == FraudVerdict::Failed {
        warn!(ip = %ip, subject = %claims.sub, "placement fraud check failed");
        return Err(ApiError::Forbidden);
    }

    // The cooldown gate trusts only the verified token's own claim.
    state.cooldown.check(claims.lst, now)?;

    // Apply the write. From here on, nothing rolls it back.
    let writer = Uuid::parse_str(&claims.sub).unwrap_or(Uuid::nil());
    let previous = state.store.set(x, y, color, writer, now)?;
    debug!(x, y, color, previous, subject = %claims.sub, "pixel placed");

    // Nudge the flusher; the chunk is already marked dirty, so a full queue
    // just defers the flush to the next rescan.
    let chunk = (x / state.store.chunk_size(), y / state.store.chunk_size());
    if let Err(e) = state.flush_tx.try_send(chunk) {
        debug!(error = %e, "flush queue busy, deferring to rescan");
    }

    // Reissue with the advanced write clock.
    let mut updated = claims.clone();
    updated.lst = now;
    updated.cnt = updated.cnt.saturating_add(1);
    let (_, token) = state.tokens.reissue(&updated, &ip.to_string(), now)?;

    record_history(state, &claims.sub, x, y, color, now);
    state.presence.note_active(&strip_uuid(&claims.sub));

    let factor = if verdict.is_ambiguous() {
        state.config.captcha.low_score_cooldown_factor
    } else {
        1
    };
    if factor > 1 {
        info!(subject = %claims.sub, factor, "cooldown stretched on ambiguous fraud score");
    }

    Ok(PlaceOutcome {
        next_allowed_at: state.cooldown.next_allowed(now, factor),
        token,
    })
}

/// Parses the request body: a JSON array of exactly three integers.
fn parse_body(body: &[u8]) -> Result<(i64, i64, i64), ApiError> {
    let values: Vec<serde_json::Value> =
        serde_json::from_slice(body).map_err(|_| ApiError::BadRequest)?;
    let [x, y, color] = values.as_slice() else {
        return Err(ApiError::BadRequest);
    };
    match (x.as_i64(), y.as_i64(), color.as_i64()) {
        (Some(x), Some(y), Some(color)) => Ok((x, y, color)),
        _ => Err(ApiError::BadRequest),
    }
}

fn validate_coordinates(
    state: &AppState,
    x: i64,
    y: i64,
    color: i64,
) -> Result<(u32, u32, u8), ApiError> {
    let x = u32::try_from(x).map_err(|_| ApiError::BadRequest)?;
    let y = u32::try_from(y).map_err(|_| ApiError::BadRequest)?;
    let color = u8::try_from(color).map_err(|_| ApiError::BadRequest)?;
    if x >= state.store.width() || y >= state.store.height() || !state.palette.contains(color) {
        return Err(ApiError::BadRequest);
    }
    Ok((x, y, color))
}

/// Appends the change record and bumps the identity's last-used time.
/// Best-effort by design: failures are logged, never surfaced.
fn record_history(state: &AppState, subject: &str, x: u32, y: u32, color: u8, now: i64) {
    let record = ChangeRecord {
        x,
        y,
        color: state
            .palette
            .hex(color)
            .unwrap_or("#000000")
            .trim_start_matches('#')
            .to_string(),
        subject: strip_uuid(subject),
        time: now,
    };
    let history = state.history.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = history.record_change(&record) {
            warn!(error = %e, "change record emission failed");
        }
        if let Err(e) = history.touch_user(&record.subject, now) {
            warn!(error = %e, "history touch failed");
        }
    });
}
