//! Request throttling.
//!
//! Two independent gates guard the write path, and both must pass:
//!
//! 1. [`CooldownGate`] - the per-identity cooldown, the core game-balance
//!    mechanic. It is evaluated against the `lst` claim of the *verified*
//!    identity token, never against anything the client supplies directly.
//! 2. [`VolumeLimiter`] - a sliding-window request counter keyed by
//!    `(IP, route class)`, blunting IP-level abuse independent of identity
//!    validity. Route classes carry distinct limits: reading state is cheap,
//!    placing pixels is precious, and registration is where identities are
//!    minted, so it gets the tightest window.
//!
//! # Memory Management
//!
//! Window state is created lazily per key and would otherwise grow without
//! bound under IP spoofing. Two defenses:
//!
//! 1. Probabilistic cleanup every `cleanup_interval` checks removes keys
//!    with no recent requests.
//! 2. A hard cap on tracked keys: at the cap, a cleanup is forced and if the
//!    map is still full a new key is rejected outright.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejections produced by the two gates.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// The identity's cooldown has not elapsed; retry at `retry_at`
    /// (epoch seconds).
    #[error("cooldown not elapsed, retry at {retry_at}")]
    TooSoon { retry_at: i64 },

    /// The `(IP, route)` window is exhausted.
    #[error("too many requests")]
    TooManyRequests,
}

/// The protected route classes, each with its own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// Canvas metadata and manifest reads.
    State,
    /// Pixel placement.
    Place,
    /// Identity registration.
    Register,
}

/// One route's window shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowConfig {
    /// Maximum requests allowed inside the window.
    pub max_requests: u32,
    /// Window size in seconds.
    pub window_secs: u64,
}

/// Configuration for the volume limiter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeLimiterConfig {
    /// Window for state/metadata reads.
    #[serde(default = "default_state_window")]
    pub state: WindowConfig,

    /// Window for pixel placement.
    #[serde(default = "default_place_window")]
    pub place: WindowConfig,

    /// Window for identity registration.
    #[serde(default = "default_register_window")]
    pub register: WindowConfig,

    /// Run cleanup every N checks.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,

    /// Hard cap on tracked `(IP, route)` keys.
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,
}

fn default_state_window() -> WindowConfig {
    WindowConfig {
        max_requests: 20,
        window_secs: 20,
    }
}

fn default_place_window() -> WindowConfig {
    WindowConfig {
        max_requests: 1,
        window_secs: 60,
    }
}

fn default_register_window() -> WindowConfig {
    WindowConfig {
        max_requests: 5,
        window_secs: 3600,
    }
}

const fn default_cleanup_interval() -> u64 {
    100
}

const fn default_max_tracked_keys() -> usize {
    10_000
}

impl Default for VolumeLimiterConfig {
    fn default() -> Self {
        Self {
            state: default_state_window(),
            place: default_place_window(),
            register: default_register_window(),
            cleanup_interval: default_cleanup_interval(),
            max_tracked_keys: default_max_tracked_keys(),
        }
    }
}

type Key = (IpAddr, RouteClass);

/// In-memory sliding-window limiter keyed by `(IP, route class)`.
pub struct VolumeLimiter {
    config: VolumeLimiterConfig,
    state: RwLock<HashMap<Key, Vec<Instant>>>,
    check_count: AtomicU64,
}

impl VolumeLimiter {
    /// Creates a limiter with the given configuration.
    #[must_use]
    pub fn new(config: VolumeLimiterConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            check_count: AtomicU64::new(0),
        }
    }

    /// Checks whether a request from `ip` against `route` is allowed, and
    /// records it if so.
    ///
    /// # Errors
    ///
    /// Returns `TooManyRequests` if the window is exhausted, or if the
    /// tracked-key cap is reached and this key is not yet tracked.
    pub fn check(&self, route: RouteClass, ip: IpAddr) -> Result<(), RateLimitError> {
        let window = self.window_for(route);
        let now = Instant::now();
        let cutoff = now
            .checked_sub(Duration::from_secs(window.window_secs))
            .unwrap_or(now);
        let key = (ip, route);

        // Relaxed is fine: a missed or duplicate cleanup is harmless.
        let count = self.check_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            self.cleanup();
        }

        {
            let state = self
                .state
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            if let Some(timestamps) = state.get(&key) {
                let recent = timestamps.iter().filter(|&&t| t > cutoff).count();
                if recent >= window.max_requests as usize {
                    tracing::warn!(
                        ip = %ip,
                        route = ?route,
                        requests = recent,
                        max = window.max_requests,
                        "request volume limit exceeded"
                    );
                    return Err(RateLimitError::TooManyRequests);
                }
            } else if state.len() >= self.config.max_tracked_keys {
                drop(state);
                self.cleanup();

                let state = self
                    .state
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if !state.contains_key(&key) && state.len() >= self.config.max_tracked_keys {
                    tracing::warn!(
                        ip = %ip,
                        route = ?route,
                        tracked = state.len(),
                        "rejecting new key: tracked-key cap reached"
                    );
                    return Err(RateLimitError::TooManyRequests);
                }
            }
        }

        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Re-check the cap under the write lock: another thread may have
        // filled the map between our read check and here.
        if !state.contains_key(&key) && state.len() >= self.config.max_tracked_keys {
            return Err(RateLimitError::TooManyRequests);
        }

        let timestamps = state.entry(key).or_default();
        timestamps.retain(|&t| t > cutoff);
        if timestamps.len() >= window.max_requests as usize {
            return Err(RateLimitError::TooManyRequests);
        }
        timestamps.push(now);
        Ok(())
    }

    /// Removes keys whose every request has aged out of its window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let config = &self.config;
        state.retain(|&(_, route), timestamps| {
            let window_secs = match route {
                RouteClass::State => config.state.window_secs,
                RouteClass::Place => config.place.window_secs,
                RouteClass::Register => config.register.window_secs,
            };
            let cutoff = now
                .checked_sub(Duration::from_secs(window_secs))
                .unwrap_or(now);
            timestamps.retain(|&t| t > cutoff);
            !timestamps.is_empty()
        });
    }

    /// Number of tracked `(IP, route)` keys; for monitoring.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn window_for(&self, route: RouteClass) -> &WindowConfig {
        match route {
            RouteClass::State => &self.config.state,
            RouteClass::Place => &self.config.place,
            RouteClass::Register => &self.config.register,
        }
    }
}

/// The per-identity cooldown gate.
#[derive(Debug, Clone, Copy)]
pub struct CooldownGate {
    cooldown_secs: i64,
}

impl CooldownGate {
    #[must_use]
    pub const fn new(cooldown_secs: i64) -> Self {
        Self { cooldown_secs }
    }

    /// Checks whether an identity whose last accepted write was at
    /// `last_write_at` may write again at `now` (both epoch seconds).
    ///
    /// # Errors
    ///
    /// Returns `TooSoon` carrying the identity's own earliest retry time.
    pub fn check(&self, last_write_at: i64, now: i64) -> Result<(), RateLimitError> {
        let retry_at = last_write_at.saturating_add(self.cooldown_secs);
        if now < retry_at {
            return Err(RateLimitError::TooSoon { retry_at });
        }
        Ok(())
    }

    /// The next allowed write time for a write accepted at `now`, with the
    /// cooldown stretched by `factor` (ambiguous fraud scores lengthen the
    /// cooldown instead of blocking the write).
    #[must_use]
    pub fn next_allowed(&self, now: i64, factor: u32) -> i64 {
        now.saturating_add(self.cooldown_secs.saturating_mul(i64::from(factor)))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn config(max_requests: u32, window_secs: u64) -> VolumeLimiterConfig {
        VolumeLimiterConfig {
            state: WindowConfig {
                max_requests,
                window_secs,
            },
            ..Default::default()
        }
    }

    #[test]
    fn allows_requests_within_limit() {
        let limiter = VolumeLimiter::new(config(5, 60));
        for _ in 0..5 {
            assert!(limiter.check(RouteClass::State, ip(1)).is_ok());
        }
    }

    #[test]
    fn rejects_when_limit_exceeded() {
        let limiter = VolumeLimiter::new(config(20, 20));
        let mut rejected = 0;
        for _ in 0..25 {
            if limiter.check(RouteClass::State, ip(1)).is_err() {
                rejected += 1;
            }
        }
        // Requests 21..=25 are over the limit.
        assert_eq!(rejected, 5);
    }

    #[test]
    fn different_ips_tracked_separately() {
        let limiter = VolumeLimiter::new(config(2, 60));
        assert!(limiter.check(RouteClass::State, ip(1)).is_ok());
        assert!(limiter.check(RouteClass::State, ip(1)).is_ok());
        assert_eq!(
            limiter.check(RouteClass::State, ip(1)),
            Err(RateLimitError::TooManyRequests)
        );

        assert!(limiter.check(RouteClass::State, ip(2)).is_ok());
    }

    #[test]
    fn routes_have_independent_windows() {
        let limiter = VolumeLimiter::new(VolumeLimiterConfig {
            place: WindowConfig {
                max_requests: 1,
                window_secs: 60,
            },
            ..Default::default()
        });

        assert!(limiter.check(RouteClass::Place, ip(1)).is_ok());
        assert_eq!(
            limiter.check(RouteClass::Place, ip(1)),
            Err(RateLimitError::TooManyRequests)
        );
        // The same IP can still read state and register.
        assert!(limiter.check(RouteClass::State, ip(1)).is_ok());
        assert!(limiter.check(RouteClass::Register, ip(1)).is_ok());
    }

    #[test]
    fn window_expiration_frees_quota() {
        let limiter = VolumeLimiter::new(config(2, 1));
        assert!(limiter.check(RouteClass::State, ip(1)).is_ok());
        assert!(limiter.check(RouteClass::State, ip(1)).is_ok());
        assert!(limiter.check(RouteClass::State, ip(1)).is_err());

        thread::sleep(Duration::from_millis(1100));
        assert!(limiter.check(RouteClass::State, ip(1)).is_ok());
    }

    #[test]
    fn cleanup_removes_expired_keys() {
        let limiter = VolumeLimiter::new(config(10, 1));
        for i in 0..5 {
            limiter.check(RouteClass::State, ip(i)).unwrap();
        }
        assert_eq!(limiter.tracked_keys(), 5);

        thread::sleep(Duration::from_millis(1100));
        limiter.cleanup();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn tracked_key_cap_rejects_new_keys() {
        let limiter = VolumeLimiter::new(VolumeLimiterConfig {
            state: WindowConfig {
                max_requests: 100,
                window_secs: 60,
            },
            cleanup_interval: 1000,
            max_tracked_keys: 3,
            ..Default::default()
        });

        for i in 0..3 {
            assert!(limiter.check(RouteClass::State, ip(i)).is_ok());
        }
        assert!(limiter.check(RouteClass::State, ip(9)).is_err());
        // Already-tracked keys keep working at the cap.
        assert!(limiter.check(RouteClass::State, ip(0)).is_ok());
        assert!(limiter.tracked_keys() <= 3);
    }

    #[test]
    fn concurrent_checks_respect_the_limit() {
        let limiter = Arc::new(VolumeLimiter::new(config(100, 60)));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    for _ in 0..10 {
                        let _ = limiter.check(RouteClass::State, ip(1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            limiter.check(RouteClass::State, ip(1)),
            Err(RateLimitError::TooManyRequests)
        );
    }

    #[test]
    fn cooldown_boundary_is_exact() {
        let gate = CooldownGate::new(60);
        let last = 1_700_000_000;

        assert_eq!(
            gate.check(last, last + 59),
            Err(RateLimitError::TooSoon {
                retry_at: last + 60
            })
        );
        assert!(gate.check(last, last + 60).is_ok());
        assert!(gate.check(last, last + 61).is_ok());
    }

    #[test]
    fn stretched_cooldown_for_ambiguous_scores() {
        let gate = CooldownGate::new(60);
        assert_eq!(gate.next_allowed(1000, 1), 1060);
        assert_eq!(gate.next_allowed(1000, 5), 1300);
    }

    #[test]
    fn default_config_matches_route_budgets() {
        let config = VolumeLimiterConfig::default();
        assert_eq!(config.state.max_requests, 20);
        assert_eq!(config.state.window_secs, 20);
        assert_eq!(config.place.max_requests, 1);
        assert_eq!(config.register.max_requests, 5);
        assert_eq!(config.register.window_secs, 3600);
        assert_eq!(config.max_tracked_keys, 10_000);
    }
}
