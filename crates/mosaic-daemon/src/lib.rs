//! mosaic-daemon - HTTP surface and background workers for the mosaic
//! collaborative pixel canvas.
//!
//! The daemon owns everything around the core engine: the axum routes and
//! their error mapping, the placement pipeline, the fraud-check and
//! change-history collaborator adapters, the background flush worker that
//! persists and renders dirty chunks, and presence counters.
//!
//! # Modules
//!
//! - [`routes`]: axum handlers and the router
//! - [`place`]: the placement request pipeline
//! - [`error`]: HTTP error taxonomy
//! - [`captcha`]: fraud-check collaborator client
//! - [`history`]: change-history collaborator adapter
//! - [`flush`]: background persistence/snapshot worker and image sweep
//! - [`presence`]: viewing/active counters
//! - [`state`]: shared application state

pub mod cache;
pub mod captcha;
pub mod error;
pub mod flush;
pub mod history;
pub mod place;
pub mod presence;
pub mod routes;
pub mod state;
