//! mosaic-core - canvas state engine for the mosaic collaborative pixel
//! canvas.
//!
//! The canvas is a fixed grid of pixels, each holding an index into a shared
//! color palette. It is split into fixed-size chunks: the unit of locking,
//! persistence and snapshot rendering. Clients are anonymous identities
//! carried entirely in a signed token; a per-identity cooldown and a
//! per-IP request-volume limiter throttle writes.
//!
//! # Modules
//!
//! - [`palette`]: ordered, indexed color palette
//! - [`chunk`]: chunk byte format and compressed codec
//! - [`store`]: the chunked pixel store (per-chunk locks, dirty tracking,
//!   load/persist)
//! - [`snapshot`]: per-chunk PNG rendering and the copy-on-write manifest
//! - [`identity`]: stateless signed identity tokens
//! - [`names`]: display-name generation for fresh identities
//! - [`ratelimit`]: the per-identity cooldown gate and the per-(IP, route)
//!   volume limiter
//! - [`config`]: TOML service configuration
//! - [`fs_safe`]: atomic file replacement primitives

pub mod chunk;
pub mod config;
pub mod fs_safe;
pub mod identity;
pub mod names;
pub mod palette;
pub mod ratelimit;
pub mod snapshot;
pub mod store;

pub use chunk::EPOCH_BASE;
pub use config::{ConfigError, ServiceConfig};
pub use identity::{Claims, IdentityError, TokenService, strip_uuid};
pub use palette::{Palette, PaletteError};
pub use ratelimit::{
    CooldownGate, RateLimitError, RouteClass, VolumeLimiter, VolumeLimiterConfig,
};
pub use snapshot::{SnapshotError, SnapshotPublisher};
pub use store::{CanvasError, CanvasStore, ChunkSnapshot};
