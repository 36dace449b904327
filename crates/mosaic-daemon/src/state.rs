//! Shared application state.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::info;

use mosaic_core::config::ServiceConfig;
use mosaic_core::identity::TokenService;
use mosaic_core::palette::Palette;
use mosaic_core::ratelimit::{CooldownGate, VolumeLimiter};
use mosaic_core::snapshot::SnapshotPublisher;
use mosaic_core::store::CanvasStore;

use crate::captcha::CaptchaClient;
use crate::flush::FlushWorker;
use crate::history::ChangeHistory;
use crate::presence::Presence;

/// Everything the handlers share.
pub struct AppState {
    pub config: ServiceConfig,
    pub palette: Palette,
    pub store: Arc<CanvasStore>,
    pub publisher: Arc<SnapshotPublisher>,
    pub tokens: TokenService,
    pub limiter: VolumeLimiter,
    pub cooldown: CooldownGate,
    pub captcha: CaptchaClient,
    pub history: ChangeHistory,
    pub presence: Presence,
    pub flush_tx: mpsc::Sender<(u32, u32)>,
    /// Protocol version: process start time relative to the chunk epoch
    /// base. Clients compare it to detect server restarts and format bumps.
    pub version: i64,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Builds the full application state and its flush worker.
    ///
    /// Loads the canvas from disk, publishes an initial image per chunk so
    /// the manifest never references a previous process life, and wires the
    /// collaborator adapters.
    ///
    /// # Errors
    ///
    /// Returns an error if any persistent resource (canvas directory, image
    /// directory, key file, history database) cannot be initialized.
    pub fn build(config: ServiceConfig, now: i64) -> anyhow::Result<(SharedState, FlushWorker)> {
        let palette = config.palette().context("invalid palette")?;

        let store = Arc::new(
            CanvasStore::load(
                config.canvas.width,
                config.canvas.height,
                config.canvas.chunk_size,
                palette.len(),
                &config.canvas.data_dir,
                now,
            )
            .context("failed to load canvas")?,
        );

        let publisher = Arc::new(
            SnapshotPublisher::new(
                &config.canvas.images_dir,
                palette.clone(),
                config.canvas.chunk_size,
                store.cols(),
                store.rows(),
                now,
            )
            .context("failed to create snapshot publisher")?,
        );
        for cx in 0..store.cols() {
            for cy in 0..store.rows() {
                publisher
                    .publish(&store.snapshot(cx, cy))
                    .context("failed to publish initial chunk image")?;
            }
        }
        info!(
            chunks = store.cols() * store.rows(),
            "initial chunk images published"
        );

        let tokens = TokenService::from_key_file(
            &config.server.key_file,
            &config.server.issuer,
            config.canvas.cooldown_secs,
        )
        .context("failed to load identity signing key")?;

        let history =
            ChangeHistory::open(&config.history.db_path).context("failed to open history store")?;

        let captcha =
            CaptchaClient::new(config.captcha.clone()).context("failed to build captcha client")?;

        let limiter = VolumeLimiter::new(config.limits.clone());
        let cooldown = CooldownGate::new(config.canvas.cooldown_secs);

        let (flush_tx, worker) =
            FlushWorker::new(Arc::clone(&store), Arc::clone(&publisher), &config.flush);

        let state = Arc::new(Self {
            palette,
            store,
            publisher,
            tokens,
            limiter,
            cooldown,
            captcha,
            history,
            presence: Presence::new(),
            flush_tx,
            version: now - mosaic_core::EPOCH_BASE,
            config,
        });
        Ok((state, worker))
    }
}
