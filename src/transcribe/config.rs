use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::db::{self, DbPool};

/// Default minimum buffered seconds before a non-forced recognition attempt
pub const DEFAULT_MIN_AUDIO_SECONDS: f64 = 0.5;
/// Default sweep interval
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 2000;
/// Default chunk-length hint passed to the recognizer
pub const DEFAULT_CHUNK_SECONDS: u32 = 5;

/// Accepted range for `min_audio_seconds` at the edit surface
pub const MIN_AUDIO_SECONDS_RANGE: (f64, f64) = (0.1, 20.0);
/// Accepted range for `sweep_interval_ms` at the edit surface
pub const SWEEP_INTERVAL_MS_RANGE: (u64, u64) = (200, 60000);
/// Accepted range for `chunk_seconds` at the edit surface
pub const CHUNK_SECONDS_RANGE: (u32, u32) = (1, 30);

/// Per-guild transcription tunables. Re-read from storage at every sweep
/// tick so edits apply to live sessions without a restart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TranscribeConfig {
    pub min_audio_seconds: f64,
    pub sweep_interval_ms: u64,
    pub chunk_seconds: u32,
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            min_audio_seconds: DEFAULT_MIN_AUDIO_SECONDS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            chunk_seconds: DEFAULT_CHUNK_SECONDS,
        }
    }
}

/// Source of per-guild tunables for a running session.
#[async_trait::async_trait]
pub trait ConfigSource: Send + Sync {
    /// Current tunables for the guild. Infallible: implementations fall back
    /// to defaults (or the last known values) on storage errors.
    async fn transcribe_config(&self, guild_id: u64) -> TranscribeConfig;
}

/// Sqlite-backed config source.
pub struct DbConfigSource {
    pool: DbPool,
    /// Last successfully loaded tunables, served while storage is failing
    last: Mutex<TranscribeConfig>,
}

impl DbConfigSource {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            last: Mutex::new(TranscribeConfig::default()),
        }
    }
}

#[async_trait::async_trait]
impl ConfigSource for DbConfigSource {
    async fn transcribe_config(&self, guild_id: u64) -> TranscribeConfig {
        match db::get_transcribe_config(&self.pool, &guild_id.to_string()).await {
            Ok(cfg) => {
                *self.last.lock().await = cfg;
                cfg
            }
            Err(e) => {
                warn!(
                    "({}) Failed to refresh transcribe config, keeping last known values: {}",
                    guild_id, e
                );
                *self.last.lock().await
            }
        }
    }
}
