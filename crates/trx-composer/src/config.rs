//! Composer configuration.

use std::path::PathBuf;
use std::time::Duration;

use trx_models::Preset;

/// Number of claim loops and processing tasks for one phase.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub watchers: usize,
    pub workers: usize,
    /// Pause between claims while the phase is idle
    pub tick: Duration,
    /// Pause after a claim error
    pub backoff: Duration,
}

/// Encoding settings stamped onto every subtask.
#[derive(Debug, Clone)]
pub struct EncodeProfile {
    pub video_codec: String,
    pub preset: Preset,
    pub crf: u8,
    /// Constant bitrate in kbit/s; CRF mode when unset
    pub video_bitrate_kbps: Option<u32>,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
}

impl Default for EncodeProfile {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            preset: Preset::Medium,
            crf: 23,
            video_bitrate_kbps: None,
            audio_codec: "aac".to_string(),
            audio_bitrate_kbps: 128,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct ComposerConfig {
    /// Postgres DSN; the in-memory claim store is used when unset
    pub postgres_dsn: Option<String>,
    /// Redis URL; the in-memory queue store is used when unset
    pub redis_url: Option<String>,
    pub host: String,
    pub port: u16,
    /// Address workers use to reach this node (host:port)
    pub public_addr: String,
    /// Node identity used for claim affinity
    pub hostname: String,
    /// Per-task scratch space: sources, chunks, encoded parts
    pub work_dir: PathBuf,
    /// Finished assets end up here
    pub output_dir: PathBuf,
    pub splitter: PoolConfig,
    pub assembler: PoolConfig,
    /// Target chunk length in seconds
    pub chunk_seconds: u32,
    /// Fragment length of finalized MP4s in seconds
    pub fragment_seconds: u32,
    pub admission_interval: Duration,
    /// Max tasks waiting for or in the split phase per routing class
    pub routing_max_tasks: i64,
    /// Max summed source duration (seconds) of those tasks
    pub routing_max_duration: f64,
    /// Max summed source size (bytes) of those tasks
    pub routing_max_file_size: i64,
    pub cancel_poll: Duration,
    pub metrics_enabled: bool,
    pub max_body_size: usize,
    pub encode: EncodeProfile,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            postgres_dsn: None,
            redis_url: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_addr: "127.0.0.1:8080".to_string(),
            hostname: "localhost".to_string(),
            work_dir: PathBuf::from("/tmp/trx/work"),
            output_dir: PathBuf::from("/tmp/trx/output"),
            splitter: PoolConfig {
                watchers: 1,
                workers: 5,
                tick: Duration::from_secs(3),
                backoff: Duration::from_secs(5),
            },
            assembler: PoolConfig {
                watchers: 1,
                workers: 2,
                tick: Duration::from_secs(3),
                backoff: Duration::from_secs(5),
            },
            chunk_seconds: 10,
            fragment_seconds: 4,
            admission_interval: Duration::from_secs(5),
            routing_max_tasks: 50,
            routing_max_duration: 6.0 * 3600.0,
            routing_max_file_size: 50 * 1024 * 1024 * 1024,
            cancel_poll: Duration::from_secs(5),
            metrics_enabled: true,
            max_body_size: 2 * 1024 * 1024 * 1024,
            encode: EncodeProfile::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl ComposerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = env_parse("HTTP_PORT").unwrap_or(defaults.port);
        let hostname = std::env::var("HOSTNAME").unwrap_or(defaults.hostname);

        Self {
            postgres_dsn: std::env::var("POSTGRES_DSN").ok().filter(|s| !s.is_empty()),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            host: std::env::var("HTTP_HOST").unwrap_or(defaults.host),
            port,
            public_addr: std::env::var("PUBLIC_ADDR").unwrap_or_else(|_| format!("{hostname}:{port}")),
            hostname,
            work_dir: std::env::var("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            output_dir: std::env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            splitter: PoolConfig {
                watchers: env_parse("SPLITTER_WATCHERS").unwrap_or(defaults.splitter.watchers),
                workers: env_parse("SPLITTER_WORKERS").unwrap_or(defaults.splitter.workers),
                ..defaults.splitter
            },
            assembler: PoolConfig {
                watchers: env_parse("ASSEMBLER_WATCHERS").unwrap_or(defaults.assembler.watchers),
                workers: env_parse("ASSEMBLER_WORKERS").unwrap_or(defaults.assembler.workers),
                ..defaults.assembler
            },
            chunk_seconds: env_parse("CHUNK_SECONDS").unwrap_or(defaults.chunk_seconds),
            fragment_seconds: env_parse("FRAGMENT_SECONDS").unwrap_or(defaults.fragment_seconds),
            admission_interval: env_parse("ADMISSION_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.admission_interval),
            routing_max_tasks: env_parse("ROUTING_MAX_TASKS").unwrap_or(defaults.routing_max_tasks),
            routing_max_duration: env_parse("ROUTING_MAX_DURATION_SECS")
                .unwrap_or(defaults.routing_max_duration),
            routing_max_file_size: env_parse("ROUTING_MAX_FILE_SIZE").unwrap_or(defaults.routing_max_file_size),
            cancel_poll: env_parse("CANCEL_POLL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cancel_poll),
            metrics_enabled: std::env::var("METRICS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.metrics_enabled),
            max_body_size: env_parse("MAX_BODY_SIZE").unwrap_or(defaults.max_body_size),
            encode: EncodeProfile {
                video_codec: std::env::var("VIDEO_CODEC").unwrap_or(defaults.encode.video_codec),
                preset: std::env::var("VIDEO_PRESET")
                    .ok()
                    .and_then(|s| serde_json::from_value(serde_json::Value::String(s)).ok())
                    .unwrap_or(defaults.encode.preset),
                crf: env_parse("VIDEO_CRF").unwrap_or(defaults.encode.crf),
                video_bitrate_kbps: env_parse("VIDEO_BITRATE_KBPS"),
                audio_codec: std::env::var("AUDIO_CODEC").unwrap_or(defaults.encode.audio_codec),
                audio_bitrate_kbps: env_parse("AUDIO_BITRATE_KBPS")
                    .unwrap_or(defaults.encode.audio_bitrate_kbps),
            },
        }
    }

    /// Scratch directory of one task.
    pub fn task_dir(&self, id: &trx_models::TaskId) -> PathBuf {
        self.work_dir.join(id.to_string())
    }

    /// Base URL other nodes use to reach this composer.
    pub fn public_url(&self) -> String {
        format!("http://{}", self.public_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ComposerConfig::default();
        assert_eq!(config.splitter.workers, 5);
        assert_eq!(config.assembler.workers, 2);
        assert_eq!(config.chunk_seconds, 10);
        assert_eq!(config.cancel_poll, Duration::from_secs(5));
        assert_eq!(config.public_url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_task_dir() {
        let config = ComposerConfig::default();
        let id = trx_models::TaskId::new();
        assert_eq!(config.task_dir(&id), PathBuf::from("/tmp/trx/work").join(id.to_string()));
    }
}
