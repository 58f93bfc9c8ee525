//! Worker configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of a composer node, e.g. `http://composer:8080`
    pub composer_url: String,
    /// Number of slots, one per core given to encoding
    pub cpu_quota: usize,
    /// Max concurrent jobs on one slot
    pub max_tasks_per_slot: u32,
    /// Scratch space for downloaded sources and encoded outputs
    pub work_dir: PathBuf,
    /// Node identity reported to the composer
    pub hostname: String,
    /// Unique per process
    pub worker_id: String,
    /// Routing class to consume
    pub routing: String,
    /// Per-codec weight overrides, `codec -> weight`
    pub codec_weights: HashMap<String, u32>,
    /// Minimum spacing of progress reports per job
    pub progress_interval: Duration,
    /// Kill a single encode after this long
    pub encode_timeout: Option<Duration>,
    /// How long shutdown waits for running jobs before cancelling them
    pub shutdown_timeout: Duration,
    /// Sweep interval of the work dir janitor
    pub cleanup_interval: Duration,
    /// Work dir entries older than this are removed
    pub cleanup_max_age: Duration,
    /// Serve Prometheus metrics here when set
    pub metrics_addr: Option<SocketAddr>,
}

/// All cores but one, and at least one.
pub fn default_cpu_quota() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            composer_url: "http://127.0.0.1:8080".to_string(),
            cpu_quota: default_cpu_quota(),
            max_tasks_per_slot: 1,
            work_dir: PathBuf::from("/tmp/trx/worker"),
            hostname: "localhost".to_string(),
            worker_id: uuid::Uuid::new_v4().to_string(),
            routing: "cpu".to_string(),
            codec_weights: HashMap::from([("h264".to_string(), 60)]),
            progress_interval: Duration::from_secs(2),
            encode_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            cleanup_max_age: Duration::from_secs(2 * 3600),
            metrics_addr: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Parse `h264=60,hevc=100`. Malformed entries are skipped.
pub fn parse_codec_weights(s: &str) -> HashMap<String, u32> {
    s.split(',')
        .filter_map(|pair| {
            let (codec, weight) = pair.split_once('=')?;
            let weight = weight.trim().parse().ok()?;
            let codec = codec.trim();
            (!codec.is_empty()).then(|| (codec.to_string(), weight))
        })
        .collect()
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            composer_url: std::env::var("COMPOSER_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.composer_url),
            cpu_quota: env_parse::<usize>("CPU_QUOTA")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.cpu_quota),
            max_tasks_per_slot: env_parse::<u32>("MAX_TASKS_PER_SLOT")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_tasks_per_slot),
            work_dir: std::env::var("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            hostname: std::env::var("HOSTNAME").unwrap_or(defaults.hostname),
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            routing: std::env::var("WORKER_ROUTING").unwrap_or(defaults.routing),
            codec_weights: std::env::var("WORKER_CODEC_WEIGHTS")
                .map(|s| parse_codec_weights(&s))
                .unwrap_or(defaults.codec_weights),
            progress_interval: env_parse("PROGRESS_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.progress_interval),
            encode_timeout: env_parse("ENCODE_TIMEOUT_SECS").map(Duration::from_secs),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            cleanup_interval: defaults.cleanup_interval,
            cleanup_max_age: env_parse("CLEANUP_MAX_AGE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_max_age),
            metrics_addr: env_parse("METRICS_ADDR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!(config.cpu_quota >= 1);
        assert_eq!(config.max_tasks_per_slot, 1);
        assert_eq!(config.codec_weights.get("h264"), Some(&60));
        assert_eq!(config.progress_interval, Duration::from_secs(2));
        assert_eq!(config.cleanup_max_age, Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_codec_weights() {
        let weights = parse_codec_weights("h264=60, hevc = 100,bad,vp9=x,=5");
        assert_eq!(weights.len(), 2);
        assert_eq!(weights["h264"], 60);
        assert_eq!(weights["hevc"], 100);
    }
}
