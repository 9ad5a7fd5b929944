use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VodkitConfig {
    pub paths: PathsSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub transcode: TranscodeSection,
    #[serde(default)]
    pub encoder: EncoderSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub indexer: IndexerSection,
    #[serde(default)]
    pub autotranscode: AutotranscodeSection,
}

impl VodkitConfig {
    /// Builds a config rooted at `base` with every other section defaulted.
    pub fn with_base_dir(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            paths: PathsSection {
                media_root: base.join("media").to_string_lossy().to_string(),
                data_dir: base.join("data").to_string_lossy().to_string(),
            },
            cache: CacheSection::default(),
            transcode: TranscodeSection::default(),
            encoder: EncoderSection::default(),
            retry: RetrySection::default(),
            dispatch: DispatchSection::default(),
            indexer: IndexerSection::default(),
            autotranscode: AutotranscodeSection::default(),
        }
    }

    pub fn media_root(&self) -> PathBuf {
        PathBuf::from(&self.paths.media_root)
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.data_dir)
    }

    pub fn renditions_db(&self) -> PathBuf {
        self.data_dir().join("renditions.sqlite")
    }

    pub fn cache_db(&self) -> PathBuf {
        self.data_dir().join("cache.sqlite")
    }

    pub fn broker_db(&self) -> PathBuf {
        self.data_dir().join("broker.sqlite")
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.transcode.lock_ttl_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "transcode.lock_ttl_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.encoder.hls_time == 0 {
            return Err(ConfigError::Invalid {
                field: "encoder.hls_time",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub media_root: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CacheSection {
    #[serde(default)]
    pub backend: CacheBackend,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscodeSection {
    pub lock_ttl_seconds: u64,
    pub status_ttl_seconds: u64,
    pub failed_status_ttl_seconds: u64,
    pub pending_ttl_seconds: u64,
}

impl Default for TranscodeSection {
    fn default() -> Self {
        Self {
            lock_ttl_seconds: 15 * 60,
            status_ttl_seconds: 15 * 60,
            failed_status_ttl_seconds: 10 * 60,
            pending_ttl_seconds: 10 * 60,
        }
    }
}

impl TranscodeSection {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_seconds)
    }

    pub fn failed_status_ttl(&self) -> Duration {
        Duration::from_secs(self.failed_status_ttl_seconds)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub hls_time: u32,
    pub process_timeout_seconds: u64,
    pub video_codec: String,
    pub profile: String,
    pub level: String,
    pub pix_fmt: String,
    pub preset: String,
    pub gop: u32,
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            hls_time: 4,
            process_timeout_seconds: 15 * 60,
            video_codec: "h264".to_string(),
            profile: "main".to_string(),
            level: "3.1".to_string(),
            pix_fmt: "yuv420p".to_string(),
            preset: "veryfast".to_string(),
            gop: 48,
        }
    }
}

impl EncoderSection {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub schedule_seconds: Vec<u64>,
    /// Skips every backoff sleep; attempts still run.
    pub fast_mode: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            schedule_seconds: vec![1, 2, 4, 8, 16, 32],
            fast_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Inline,
    Broker,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Inline => "inline",
            DispatchMode::Broker => "broker",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub mode: DispatchMode,
    pub queue_name: String,
    pub job_name: String,
    pub job_timeout_seconds: u64,
    pub result_ttl_seconds: u64,
    pub worker_poll_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Inline,
            queue_name: "transcode".to_string(),
            job_name: "transcode_video".to_string(),
            job_timeout_seconds: 15 * 60,
            result_ttl_seconds: 600,
            worker_poll_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexerSection {
    pub guard_window_seconds: u64,
}

impl Default for IndexerSection {
    fn default() -> Self {
        Self {
            guard_window_seconds: 10,
        }
    }
}

impl IndexerSection {
    pub fn guard_window(&self) -> Duration {
        Duration::from_secs(self.guard_window_seconds)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RungPolicy {
    #[default]
    Relaxed,
    Strict,
    #[serde(rename = "force_1080")]
    Force1080,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutotranscodeSection {
    pub policy: RungPolicy,
    pub allowed_renditions: Vec<String>,
    pub debounce_seconds: u64,
    pub min_720_height: u32,
    pub min_720_bitrate: u64,
    pub min_1080_height: u32,
    pub min_1080_bitrate: u64,
}

impl Default for AutotranscodeSection {
    fn default() -> Self {
        Self {
            policy: RungPolicy::Relaxed,
            allowed_renditions: vec!["1080p".into(), "720p".into(), "480p".into()],
            debounce_seconds: 10,
            min_720_height: 700,
            min_720_bitrate: 2_500_000,
            min_1080_height: 1000,
            min_1080_bitrate: 4_500_000,
        }
    }
}

pub fn load_vodkit_config<P: AsRef<Path>>(path: P) -> Result<VodkitConfig> {
    let config: VodkitConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
