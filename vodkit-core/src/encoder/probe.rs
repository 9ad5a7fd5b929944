use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::CommandExecutor;

/// Whether the source carries an audio stream. `Unknown` means the probe
/// could not run at all (typically no ffprobe installed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioPresence {
    Present,
    Absent,
    Unknown,
}

impl AudioPresence {
    /// Only a positive probe maps audio; unknown sources are encoded
    /// video-only.
    pub fn maps_audio(&self) -> bool {
        matches!(self, AudioPresence::Present)
    }
}

/// What rung selection needs to know about a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceMeta {
    pub height: Option<u32>,
    pub bitrate_bps: Option<u64>,
}

pub async fn probe_audio(
    executor: &dyn CommandExecutor,
    ffprobe: &Path,
    source: &Path,
) -> AudioPresence {
    let args = vec![
        "-v".to_string(),
        "error".to_string(),
        "-select_streams".to_string(),
        "a".to_string(),
        "-show_entries".to_string(),
        "stream=index".to_string(),
        "-of".to_string(),
        "compact=p=0:nk=1".to_string(),
        source.to_string_lossy().to_string(),
    ];
    match executor.run(ffprobe, &args, None).await {
        Ok(output) if !output.status.success() => AudioPresence::Absent,
        Ok(output) if String::from_utf8_lossy(&output.stdout).trim().is_empty() => {
            AudioPresence::Absent
        }
        Ok(_) => AudioPresence::Present,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(ffprobe = %ffprobe.display(), "ffprobe not available, audio presence unknown");
            AudioPresence::Unknown
        }
        Err(err) => {
            warn!(ffprobe = %ffprobe.display(), error = %err, "audio probe failed");
            AudioPresence::Unknown
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeDocument {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    height: Option<u32>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    bit_rate: Option<String>,
}

/// Height and bitrate of the first video stream. `None` when ffprobe is
/// unavailable or its output is unusable.
pub async fn probe_source(
    executor: &dyn CommandExecutor,
    ffprobe: &Path,
    source: &Path,
) -> Option<SourceMeta> {
    let args = vec![
        "-v".to_string(),
        "error".to_string(),
        "-select_streams".to_string(),
        "v:0".to_string(),
        "-show_entries".to_string(),
        "stream=height,bit_rate:format=bit_rate".to_string(),
        "-of".to_string(),
        "json".to_string(),
        source.to_string_lossy().to_string(),
    ];
    let output = match executor.run(ffprobe, &args, None).await {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            debug!(status = ?output.status.code(), "source probe exited unsuccessfully");
            return None;
        }
        Err(err) => {
            debug!(error = %err, "source probe could not run");
            return None;
        }
    };
    parse_probe_json(&output.stdout)
}

fn parse_probe_json(stdout: &[u8]) -> Option<SourceMeta> {
    let document: ProbeDocument = serde_json::from_slice(stdout).ok()?;
    let stream = document.streams.first();
    let stream_rate = stream
        .and_then(|s| s.bit_rate.as_deref())
        .and_then(|rate| rate.parse::<u64>().ok());
    let format_rate = document
        .format
        .and_then(|f| f.bit_rate)
        .and_then(|rate| rate.parse::<u64>().ok());
    Some(SourceMeta {
        height: stream.and_then(|s| s.height),
        bitrate_bps: stream_rate.or(format_rate),
    })
}
