//! Static rendition ladder: label → encode parameters.

use serde::Serialize;

use crate::error::{TranscodeError, TranscodeResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    /// Advertised in the master playlist as `BANDWIDTH`.
    pub bandwidth: u64,
    pub scale: Option<&'static str>,
    pub video_bitrate: Option<&'static str>,
    pub maxrate: Option<&'static str>,
    pub bufsize: Option<&'static str>,
    pub audio_bitrate: &'static str,
    pub audio_channels: u8,
    pub audio_rate: u32,
}

impl Profile {
    const fn ladder(label: &'static str, width: u32, height: u32, bandwidth: u64) -> Self {
        Self {
            label,
            width,
            height,
            bandwidth,
            scale: None,
            video_bitrate: None,
            maxrate: None,
            bufsize: None,
            audio_bitrate: "128k",
            audio_channels: 2,
            audio_rate: 48_000,
        }
    }

    pub fn scale_filter(&self) -> String {
        self.scale
            .map(str::to_string)
            .unwrap_or_else(|| format!("scale={}:{}", self.width, self.height))
    }

    pub fn dimensions(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

static PROFILES: [Profile; 4] = [
    Profile::ladder("360p", 640, 360, 800_000),
    Profile {
        scale: Some("scale=-2:480"),
        video_bitrate: Some("1500k"),
        maxrate: Some("2100k"),
        bufsize: Some("3000k"),
        ..Profile::ladder("480p", 854, 480, 2_100_000)
    },
    Profile::ladder("720p", 1280, 720, 4_000_000),
    Profile::ladder("1080p", 1920, 1080, 8_000_000),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileCatalog;

impl ProfileCatalog {
    pub fn new() -> Self {
        Self
    }

    pub fn get(&self, label: &str) -> Option<&'static Profile> {
        PROFILES.iter().find(|profile| profile.label == label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.get(label).is_some()
    }

    pub fn labels(&self) -> impl Iterator<Item = &'static str> {
        PROFILES.iter().map(|profile| profile.label)
    }

    pub fn profiles(&self) -> &'static [Profile] {
        &PROFILES
    }

    /// Highest bandwidth first, the order a master playlist lists variants in.
    pub fn by_bandwidth_desc(&self) -> Vec<&'static Profile> {
        let mut profiles: Vec<&'static Profile> = PROFILES.iter().collect();
        profiles.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
        profiles
    }

    /// Normalises a requested label list: empty means every profile, duplicates
    /// are dropped keeping first occurrence, and any unknown label fails.
    pub fn resolve<S: AsRef<str>>(&self, requested: &[S]) -> TranscodeResult<Vec<String>> {
        if requested.is_empty() {
            return Ok(self.labels().map(str::to_string).collect());
        }
        let mut resolved: Vec<String> = Vec::with_capacity(requested.len());
        for label in requested {
            let label = label.as_ref();
            if !self.contains(label) {
                return Err(TranscodeError::validation(format!(
                    "Unsupported resolution '{label}'."
                )));
            }
            if !resolved.iter().any(|existing| existing == label) {
                resolved.push(label.to_string());
            }
        }
        Ok(resolved)
    }
}
