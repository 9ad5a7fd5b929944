//! Runs ffmpeg once per requested rendition and refreshes the master
//! playlist afterwards.

mod command;
mod probe;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::EncoderSection;
use crate::error::{TranscodeError, TranscodeResult};
use crate::profile::{Profile, ProfileCatalog};
use crate::storage::RenditionStore;
use crate::VideoId;

pub use command::{CommandExecutor, SystemCommandExecutor};
pub use probe::{probe_audio, probe_source, AudioPresence, SourceMeta};

const SEGMENT_PATTERN: &str = "%03d.ts";

#[derive(Debug, Clone, Default, Serialize)]
pub struct EncodeReport {
    pub encoded: Vec<String>,
    pub skipped: Vec<String>,
    pub master: Option<PathBuf>,
    pub audio: Option<AudioPresence>,
}

/// Labels committed so far by one encode request, shared across its retry
/// attempts.
#[derive(Debug, Default)]
pub struct EncodeProgress {
    done: Mutex<Vec<String>>,
}

impl EncodeProgress {
    fn labels(&self) -> MutexGuard<'_, Vec<String>> {
        self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels().iter().any(|done| done == label)
    }

    fn record(&self, label: &str) {
        self.labels().push(label.to_string());
    }

    pub fn completed(&self) -> Vec<String> {
        self.labels().clone()
    }
}

#[derive(Debug, Clone)]
pub struct EncoderExecutor {
    config: EncoderSection,
    renditions: RenditionStore,
    executor: Arc<dyn CommandExecutor>,
    catalog: ProfileCatalog,
}

impl EncoderExecutor {
    pub fn new(config: EncoderSection, renditions: RenditionStore) -> Self {
        Self {
            config,
            renditions,
            executor: Arc::new(SystemCommandExecutor),
            catalog: ProfileCatalog::new(),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn renditions(&self) -> &RenditionStore {
        &self.renditions
    }

    pub fn executor(&self) -> Arc<dyn CommandExecutor> {
        Arc::clone(&self.executor)
    }

    pub fn ffprobe(&self) -> &Path {
        Path::new(&self.config.ffprobe)
    }

    /// Encodes every label in `resolutions` that is missing or unfinished (all
    /// of them when `force`), then rewrites the master playlist.
    pub async fn encode<S: AsRef<str>>(
        &self,
        video_id: VideoId,
        resolutions: &[S],
        force: bool,
    ) -> TranscodeResult<EncodeReport> {
        self.encode_resumable(video_id, resolutions, force, &EncodeProgress::default())
            .await
    }

    /// Like `encode`, but labels already recorded in `progress` by an earlier
    /// attempt are not encoded again.
    pub async fn encode_resumable<S: AsRef<str>>(
        &self,
        video_id: VideoId,
        resolutions: &[S],
        force: bool,
        progress: &EncodeProgress,
    ) -> TranscodeResult<EncodeReport> {
        let labels = self.catalog.resolve(resolutions)?;
        let source = self
            .renditions
            .layout()
            .source_path(video_id)
            .ok_or_else(|| TranscodeError::not_found("Source video not found."))?;

        let mut report = EncodeReport::default();
        let audio = probe_audio(self.executor.as_ref(), self.ffprobe(), &source).await;
        if audio == AudioPresence::Unknown {
            debug!(video_id, "audio presence unknown, encoding video only");
        }
        report.audio = Some(audio);

        for label in labels {
            if progress.contains(&label) {
                debug!(video_id, resolution = %label, "rendition finished by an earlier attempt");
                report.encoded.push(label);
                continue;
            }
            if !force && self.renditions.manifest_ready(video_id, &label).await {
                debug!(video_id, resolution = %label, "rendition already present, skipping");
                report.skipped.push(label);
                continue;
            }
            let profile = self
                .catalog
                .get(&label)
                .ok_or_else(|| TranscodeError::validation(format!("Unsupported resolution '{label}'.")))?;
            self.encode_rendition(video_id, profile, &source, audio)
                .await?;
            progress.record(&label);
            report.encoded.push(label);
        }

        report.master = self.renditions.write_master_playlist(video_id).await?;
        info!(
            video_id,
            encoded = report.encoded.len(),
            skipped = report.skipped.len(),
            "encode finished"
        );
        Ok(report)
    }

    /// ffmpeg writes into a staging directory that replaces the live rendition
    /// only after a clean exit; a failed run leaves the live directory as it was.
    async fn encode_rendition(
        &self,
        video_id: VideoId,
        profile: &Profile,
        source: &Path,
        audio: AudioPresence,
    ) -> TranscodeResult<()> {
        let dir = self
            .renditions
            .prepare_rendition_dir(video_id, profile.label, true)
            .await?;
        let args = self.build_args(source, profile, &dir, audio.maps_audio());
        info!(video_id, resolution = profile.label, "starting ffmpeg");

        match self.run_ffmpeg(video_id, profile.label, &args).await {
            Ok(()) => {
                self.renditions
                    .commit_rendition(video_id, profile.label)
                    .await?;
                Ok(())
            }
            Err(err) => {
                self.renditions.discard_staging(video_id, profile.label).await;
                Err(err)
            }
        }
    }

    async fn run_ffmpeg(&self, video_id: VideoId, resolution: &str, args: &[String]) -> TranscodeResult<()> {
        let ffmpeg = Path::new(&self.config.ffmpeg);
        let output = match self
            .executor
            .run(ffmpeg, args, Some(self.config.process_timeout()))
            .await
        {
            Ok(output) => output,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                error!(video_id, ffmpeg = %ffmpeg.display(), "ffmpeg binary not found");
                return Err(TranscodeError::environment(format!(
                    "ffmpeg binary not found: {}",
                    ffmpeg.display()
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                warn!(video_id, resolution, error = %err, "ffmpeg timed out");
                return Err(TranscodeError::transient(format!("ffmpeg timed out: {err}")));
            }
            Err(err) => return Err(TranscodeError::transient(format!("ffmpeg failed to run: {err}"))),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            warn!(video_id, resolution, status = ?output.status.code(), "ffmpeg exited unsuccessfully");
            return Err(TranscodeError::transient(format!(
                "ffmpeg exited with {:?} for {resolution}: {tail}",
                output.status.code()
            )));
        }
        Ok(())
    }

    /// ffmpeg argument vector for one rendition written into `out_dir`.
    pub fn build_args(
        &self,
        source: &Path,
        profile: &Profile,
        out_dir: &Path,
        with_audio: bool,
    ) -> Vec<String> {
        let cfg = &self.config;
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            source.to_string_lossy().to_string(),
            "-vf".into(),
            profile.scale_filter(),
            "-c:v".into(),
            cfg.video_codec.clone(),
            "-profile:v".into(),
            cfg.profile.clone(),
            "-level".into(),
            cfg.level.clone(),
            "-pix_fmt".into(),
            cfg.pix_fmt.clone(),
            "-preset".into(),
            cfg.preset.clone(),
            "-g".into(),
            cfg.gop.to_string(),
            "-sc_threshold".into(),
            "0".into(),
            "-map".into(),
            "0:v:0".into(),
        ];
        for (flag, value) in [
            ("-b:v", profile.video_bitrate),
            ("-maxrate", profile.maxrate),
            ("-bufsize", profile.bufsize),
        ] {
            if let Some(value) = value {
                args.push(flag.into());
                args.push(value.into());
            }
        }
        if with_audio {
            args.extend([
                "-map".into(),
                "0:a:0".into(),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                profile.audio_bitrate.into(),
                "-ar".into(),
                profile.audio_rate.to_string(),
                "-ac".into(),
                profile.audio_channels.to_string(),
            ]);
        }
        args.extend([
            "-hls_time".into(),
            cfg.hls_time.to_string(),
            "-hls_list_size".into(),
            "0".into(),
            "-hls_playlist_type".into(),
            "vod".into(),
            "-hls_segment_filename".into(),
            out_dir.join(SEGMENT_PATTERN).to_string_lossy().to_string(),
            out_dir.join("index.m3u8").to_string_lossy().to_string(),
        ]);
        args
    }
}
