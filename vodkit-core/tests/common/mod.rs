#![allow(dead_code)]

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use vodkit_core::storage::hls::render_media_playlist;
use vodkit_core::{
    CommandExecutor, DispatchMode, KeyValueStore, RetryController, RetryPolicy, SharedStore,
    Sleeper, TranscodeContext, VideoId, VodkitConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    Present,
    Absent,
    ProbeMissing,
}

/// Stands in for ffmpeg and ffprobe. ffmpeg runs write two segments and a
/// finished playlist where the real encoder would.
#[derive(Debug)]
pub struct FakeEncoder {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    audio: AudioMode,
    failures_left: AtomicUsize,
    failing_runs: Vec<usize>,
    runs: AtomicUsize,
    truncate: bool,
    ffmpeg_missing: bool,
    delay: Duration,
    watch: Mutex<Option<(SharedStore, String)>>,
    snapshots: Mutex<Vec<Option<String>>>,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            audio: AudioMode::Present,
            failures_left: AtomicUsize::new(0),
            failing_runs: Vec::new(),
            runs: AtomicUsize::new(0),
            truncate: false,
            ffmpeg_missing: false,
            delay: Duration::from_millis(5),
            watch: Mutex::new(None),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn with_audio(mut self, audio: AudioMode) -> Self {
        self.audio = audio;
        self
    }

    /// Next `count` ffmpeg runs exit with status 1.
    pub fn failing(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// ffmpeg runs with these 1-based ordinals exit with status 1.
    pub fn failing_runs(mut self, runs: &[usize]) -> Self {
        self.failing_runs = runs.to_vec();
        self
    }

    /// Failed runs leave one segment and an unterminated playlist behind,
    /// like an ffmpeg killed mid-encode.
    pub fn truncating(mut self) -> Self {
        self.truncate = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn without_ffmpeg(mut self) -> Self {
        self.ffmpeg_missing = true;
        self
    }

    /// Records the value of `key` each time ffmpeg starts.
    pub fn watch_key(&self, store: SharedStore, key: impl Into<String>) {
        *self.watch.lock().unwrap() = Some((store, key.into()));
    }

    pub fn snapshots(&self) -> Vec<Option<String>> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn ffmpeg_calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(program, _)| program.ends_with("ffmpeg"))
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn probe_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(program, _)| program.ends_with("ffprobe"))
            .count()
    }

    fn probe(&self) -> io::Result<Output> {
        match self.audio {
            AudioMode::Present => Ok(output(0, "1\n")),
            AudioMode::Absent => Ok(output(0, "")),
            AudioMode::ProbeMissing => Err(io::Error::new(io::ErrorKind::NotFound, "ffprobe")),
        }
    }

    async fn ffmpeg(&self, args: &[String]) -> io::Result<Output> {
        if self.ffmpeg_missing {
            return Err(io::Error::new(io::ErrorKind::NotFound, "ffmpeg"));
        }
        if let Some((store, key)) = self.watch.lock().unwrap().as_ref() {
            let value = store.get(key).unwrap();
            self.snapshots.lock().unwrap().push(value);
        }
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;

        let pattern = args
            .iter()
            .position(|arg| arg == "-hls_segment_filename")
            .map(|index| PathBuf::from(&args[index + 1]))
            .expect("segment pattern");
        let dir = pattern.parent().expect("segment dir").to_path_buf();
        let manifest = PathBuf::from(args.last().expect("manifest path"));
        let label = dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let fails = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
            || self.failing_runs.contains(&run);
        if fails {
            if self.truncate {
                std::fs::write(dir.join("000.ts"), format!("{label}:000.ts"))?;
                std::fs::write(&manifest, TRUNCATED_PLAYLIST)?;
            }
            return Ok(output(1, ""));
        }
        for name in ["000.ts", "001.ts"] {
            std::fs::write(dir.join(name), format!("{label}:{name}"))?;
        }
        std::fs::write(
            &manifest,
            render_media_playlist(&[(4.0, "000.ts"), (4.0, "001.ts")]),
        )?;
        Ok(output(0, ""))
    }
}

#[async_trait]
impl CommandExecutor for FakeEncoder {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        _timeout: Option<Duration>,
    ) -> io::Result<Output> {
        let name = program.to_string_lossy().to_string();
        self.calls.lock().unwrap().push((name.clone(), args.to_vec()));
        if name.ends_with("ffprobe") {
            self.probe()
        } else {
            self.ffmpeg(args).await
        }
    }
}

pub const TRUNCATED_PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:4.0,\n000.ts\n";

fn output(code: i32, stdout: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(code << 8),
        stdout: stdout.as_bytes().to_vec(),
        stderr: if code == 0 {
            Vec::new()
        } else {
            b"Conversion failed!".to_vec()
        },
    }
}

#[derive(Debug, Default)]
pub struct CountingSleeper {
    naps: Mutex<Vec<Duration>>,
}

impl CountingSleeper {
    pub fn count(&self) -> usize {
        self.naps.lock().unwrap().len()
    }
}

#[async_trait]
impl Sleeper for CountingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.naps.lock().unwrap().push(duration);
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub ctx: TranscodeContext,
    pub fake: Arc<FakeEncoder>,
    pub sleeper: Arc<CountingSleeper>,
}

impl Fixture {
    pub fn add_source(&self, video_id: VideoId) -> PathBuf {
        let path = self.ctx.renditions.layout().upload_path(video_id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"fake mp4").unwrap();
        path
    }

    pub fn write_manifest(&self, video_id: VideoId, resolution: &str, body: &str) {
        let path = self.ctx.renditions.layout().manifest_path(video_id, resolution);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    pub fn write_rendition(&self, video_id: VideoId, resolution: &str) {
        let dir = self.ctx.renditions.layout().rendition_dir(video_id, resolution);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("000.ts"), format!("{resolution}:000")).unwrap();
        std::fs::write(dir.join("001.ts"), format!("{resolution}:001")).unwrap();
        self.write_manifest(
            video_id,
            resolution,
            &render_media_playlist(&[(4.0, "000.ts"), (4.0, "001.ts")]),
        );
    }
}

pub fn fixture(mode: DispatchMode, fake: FakeEncoder) -> Fixture {
    fixture_with(mode, fake, |_| {})
}

pub fn fixture_with(
    mode: DispatchMode,
    fake: FakeEncoder,
    adjust: impl FnOnce(&mut VodkitConfig),
) -> Fixture {
    build_fixture(mode, fake, adjust, None)
}

/// Same as `fixture`, over a caller-supplied key-value store.
pub fn fixture_with_store(mode: DispatchMode, fake: FakeEncoder, store: SharedStore) -> Fixture {
    build_fixture(mode, fake, |_| {}, Some(store))
}

fn build_fixture(
    mode: DispatchMode,
    fake: FakeEncoder,
    adjust: impl FnOnce(&mut VodkitConfig),
    store: Option<SharedStore>,
) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = VodkitConfig::with_base_dir(dir.path());
    config.dispatch.mode = mode;
    config.retry.max_attempts = 3;
    config.retry.schedule_seconds = vec![1, 2];
    adjust(&mut config);

    let fake = Arc::new(fake);
    let sleeper = Arc::new(CountingSleeper::default());
    let retry = RetryController::new(RetryPolicy::new(&config.retry)).with_sleeper(sleeper.clone());
    let mut builder = TranscodeContext::builder(config)
        .executor(fake.clone())
        .retry(retry);
    if let Some(store) = store {
        builder = builder.store(store);
    }
    let ctx = builder.build().expect("context");
    Fixture {
        dir,
        ctx,
        fake,
        sleeper,
    }
}
