mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use common::{
    fixture, fixture_with, fixture_with_store, AudioMode, FakeEncoder, TRUNCATED_PLAYLIST,
};
use futures::future::join_all;
use vodkit_core::dispatch::{BrokerResult, JobOptions};
use vodkit_core::state::keys;
use vodkit_core::{
    Broker, BrokerError, BulkEnqueueRequest, BulkOutcome, DispatchMode, JobHandle, JobQueue,
    JobRecord, JobRequest, JobStatus, KeyValueStore, MemoryStore, NewVideo, ScheduleOutcome,
    SqliteBroker, TranscodeErrorKind, TranscodeState, TranscodeWorker, VideoId,
};
use vodkit_core::cache::CacheResult;

#[tokio::test]
async fn video_42_encodes_both_renditions_and_writes_master() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    fx.add_source(42);
    fx.fake.watch_key(fx.ctx.store.clone(), keys::status(42));
    let dispatcher = &fx.ctx.dispatcher;

    assert_eq!(
        dispatcher.status(42).await.unwrap().state,
        TranscodeState::Unknown
    );

    let result = dispatcher.enqueue(42, &["480p", "720p"]).await.unwrap();
    assert!(!result.accepted);
    assert_eq!(result.state, TranscodeState::Ready);
    assert_eq!(result.encoded, vec!["480p", "720p"]);
    assert_eq!(fx.fake.ffmpeg_calls().len(), 2);

    let seen = fx.fake.snapshots();
    assert!(seen[0].as_deref().unwrap().contains("processing"));
    assert_eq!(
        dispatcher.status(42).await.unwrap().state,
        TranscodeState::Ready
    );
    assert!(!dispatcher.is_locked(42).unwrap());
    assert!(fx.ctx.store.get(&keys::lock(42)).unwrap().is_none());

    let master = std::fs::read_to_string(fx.ctx.renditions.layout().master_path(42)).unwrap();
    assert_eq!(
        master,
        "#EXTM3U\n\
         #EXT-X-STREAM-INF:BANDWIDTH=4000000,RESOLUTION=1280x720\n720p/index.m3u8\n\
         #EXT-X-STREAM-INF:BANDWIDTH=2100000,RESOLUTION=854x480\n480p/index.m3u8\n"
    );
}

#[tokio::test]
async fn video_7_with_lock_is_a_conflict_without_side_effects() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    fx.add_source(7);
    let state = fx.ctx.dispatcher.state();
    assert!(state.lock.acquire(7).unwrap());

    let err = fx.ctx.dispatcher.enqueue(7, &["480p"]).await.unwrap_err();
    assert_eq!(err.kind(), TranscodeErrorKind::Conflict);
    assert_eq!(err.status_code(), 409);
    assert!(fx.fake.ffmpeg_calls().is_empty());
    assert!(fx.ctx.store.get(&keys::status(7)).unwrap().is_none());
    assert!(state.lock.is_locked(7).unwrap());
    assert_eq!(fx.sleeper.count(), 0);
}

#[tokio::test]
async fn concurrent_enqueues_encode_each_rendition_once() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    fx.add_source(5);
    let dispatcher = &fx.ctx.dispatcher;

    let results = join_all((0..4).map(|_| dispatcher.enqueue(5, &["480p", "720p"]))).await;

    let mut encoded = 0;
    for result in results {
        match result {
            Ok(result) => encoded += result.encoded.len(),
            Err(err) => assert_eq!(err.kind(), TranscodeErrorKind::Conflict),
        }
    }
    assert_eq!(encoded, 2);
    assert_eq!(fx.fake.ffmpeg_calls().len(), 2);
    assert!(!dispatcher.is_locked(5).unwrap());
}

#[tokio::test]
async fn existing_renditions_short_circuit() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    fx.write_rendition(9, "480p");
    fx.write_rendition(9, "720p");
    let state = fx.ctx.dispatcher.state();
    assert!(state.pending.mark(9).unwrap());

    let result = fx.ctx.dispatcher.enqueue(9, &["720p", "480p"]).await.unwrap();
    assert_eq!(result.state, TranscodeState::Ready);
    assert!(result.encoded.is_empty());
    assert!(result.message.contains("already exist"));
    assert!(fx.fake.ffmpeg_calls().is_empty());
    assert_eq!(fx.fake.probe_calls(), 0);
    assert!(!state.pending.is_pending(9).unwrap());
    assert_eq!(
        fx.ctx.dispatcher.status(9).await.unwrap().state,
        TranscodeState::Ready
    );
}

#[tokio::test]
async fn stub_manifest_is_reencoded() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    fx.add_source(11);
    fx.write_manifest(11, "480p", "#EXTM3U\n");

    let result = fx.ctx.dispatcher.enqueue(11, &["480p"]).await.unwrap();
    assert_eq!(result.encoded, vec!["480p"]);
    assert_eq!(fx.fake.ffmpeg_calls().len(), 1);
}

#[tokio::test]
async fn unsupported_resolution_fails_without_retry() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    fx.add_source(3);
    let err = fx.ctx.dispatcher.enqueue(3, &["9999p"]).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(err.message(), "Unsupported resolution '9999p'.");
    assert_eq!(fx.sleeper.count(), 0);
    assert!(fx.fake.ffmpeg_calls().is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried_then_recorded() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new().failing(10));
    fx.add_source(4);

    let err = fx.ctx.dispatcher.enqueue(4, &["480p"]).await.unwrap_err();
    assert_eq!(err.kind(), TranscodeErrorKind::Transient);
    assert_eq!(fx.fake.ffmpeg_calls().len(), 3);
    assert_eq!(fx.sleeper.count(), 2);

    let status = fx.ctx.dispatcher.status(4).await.unwrap();
    assert_eq!(status.state, TranscodeState::Failed);
    assert!(status.message.unwrap().contains("ffmpeg exited"));
    assert!(!fx.ctx.dispatcher.is_locked(4).unwrap());
}

#[tokio::test]
async fn a_single_transient_failure_recovers() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new().failing(1));
    fx.add_source(6);

    let result = fx.ctx.dispatcher.enqueue(6, &["480p"]).await.unwrap();
    assert_eq!(result.state, TranscodeState::Ready);
    assert_eq!(fx.sleeper.count(), 1);
}

#[tokio::test]
async fn missing_ffmpeg_is_permanent() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new().without_ffmpeg());
    fx.add_source(8);

    let err = fx.ctx.dispatcher.enqueue(8, &["480p"]).await.unwrap_err();
    assert_eq!(err.kind(), TranscodeErrorKind::Environment);
    assert!(err.is_permanent());
    assert_eq!(fx.sleeper.count(), 0);
    assert_eq!(
        fx.ctx.dispatcher.status(8).await.unwrap().state,
        TranscodeState::Failed
    );
}

#[tokio::test]
async fn missing_source_is_not_found() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    let err = fx.ctx.dispatcher.enqueue(12, &["480p"]).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert_eq!(fx.sleeper.count(), 0);
    assert!(!fx.ctx.dispatcher.is_locked(12).unwrap());
}

#[tokio::test]
async fn unknown_audio_encodes_video_only() {
    let fx = fixture(
        DispatchMode::Inline,
        FakeEncoder::new().with_audio(AudioMode::ProbeMissing),
    );
    fx.add_source(13);
    fx.ctx.dispatcher.enqueue(13, &["360p"]).await.unwrap();
    let calls = fx.fake.ffmpeg_calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].iter().any(|arg| arg == "0:a:0"));
}

#[tokio::test]
async fn stale_pending_marker_is_cleared_inline() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    fx.add_source(14);
    assert!(fx.ctx.dispatcher.state().pending.mark(14).unwrap());

    let result = fx.ctx.dispatcher.enqueue(14, &["480p"]).await.unwrap();
    assert_eq!(result.state, TranscodeState::Ready);
}

#[tokio::test]
async fn forced_rebuild_swaps_renditions() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    fx.add_source(15);
    fx.write_rendition(15, "480p");

    let result = fx.ctx.dispatcher.rebuild(15, &["480p"]).await.unwrap();
    assert_eq!(result.encoded, vec!["480p"]);
    let layout = fx.ctx.renditions.layout();
    assert!(!layout.staging_dir(15, "480p").exists());
    let segment = std::fs::read_to_string(layout.rendition_dir(15, "480p").join("000.ts")).unwrap();
    assert_eq!(segment, ".480p.staging:000.ts");
}

#[tokio::test]
async fn broker_mode_queues_and_worker_drains() {
    let fx = fixture(DispatchMode::Broker, FakeEncoder::new());
    fx.add_source(20);
    let dispatcher = &fx.ctx.dispatcher;

    let queued = dispatcher.enqueue(20, &["480p"]).await.unwrap();
    assert!(queued.accepted);
    assert_eq!(queued.queue.as_deref(), Some("transcode"));
    let job_id = queued.job_id.clone().unwrap();
    assert!(dispatcher.state().pending.is_pending(20).unwrap());
    assert!(fx.fake.ffmpeg_calls().is_empty());

    let again = dispatcher.enqueue(20, &["480p"]).await.unwrap_err();
    assert_eq!(again.kind(), TranscodeErrorKind::Conflict);

    let worker = fx.ctx.worker().unwrap();
    let report = worker.run_once().await.unwrap().unwrap();
    assert!(report.succeeded);
    assert_eq!(report.job_id, job_id);
    assert!(worker.run_once().await.unwrap().is_none());

    let broker = fx.ctx.broker.as_ref().unwrap();
    assert_eq!(broker.get(&job_id).unwrap().unwrap().status, JobStatus::Finished);
    assert!(!dispatcher.state().pending.is_pending(20).unwrap());
    assert_eq!(
        dispatcher.status(20).await.unwrap().state,
        TranscodeState::Ready
    );
    assert_eq!(fx.fake.ffmpeg_calls().len(), 1);
}

#[tokio::test]
async fn worker_records_failed_jobs() {
    let fx = fixture_with(DispatchMode::Broker, FakeEncoder::new().failing(10), |config| {
        config.retry.max_attempts = 2;
    });
    fx.add_source(21);
    let queued = fx.ctx.dispatcher.enqueue(21, &["480p"]).await.unwrap();

    let worker = fx.ctx.worker().unwrap();
    let report = worker.run_once().await.unwrap().unwrap();
    assert!(!report.succeeded);
    let job = fx
        .ctx
        .broker
        .as_ref()
        .unwrap()
        .get(&queued.job_id.unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(fx.fake.ffmpeg_calls().len(), 2);
    assert_eq!(fx.sleeper.count(), 1);
}

#[derive(Debug)]
struct UnreachableBroker;

impl Broker for UnreachableBroker {
    fn enqueue(&self, _request: &JobRequest, _options: &JobOptions) -> BrokerResult<JobHandle> {
        Err(BrokerError::MissingStore)
    }

    fn has_active_job(&self, _video_id: VideoId) -> BrokerResult<bool> {
        Err(BrokerError::MissingStore)
    }

    fn ping(&self) -> BrokerResult<()> {
        Err(BrokerError::MissingStore)
    }
}

#[tokio::test]
async fn unreachable_broker_falls_back_inline() {
    let fx = fixture(DispatchMode::Broker, FakeEncoder::new());
    fx.add_source(22);
    let dispatcher = fx
        .ctx
        .dispatcher
        .as_ref()
        .clone()
        .with_broker(Arc::new(UnreachableBroker));

    let result = dispatcher.enqueue(22, &["480p"]).await.unwrap();
    assert!(!result.accepted);
    assert_eq!(result.mode, DispatchMode::Inline);
    assert_eq!(result.state, TranscodeState::Ready);
    assert!(!dispatcher.state().pending.is_pending(22).unwrap());
    assert_eq!(fx.fake.ffmpeg_calls().len(), 1);
}

#[tokio::test]
async fn broker_errors_keep_pending_marker() {
    let fx = fixture(DispatchMode::Broker, FakeEncoder::new());
    fx.add_source(23);
    let dispatcher = fx
        .ctx
        .dispatcher
        .as_ref()
        .clone()
        .with_broker(Arc::new(UnreachableBroker));
    assert!(dispatcher.state().pending.mark(23).unwrap());

    let err = dispatcher.enqueue(23, &["480p"]).await.unwrap_err();
    assert_eq!(err.kind(), TranscodeErrorKind::Conflict);
    assert!(dispatcher.state().pending.is_pending(23).unwrap());
}

#[tokio::test]
async fn autotranscode_debounces_and_skips_present_renditions() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    let auto = &fx.ctx.autotranscoder;
    assert!(matches!(
        auto.schedule_default_renditions(30, false).await,
        ScheduleOutcome::SourceMissing
    ));

    fx.add_source(30);
    fx.write_rendition(30, "1080p");
    match auto.schedule_default_renditions(30, false).await {
        ScheduleOutcome::Scheduled { resolutions, result } => {
            assert_eq!(resolutions, vec!["720p", "480p"]);
            assert_eq!(result.state, TranscodeState::Ready);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(matches!(
        auto.schedule_default_renditions(30, false).await,
        ScheduleOutcome::Debounced
    ));
    assert!(matches!(
        auto.schedule_default_renditions(30, true).await,
        ScheduleOutcome::NothingMissing
    ));
    assert!(fx.ctx.store.get(&keys::autotranscode(30)).unwrap().is_none());
}

#[tokio::test]
async fn interrupted_encode_never_publishes_a_partial_playlist() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new().failing(1).truncating());
    fx.add_source(16);

    let result = fx.ctx.dispatcher.enqueue(16, &["480p"]).await.unwrap();
    assert_eq!(result.encoded, vec!["480p"]);
    assert_eq!(fx.fake.ffmpeg_calls().len(), 2);
    assert_eq!(fx.sleeper.count(), 1);

    let layout = fx.ctx.renditions.layout();
    let manifest = std::fs::read_to_string(layout.manifest_path(16, "480p")).unwrap();
    assert!(manifest.contains("#EXT-X-ENDLIST"));
    assert!(manifest.contains("001.ts"));
    assert!(!layout.staging_dir(16, "480p").exists());
}

#[tokio::test]
async fn exhausted_encode_leaves_no_playlist_behind() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new().failing(10).truncating());
    fx.add_source(17);

    let err = fx.ctx.dispatcher.enqueue(17, &["480p"]).await.unwrap_err();
    assert_eq!(err.kind(), TranscodeErrorKind::Transient);
    let layout = fx.ctx.renditions.layout();
    assert!(!layout.manifest_path(17, "480p").exists());
    assert!(!layout.staging_dir(17, "480p").exists());
    assert!(!fx.ctx.renditions.manifest_ready(17, "480p").await);
    assert_eq!(
        fx.ctx.dispatcher.status(17).await.unwrap().state,
        TranscodeState::Failed
    );
}

#[tokio::test]
async fn unterminated_playlist_on_disk_is_reencoded() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    fx.add_source(18);
    fx.write_manifest(18, "480p", TRUNCATED_PLAYLIST);
    assert!(!fx.ctx.renditions.manifest_ready(18, "480p").await);

    let result = fx.ctx.dispatcher.enqueue(18, &["480p"]).await.unwrap();
    assert_eq!(result.encoded, vec!["480p"]);
    assert_eq!(fx.fake.ffmpeg_calls().len(), 1);
    assert!(fx.ctx.renditions.manifest_ready(18, "480p").await);
}

#[tokio::test]
async fn inline_run_is_bounded_by_the_lock_ttl() {
    let fx = fixture_with(
        DispatchMode::Inline,
        FakeEncoder::new().with_delay(Duration::from_millis(1500)),
        |config| config.transcode.lock_ttl_seconds = 1,
    );
    fx.add_source(19);

    let err = fx.ctx.dispatcher.enqueue(19, &["480p"]).await.unwrap_err();
    assert_eq!(err.kind(), TranscodeErrorKind::Transient);
    assert!(err.message().contains("lock ttl"));
    assert_eq!(fx.sleeper.count(), 0);
    assert!(!fx.ctx.dispatcher.is_locked(19).unwrap());
    let status = fx.ctx.dispatcher.status(19).await.unwrap();
    assert_eq!(status.state, TranscodeState::Failed);
    assert!(!fx.ctx.renditions.manifest_ready(19, "480p").await);
}

fn ffmpeg_runs_for(calls: &[Vec<String>], label: &str) -> usize {
    let dir = format!(".{label}.staging");
    calls
        .iter()
        .filter(|args| args.last().is_some_and(|manifest| manifest.contains(&dir)))
        .count()
}

#[tokio::test]
async fn rebuild_retry_keeps_renditions_already_committed() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new().failing_runs(&[2]));
    fx.add_source(24);
    fx.write_rendition(24, "480p");
    fx.write_rendition(24, "720p");

    let result = fx.ctx.dispatcher.rebuild(24, &["480p", "720p"]).await.unwrap();
    assert_eq!(result.encoded, vec!["480p", "720p"]);
    assert_eq!(fx.sleeper.count(), 1);
    let calls = fx.fake.ffmpeg_calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(ffmpeg_runs_for(&calls, "480p"), 1);
    assert_eq!(ffmpeg_runs_for(&calls, "720p"), 2);

    let layout = fx.ctx.renditions.layout();
    for label in ["480p", "720p"] {
        let segment =
            std::fs::read_to_string(layout.rendition_dir(24, label).join("001.ts")).unwrap();
        assert_eq!(segment, format!(".{label}.staging:001.ts"));
    }
}

/// Delegates to a real queue but fails the first claim and the first
/// completion, as a briefly locked database would.
#[derive(Debug)]
struct FlakyQueue {
    inner: Arc<SqliteBroker>,
    claim_failed: AtomicBool,
    complete_failed: AtomicBool,
}

impl FlakyQueue {
    fn new(inner: Arc<SqliteBroker>) -> Self {
        Self {
            inner,
            claim_failed: AtomicBool::new(false),
            complete_failed: AtomicBool::new(false),
        }
    }
}

impl JobQueue for FlakyQueue {
    fn claim_next(&self, queue: &str) -> BrokerResult<Option<JobRecord>> {
        if !self.claim_failed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::MissingStore);
        }
        JobQueue::claim_next(self.inner.as_ref(), queue)
    }

    fn complete(&self, id: &str) -> BrokerResult<()> {
        if !self.complete_failed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::MissingStore);
        }
        JobQueue::complete(self.inner.as_ref(), id)
    }

    fn fail(&self, id: &str, error: &str) -> BrokerResult<()> {
        JobQueue::fail(self.inner.as_ref(), id, error)
    }

    fn cleanup_finished(&self) -> BrokerResult<usize> {
        JobQueue::cleanup_finished(self.inner.as_ref())
    }
}

#[tokio::test]
async fn worker_keeps_polling_through_queue_errors() {
    let fx = fixture(DispatchMode::Broker, FakeEncoder::new());
    fx.add_source(25);
    let queued = fx.ctx.dispatcher.enqueue(25, &["480p"]).await.unwrap();
    let job_id = queued.job_id.unwrap();
    let broker = Arc::clone(fx.ctx.broker.as_ref().unwrap());

    let worker = TranscodeWorker::new(
        Arc::new(FlakyQueue::new(Arc::clone(&broker))),
        Arc::clone(&fx.ctx.dispatcher),
        "transcode",
    );
    let stopped = tokio::time::timeout(
        Duration::from_millis(1500),
        worker.run(false, Duration::from_millis(20)),
    )
    .await;
    assert!(stopped.is_err(), "worker exited instead of polling");

    assert_eq!(broker.get(&job_id).unwrap().unwrap().status, JobStatus::Finished);
    assert_eq!(fx.fake.ffmpeg_calls().len(), 1);
    assert_eq!(
        fx.ctx.dispatcher.status(25).await.unwrap().state,
        TranscodeState::Ready
    );
}

#[tokio::test]
async fn burst_worker_surfaces_queue_errors() {
    let fx = fixture(DispatchMode::Broker, FakeEncoder::new());
    let broker = Arc::clone(fx.ctx.broker.as_ref().unwrap());
    let worker = TranscodeWorker::new(
        Arc::new(FlakyQueue::new(broker)),
        Arc::clone(&fx.ctx.dispatcher),
        "transcode",
    );

    assert!(worker.run(true, Duration::from_millis(20)).await.is_err());
    assert!(worker.run(true, Duration::from_millis(20)).await.unwrap().is_empty());
}

fn register_video(fx: &common::Fixture, title: &str) -> VideoId {
    fx.ctx
        .database
        .create_video(&NewVideo {
            title: title.to_string(),
            is_published: true,
            ..NewVideo::default()
        })
        .unwrap()
}

#[tokio::test]
async fn bulk_dry_run_plans_only_missing_renditions() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    let partial = register_video(&fx, "partial");
    let complete = register_video(&fx, "complete");
    let bare = register_video(&fx, "bare");
    for id in [partial, complete] {
        fx.add_source(id);
        fx.write_rendition(id, "480p");
    }
    fx.write_rendition(complete, "720p");

    let report = fx
        .ctx
        .dispatcher
        .enqueue_missing(&BulkEnqueueRequest {
            videos: vec![partial, complete, bare, 9000, partial],
            resolutions: vec!["480p".to_string(), "720p".to_string()],
            dry_run: true,
            force: false,
        })
        .await
        .unwrap();

    assert!(report.dry_run);
    let ids: Vec<_> = report.entries.iter().map(|entry| entry.video_id).collect();
    assert_eq!(ids, vec![partial, complete, bare, 9000]);
    assert!(matches!(
        &report.entries[0].outcome,
        BulkOutcome::Planned { resolutions } if resolutions == &vec!["720p".to_string()]
    ));
    assert!(matches!(report.entries[1].outcome, BulkOutcome::Present));
    assert!(matches!(report.entries[2].outcome, BulkOutcome::SourceMissing));
    assert!(matches!(report.entries[3].outcome, BulkOutcome::UnknownVideo));
    assert_eq!(report.queued(), 0);
    assert!(fx.fake.ffmpeg_calls().is_empty());
    assert_eq!(fx.fake.probe_calls(), 0);
}

#[tokio::test]
async fn bulk_enqueue_requests_missing_and_force_rebuilds() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    let id = register_video(&fx, "clip");
    fx.add_source(id);
    fx.write_rendition(id, "480p");
    let mut request = BulkEnqueueRequest {
        videos: vec![id],
        resolutions: vec!["480p".to_string(), "720p".to_string()],
        ..BulkEnqueueRequest::default()
    };

    let report = fx.ctx.dispatcher.enqueue_missing(&request).await.unwrap();
    match &report.entries[0].outcome {
        BulkOutcome::Queued { resolutions, result } => {
            assert_eq!(resolutions, &vec!["720p".to_string()]);
            assert_eq!(result.state, TranscodeState::Ready);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fx.fake.ffmpeg_calls().len(), 1);

    request.force = true;
    let forced = fx.ctx.dispatcher.enqueue_missing(&request).await.unwrap();
    match &forced.entries[0].outcome {
        BulkOutcome::Queued { resolutions, result } => {
            assert_eq!(resolutions.len(), 2);
            assert_eq!(result.encoded, vec!["480p", "720p"]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fx.fake.ffmpeg_calls().len(), 3);
}

#[tokio::test]
async fn bulk_enqueue_rejects_unknown_labels_up_front() {
    let fx = fixture(DispatchMode::Inline, FakeEncoder::new());
    let err = fx
        .ctx
        .dispatcher
        .enqueue_missing(&BulkEnqueueRequest {
            videos: vec![1],
            resolutions: vec!["9999p".to_string()],
            ..BulkEnqueueRequest::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
}

/// Counts store calls made on the thread that drives the runtime.
#[derive(Debug)]
struct ThreadCheckedStore {
    inner: MemoryStore,
    runtime_thread: ThreadId,
    calls: AtomicUsize,
    on_runtime: AtomicUsize,
}

impl ThreadCheckedStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            runtime_thread: thread::current().id(),
            calls: AtomicUsize::new(0),
            on_runtime: AtomicUsize::new(0),
        }
    }

    fn note(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if thread::current().id() == self.runtime_thread {
            self.on_runtime.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl KeyValueStore for ThreadCheckedStore {
    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.note();
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.note();
        self.inner.set(key, value, ttl)
    }

    fn add(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        self.note();
        self.inner.add(key, value, ttl)
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.note();
        self.inner.delete(key)
    }
}

#[tokio::test(flavor = "current_thread")]
async fn dispatcher_keeps_store_calls_off_the_runtime_thread() {
    let store = Arc::new(ThreadCheckedStore::new());
    let fx = fixture_with_store(DispatchMode::Inline, FakeEncoder::new(), store.clone());
    fx.add_source(26);

    let result = fx.ctx.dispatcher.enqueue(26, &["480p"]).await.unwrap();
    assert_eq!(result.state, TranscodeState::Ready);
    assert_eq!(
        fx.ctx.dispatcher.status(26).await.unwrap().state,
        TranscodeState::Ready
    );
    let again = fx.ctx.dispatcher.enqueue(26, &["480p"]).await.unwrap();
    assert!(again.encoded.is_empty());

    assert!(store.calls.load(Ordering::SeqCst) > 0);
    assert_eq!(store.on_runtime.load(Ordering::SeqCst), 0);
    assert!(store.inner.get(&keys::lock(26)).unwrap().is_none());
}
