pub mod autotranscode;
pub mod cache;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod encoder;
pub mod error;
pub mod indexer;
pub mod profile;
pub mod public_id;
pub mod sqlite;
pub mod state;
pub mod storage;

use sha2::{Digest, Sha256};

pub type VideoId = i64;

pub use autotranscode::{select_rungs, AutoTranscoder, ScheduleOutcome};
pub use cache::{
    CacheError, CacheResult, Clock, KeyValueStore, ManualClock, MemoryStore, SharedStore,
    SqliteKvStore, SystemClock,
};
pub use config::{
    load_vodkit_config, CacheBackend, ConfigError, DispatchMode, RungPolicy, VodkitConfig,
};
pub use context::{TranscodeContext, TranscodeContextBuilder};
pub use dispatch::{
    Broker, BrokerError, BulkEnqueueReport, BulkEnqueueRequest, BulkEntry, BulkOutcome,
    EnqueueResult, JobDispatcher, JobHandle, JobOptions, JobQueue, JobRecord, JobReport,
    JobRequest, JobStatus, RetryController, RetryOutcome, RetryPolicy, Sleeper, SqliteBroker,
    TokioSleeper, TranscodeStateHandles, TranscodeWorker,
};
pub use encoder::{
    AudioPresence, CommandExecutor, EncodeProgress, EncodeReport, EncoderExecutor, SourceMeta,
    SystemCommandExecutor,
};
pub use error::{TranscodeError, TranscodeErrorKind, TranscodeResult};
pub use indexer::{
    HealAction, HealReport, HealRequest, IndexError, IndexOutcome, PruneReport,
    RenditionIndexer, RenditionScan, VideoHealReport,
};
pub use profile::{Profile, ProfileCatalog};
pub use public_id::PublicIdResolver;
pub use state::{LockGuard, PendingMarker, StatusResult, StatusTracker, TranscodeLock, TranscodeState};
pub use storage::{
    MediaLayout, NewVideo, RenditionStore, SegmentPayload, SqliteRenditionStore, StoreError,
    StreamRecord, SyncChanges, VideoRecord, VideoScope,
};

/// Lowercase hex sha256, the digest stored with every mirrored segment.
pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
