//! Getting an encode to run: inline or through the job queue, with retries.

mod broker;
mod bulk;
mod dispatcher;
mod retry;
mod worker;

pub use broker::{
    Broker, BrokerError, BrokerResult, JobHandle, JobOptions, JobQueue, JobRecord, JobRequest,
    JobStatus, SqliteBroker, SqliteBrokerBuilder,
};
pub use bulk::{BulkEnqueueReport, BulkEnqueueRequest, BulkEntry, BulkOutcome};
pub use dispatcher::{EnqueueResult, JobDispatcher, TranscodeStateHandles};
pub use retry::{RetryController, RetryOutcome, RetryPolicy, Sleeper, TokioSleeper};
pub use worker::{JobReport, TranscodeWorker};
