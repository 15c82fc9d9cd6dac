//! Publishing tiles and sidecar files to object storage.

mod headers;
mod metrics;
mod publisher;

pub use headers::ObjectHeaders;
pub use metrics::{MetricsReporter, UploadMetrics, UploadSnapshot};
pub use publisher::{
    object_key, plan_uploads, PublishOutcome, PublishReport, Publisher, UploadFailure, UploadTask,
    TILES_KEY,
};
