//! Export Archiver
//!
//! Reconciles video exports produced by a frigate-style NVR with an S3
//! Glacier Instant Retrieval bucket. The service periodically asks the
//! recorder to materialize the trailing 10-minute window for each camera,
//! uploads finished exports under a deterministic key layout, deletes the
//! source records once uploads are verified, and re-submits exports that
//! stall mid-processing.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌────────────────┐  GET/POST/DELETE  ┌──────────────┐
//!  minute-grid    │ Reconciler     │──────────────────▶│ Recorder API │
//!  scheduler ────▶│  - request     │                   └──────────────┘
//!  (3 cadences)   │  - upload      │  upload + verify  ┌──────────────┐
//!                 │  - stuck       │──────────────────▶│ S3 (Glacier  │
//!                 └────────────────┘                   │  IR class)   │
//!                        │ read                        └──────────────┘
//!                        ▼
//!                 /media/frigate/exports
//! ```
//!
//! Each cycle is a bounded, self-contained pass over the recorder's
//! current export list; nothing survives in memory between passes. A
//! source record is deleted only after its artifact's upload has been
//! verified with a read-back, or after the stuck-recovery cycle has
//! successfully re-submitted its window.

pub mod config;
pub mod connectivity;
pub mod reconciler;
pub mod recorder_client;
pub mod retry;
pub mod s3_archiver;
pub mod scheduler;
pub mod storage_key;
pub mod time_window;

pub use config::Config;
pub use connectivity::{ConnectivityCheck, TcpProbe};
pub use reconciler::{Reconciler, STUCK_THRESHOLD_SECS};
pub use recorder_client::{ExportApi, ExportRecord, RecorderClient, RecorderError};
pub use retry::{with_retry, RetryPolicy};
pub use s3_archiver::{ObjectStore, S3Archiver, UploadError};
pub use scheduler::{run_cycle, Schedule};
pub use storage_key::{parse_time_range, storage_key, MappingError};
pub use time_window::{TimeWindow, TimeWindower};
