//! Picam Image Receiver
//!
//! Accepts persistent TCP connections from remote cameras, decodes the
//! length-prefixed protobuf images they stream, and archives each valid image
//! with its capture metadata either in PostgreSQL or in a day-bucketed
//! directory tree held under a size quota.
//!
//! ## Architecture
//!
//! ```text
//! Camera ──TCP──▶ Listener ──spawn──▶ ConnectionSupervisor (one task per connection)
//!                                          │
//!                                          ▼
//!                                    FrameReader ──▶ validate ──▶ dyn ImageStore
//!                                                                   │        │
//!                                                          PostgresStore   FilesystemArchive
//!                                                                                │ writes
//!                                                                                ▼
//!                                                                        RetentionManager
//!                                                                     (evicts oldest buckets)
//! ```
//!
//! Failures are contained: a bad frame or a failed write drops one image, a
//! transport failure ends one connection, and only configuration or bootstrap
//! errors stop the process.

pub mod config;
pub mod frame_codec;
pub mod listener;
pub mod message;
pub mod retention;
pub mod store;
pub mod supervisor;
pub mod validator;

pub use config::{BackendKind, ReceiverConfig};
pub use frame_codec::{encode_frame, FrameError, FrameReader};
pub use listener::{Listener, ServeSummary};
pub use message::{ImageMessage, ImageMetadata};
pub use retention::{
    enforce_quota, parse_max_size, usage, EvictionReport, RetentionError, RetentionManager,
    RetentionTrigger,
};
pub use store::{FilesystemArchive, ImageStore, PostgresStore, StoreError, StoredImage};
pub use supervisor::{ConnectionOutcome, ConnectionReport, ConnectionStats, ConnectionSupervisor};
pub use validator::{validate, CapturedImage, Rejection};
