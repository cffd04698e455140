//! Chunked uploads for panelfs.
//!
//! The server half, [`ChunkStore`], keeps per-session chunk files and
//! assembles them in order once every chunk has arrived. The client half,
//! [`ChunkUploader`], splits local files into fixed-size chunks and sends
//! them through an [`UploadTransport`] with bounded concurrency, retries and
//! progress reporting.

mod error;
mod progress;
mod protocol;
mod retry;
mod session;
mod store;
mod transport;
mod uploader;

pub use error::{Result, UploadError};
pub use progress::{ProgressCallback, RetryInfo, UploadPhase, UploadProgress};
pub use protocol::{
    BeginUpload, ConflictCheckRequest, FinalizeRequest, FinalizeResponse, SessionInfo,
    UploadStatus, CHUNK_CHECKSUM_HEADER, SKIP_CHECKSUM,
};
pub use retry::RetryPolicy;
pub use session::{chunk_count, chunk_span, ChunkSession, ChunkState, ChunkStatus, MAX_CHUNKS};
pub use store::ChunkStore;
pub use transport::{HttpTransport, LocalTransport, UploadTransport};
pub use uploader::{ChunkUploader, FileOutcome};
