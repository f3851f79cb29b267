//! Persistence and outbound HTTP for the listing pipeline.

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub mod http;
pub mod memory;
pub mod pg;
pub mod store;

pub use http::{
    BackoffPolicy, FetchError, FetchStats, FetchedResponse, HttpClientConfig, HttpFetcher,
    HttpRequest, HttpTransport, ReqwestTransport, TransportError,
};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use store::{
    AddressCandidate, GeoHit, ImageRecord, PipelineStore, PropertyWrite, ReconcileWrite,
    SourceRecord, SourceStatusRow, StageOutcome, StageRequest, StageStatus, StoreTotals,
    UngeocodedProperty,
};

pub const CRATE_NAME: &str = "rela-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Checksum of a raw payload. `serde_json` keeps object keys sorted, so equal
/// documents hash equally regardless of upstream key order.
pub fn payload_checksum(payload: &JsonValue) -> String {
    // `Value`'s Display is the compact serde_json encoding and cannot fail.
    sha256_hex(payload.to_string().as_bytes())
}
