//! The two activities of the ingestion workflow.
//!
//! - `ExtractMetadata`: [`TriggerInput`] -> [`FileMetadata`]
//! - `StoreMetadata`: [`FileMetadata`] -> `null`, idempotent

use std::sync::Arc;

pub mod blob;
pub mod extract;
pub mod store;

pub use blob::{BlobError, BlobSource, FsBlobSource, InMemoryBlobSource};
pub use extract::{extract_metadata, select_extractor, DimensionExtractor, Dimensions, RasterExtractor, VectorExtractor};
pub use store::{InMemoryMetadataSink, MetadataSink, SqliteMetadataSink};

use crate::runtime::activity::ActivityRegistryBuilder;
use crate::{FileMetadata, TriggerInput, EXTRACT_METADATA_ACTIVITY, STORE_METADATA_ACTIVITY};

/// Register `ExtractMetadata` and `StoreMetadata` backed by `blobs` and `sink`.
pub fn register_metadata_activities(
    builder: ActivityRegistryBuilder,
    blobs: Arc<dyn BlobSource>,
    sink: Arc<dyn MetadataSink>,
) -> ActivityRegistryBuilder {
    builder
        .register_typed(EXTRACT_METADATA_ACTIVITY, move |input: TriggerInput| {
            let blobs = blobs.clone();
            async move { extract_metadata(blobs.as_ref(), &input).await }
        })
        .register_typed(STORE_METADATA_ACTIVITY, move |metadata: FileMetadata| {
            let sink = sink.clone();
            async move { sink.store(&metadata).await }
        })
}
