pub mod column;
pub mod convert;
pub mod executor;
pub mod metadata;
pub mod queue;
pub mod segment_store;
pub mod store;
pub mod task;
pub mod worker;

pub use column::{ColumnStore, ColumnValues, DataType};
pub use convert::{ConversionOutcome, ConvertError, ConvertToRawIndexExecutor};
pub use executor::{ExecutorRegistry, TaskExecutor};
pub use metadata::{
    ColumnMetadata, SegmentMetadata, SegmentName, TableName, OPTIMIZATION_RAW_INDEX,
};
pub use queue::*;
pub use segment_store::{SegmentError, SegmentHandle, SegmentStore, StagedSegment};
pub use store::{
    record_optimization, CasOutcome, InMemoryMetadataStore, MetadataStore, StoreError, Versioned,
};
pub use task::*;
pub use worker::*;
