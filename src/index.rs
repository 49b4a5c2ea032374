//! Partition index model.
//!
//! Segments, versions and the partition data built from them, plus the
//! readers, modifiers and directories that operate on that data.

pub mod deletion;
pub mod directory;
pub mod document;
pub mod dump;
pub mod modifier;
pub mod partition_data;
pub mod patch;
pub mod reader;
pub mod segment;
pub mod version;

pub use directory::{Directory, FileDirectory, MemoryDirectory};
pub use document::{Document, StoredDoc};
pub use dump::DumpContainer;
pub use modifier::{ModifyMode, PartitionModifier};
pub use partition_data::PartitionData;
pub use reader::{PartitionReader, ReaderContainer};
pub use segment::{BuildingSegment, BuiltSegment, SegmentData, SegmentId, SegmentInfo};
pub use version::{Version, VersionId};
