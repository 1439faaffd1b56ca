pub mod asset;
pub mod outcome;

pub use asset::{Asset, AssetKind, BulkTagRequest, CreateTagRequest, Tag, TagPrediction, UserInfo};
pub use outcome::{AssetOutcome, AssetReport, BatchStats, LibraryProgress, ProgressCounters};
