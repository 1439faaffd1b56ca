pub mod classifier;
pub mod failure_tracker;
pub mod immich;
pub mod orchestrator;
pub mod processor;
pub mod scheduler;
pub mod tag_cache;
