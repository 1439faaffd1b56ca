//! Immich Auto-Tagger
//!
//! This library provides the core functionality for the immich-autotag
//! service, which pulls untagged assets from an Immich server, classifies
//! them with an AI tagging model, and writes the resulting tags back.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
