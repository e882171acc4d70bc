pub mod api;
pub mod callrecord;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod event;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod history;
pub mod media;
pub mod rooms;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
pub mod version;

pub use error::{Error, Result};
