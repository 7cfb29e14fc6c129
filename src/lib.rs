//! MySQL Backup Engine Library
//!
//! Drives `mysqldump` per database, streams its output through an
//! optional compression and encryption pipeline with inline checksums,
//! and records a JSON manifest beside every artifact.

pub mod config;
pub mod dump;
pub mod engine;
pub mod meta;
pub mod pipeline;
pub mod shutdown;
pub mod utils;

// Re-export commonly used types
pub use config::BackupOptions;
pub use engine::{BackupEngine, BackupLoopResult};
pub use utils::errors::EngineError;
pub use utils::errors::Result;
