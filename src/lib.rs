pub mod archive;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod group_merger;
pub mod grouper;
pub mod id_reader;
pub mod pipeline;
pub mod store;
pub mod worker_pool;

pub use error::*;
pub use event::{EventRecord, IdentifierSet};
pub use pipeline::{Pipeline, RunSummary};
pub use store::{ArchiveHandle, ArchiveStore};
