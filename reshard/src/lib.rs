#![forbid(unsafe_code)]

mod backfill;
mod config;
mod coordinate;
mod error;
mod migrate;
mod router;
mod shard_map;

pub use backfill::*;
pub use config::*;
pub use coordinate::*;
pub use error::*;
pub use migrate::*;
pub use router::*;
pub use shard_map::*;
