#![forbid(unsafe_code)]

mod checkpoint;
mod engine;
mod error;
mod row;

pub use checkpoint::*;
pub use engine::*;
pub use error::*;
pub use row::*;
