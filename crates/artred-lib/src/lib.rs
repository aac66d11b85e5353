//! Packed short-read store, sparse suffix index and the multi-threaded
//! duplicate / non-overlap artefact reduction passes built on top of them.

pub mod checkpoint;
pub mod cli;
pub mod collab;
pub mod concurrency;
pub mod dedup;
pub mod error;
pub mod export;
pub mod index;
pub mod io;
pub mod lifecycle;
pub mod overlap;
pub mod packed;
pub mod reads;

pub use error::{ArtredError, Result};
