pub mod fastx;

pub use fastx::{FastxReader, FastxRecord, FileReader};
