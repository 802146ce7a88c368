//! Stream utilities

mod sample;

pub use sample::{Sample, SampleExt};
