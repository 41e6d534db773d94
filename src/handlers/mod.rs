pub mod transcriptions;

pub use transcriptions::*;
