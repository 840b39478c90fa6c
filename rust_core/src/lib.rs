pub mod config;
pub mod data;
pub mod diagnostics;
pub mod distributions;
pub mod error;
pub mod experiment;
pub mod kernel;
pub mod model;
pub mod nuts;
pub mod posterior;
pub mod progress;
pub mod report;
pub mod sampler;

pub use error::{Result, SlogError};
