#![recursion_limit = "256"]

pub mod checkpoint;
pub mod data;
pub mod error;
pub mod ledger;
pub mod losses;
pub mod model;
pub mod options;
pub mod training;
pub mod utils;
pub mod visualize;

pub use error::GanError;
