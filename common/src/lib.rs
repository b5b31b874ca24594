pub mod error;
pub mod labels;
pub mod metrics;

pub use error::{Error, Result};
pub use labels::{Label, Labels};
