pub mod service;

pub use service::{pb, StoreService};
