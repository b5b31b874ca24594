pub mod engine;
pub mod key;

pub use engine::{ProfileStore, RocksStore, VisitResult};
pub use key::{ProfileKey, RangeKey};
