pub mod engine;
pub mod pprof_merge;
pub mod state;
pub mod symbolizer;

pub use engine::{ProfileSpec, QueryEngine, Selector};
pub use state::QueryState;
pub use symbolizer::{NoopSymbolizer, Symbolizer};
