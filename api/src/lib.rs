pub mod error;
pub mod routes;
pub mod selector;
pub mod state;

pub use routes::router;
pub use state::ApiState;
