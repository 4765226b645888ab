//! JSON HTTP adapter over the retrieval core.

pub mod routes;
pub mod sessions;

pub use routes::{AppState, api_routes};
pub use sessions::SessionTable;
