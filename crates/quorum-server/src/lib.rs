pub mod api;
pub mod handlers;
pub mod server;

pub use api::ApiError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
