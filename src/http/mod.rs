//! Read-only status endpoint

mod routes;

pub use routes::{build_router, AppError};
