//! Axum gateway for Hephaestus: REST submission endpoints, task snapshots,
//! and SSE progress streams over the shared service facade.

mod api;

pub use api::{build_router, AppState, ServiceState};
