//! HTTP transport for MarketSnap: SSE event streaming with replay, batch
//! control signals, and health. Orchestration lives in `marketsnap-app`;
//! this crate only exposes it.

mod server;

pub use server::{AppState, ServerError, build_api_router, serve};
