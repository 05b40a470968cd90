//! Zonebot Gateway
//!
//! The HTTP surface of a bot instance: the `/ping` liveness probe hit by
//! peers and by our own keep-alive loop, and the `/api/release-user`
//! endpoint that peer instances call during a release fan-out.

pub mod keepalive;
pub mod routes;
pub mod server;

pub use server::{serve, AppState};
