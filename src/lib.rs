//! tether - relay server for remote-control sessions.
//!
//! Connects remote-control "controllers" (phones, browsers) to registered
//! "hosts" (desktop agents) over persistent WebSocket streams. A host
//! registers under a shared-secret password; any number of controllers
//! attach by presenting the same password. The relay forwards commands,
//! results, screen snapshots, filesystem events, and chunked file uploads
//! between the two sides while enforcing lockout, session lifetimes, and
//! trusted-device auto-login.

pub mod api;
pub mod auth;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transfer;
pub mod wol;
