//! Agentdeck Distribution Layer
//!
//! Real-time event distribution between an agent gateway and dashboard
//! clients: one authenticated upstream WebSocket, a filtered event bus,
//! replayable terminal buffers and a polled tmux screen capture.

pub mod api;
pub mod bus;
pub mod capture;
pub mod config;
pub mod error;
pub mod gateway;
pub mod replay;
