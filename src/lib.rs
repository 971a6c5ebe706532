//! Secure execution and terminal session service.
//!
//! Runs commands and stored scripts locally or over SSH with pinned host
//! keys, keeps secrets encrypted at rest, serves interactive terminal tabs
//! and records an encrypted execution history.

pub mod askpass;
pub mod configuration;
pub mod context;
pub mod controller;
pub mod crypto;
pub mod error_handling;
pub mod execution;
pub mod recording;
pub mod secrets;
pub mod session_management;
pub mod storage;
pub mod transport;
pub mod web_interface;
