//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own the edit pipeline, fan-out and persistence so route
//! handlers can stay focused on protocol translation.

pub mod broadcast;
pub mod maintenance;
pub mod persistence;
pub mod pixel;
