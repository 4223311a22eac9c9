// src/lib.rs
// Export modules so they can be used in tests
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod monitors;
pub mod orchestrator;
