//! stockpilot - structured completion pipeline
//!
//! Normalizes several language-model vendor protocols behind one provider
//! contract, runs a tool-calling agent turn on top of it, keeps outbound calls
//! inside a shared per-minute budget and recovers structured data from
//! free-form model output.

pub mod agent;
pub mod config;
pub mod extract;
pub mod providers;
pub mod ratelimit;
pub mod utils;
