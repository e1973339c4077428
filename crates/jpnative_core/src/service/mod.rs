//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate manifest, build, binding and registry calls into one load API.
//! - Keep interpreter-facing callers decoupled from toolchain details.

pub mod load_service;
