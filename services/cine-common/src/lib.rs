//! Cine Common - Shared configuration, errors, and logging for cinebot.
//!
//! This crate provides:
//! - Configuration types and loading (JSON file + environment overrides)
//! - Error types and handling utilities
//! - Logging setup and structured logging helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    Config, ContextConfig, CredentialStatus, ObservabilityConfig, OpenAiConfig, ServerConfig,
    SlackConfig, TrimPolicyKind,
};
pub use error::{Error, Result};
