//! Common utilities and types shared across Classroom Live components.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for access-token utilities (validation, claims, constants)
pub mod jwt;
