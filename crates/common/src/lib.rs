//! Common types shared across Huddle Mesh components.

#![warn(clippy::pedantic)]

/// Module for membership and signaling data types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
