//! Serialization helpers.

pub mod files;
