//! Shared numeric helpers.

pub mod decimal;
