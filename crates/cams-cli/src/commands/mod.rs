//! Command handlers

pub mod config;
pub mod record;
pub mod status;
pub mod sync;
pub mod transfer;
