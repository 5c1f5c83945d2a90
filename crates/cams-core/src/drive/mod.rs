//! Google adapters
//!
//! `DriveStore` implements the remote store over the Drive v3 API and
//! `GoogleIdentity` implements the identity provider over Google OAuth.

pub mod identity;
pub mod store;

pub use identity::{DeviceCode, DevicePrompt, GoogleEndpoints, GoogleIdentity, SCOPES};
pub use store::{DriveStore, DRIVE_API_BASE};
