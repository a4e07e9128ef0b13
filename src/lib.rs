//! Publish VM templates to CloudStack zones.
//!
//! The image is staged in a web root, served by a short-lived file server, and
//! registered in every configured zone. A template with the same name is only
//! deleted once its replacement reports ready.

pub mod cloudstack;
pub mod config;
pub mod docker;
pub mod download;
pub mod host;
pub mod publish;
pub mod replace;
pub mod request;
pub mod sidecar;
pub mod watcher;

#[cfg(test)]
mod testing;
