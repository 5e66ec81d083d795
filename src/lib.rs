//! tvk-preflight: checks a Kubernetes cluster is ready for TrilioVault for
//! Kubernetes, and removes what those checks leave behind.

pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod error;
pub mod exec;
pub mod helpers;
pub mod preflight;
pub mod provision;
pub mod resources;
pub mod wait;
