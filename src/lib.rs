//! Provisioner - node lifecycle worker for cluster provisioning
//!
//! Tasks such as `create`, `confirm` or `install` arrive as JSON envelopes and
//! are routed by the [`dispatcher`] to a cloud provider plugin or an SSH
//! automator plugin. Each task produces one JSON result.

pub mod automators;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod remote;
pub mod retry;
pub mod signals;
pub mod templates;
pub mod worker;
