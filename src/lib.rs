//! Volume and drive queue server for a tape archival facility.
//!
//! Clients queue volume mount requests per drive group; tape servers push
//! drive status; the matching engine pairs requests with free drives and
//! hands committed jobs to the copy-execution service on the drive's host.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod proto;
pub mod scheduler;
pub mod server;
pub mod shutdown;
