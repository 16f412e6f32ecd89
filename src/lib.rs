//! divvy: an ingress controller that registers Ingress backends as workers
//! and a per-host round-robin HTTP load balancer that serves them.

pub mod balancer;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod forwarder;
pub mod ingress;
pub mod kube_source;
pub mod registration;
pub mod server;
pub mod shutdown;
pub mod status;
pub mod utils;
pub use utils::metrics;
