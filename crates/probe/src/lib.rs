//! Reachability probes used to verify that a mapped domain routes to this platform.

pub mod http;

pub use http::{HttpProbe, Probe, ProbeError, VERIFY_PATH};
