pub mod client;
pub mod config;
pub mod histogram;
pub mod latency;
pub mod report;
pub mod request;
pub mod response;
pub mod stats;
pub mod transport;

pub use client::*;
pub use config::*;
pub use histogram::*;
pub use latency::*;
pub use report::*;
pub use request::*;
pub use response::*;
pub use stats::*;
pub use transport::*;
