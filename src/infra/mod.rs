pub mod backend;
pub mod error;
pub mod memcached;
pub mod telemetry;
