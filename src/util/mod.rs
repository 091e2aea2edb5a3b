//! Small helpers shared across the gateway.

pub mod http_date;
