//! Ambient HTTP middleware: request logging and the two rate-limit
//! policies named in spec.md §6.

pub mod logging;
pub mod rate_limit;

pub use logging::request_logging;
pub use rate_limit::{market_data_refresh_rate_limit, public_opportunities_rate_limit};
