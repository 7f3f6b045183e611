pub mod holidays;
pub mod session;

pub use holidays::{is_weekend, parse_holidays};
pub use session::MarketCalendar;
