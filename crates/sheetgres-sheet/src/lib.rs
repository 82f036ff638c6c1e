pub mod client;
pub mod error;
pub mod mock;
pub mod rate_limit;

pub use client::{HttpSheetClient, RecordPage, SheetClient, SheetRecord};
pub use error::{SheetError, SheetResult};
pub use mock::MockSheetClient;
pub use rate_limit::RateLimiter;
