pub mod feed;
pub mod parser;

pub use feed::{FeedCommand, FeedConfig, FeedError, FeedEvent, FeedHandle, FeedStats, PumpFeedClient};
pub use parser::{parse_frame, FeedMessage, RawFeedFrame};
