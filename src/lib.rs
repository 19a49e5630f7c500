pub mod config;
pub mod core;
pub mod ingest;
pub mod platform;
pub mod processor;
pub mod query;
pub mod sink;
pub mod tracker;
pub mod transport;

pub use config::Config;
pub use processor::{DataProcessor, ProcessorWorker};
pub use tracker::{Tracker, TrendAnalyzer};
pub use transport::{BusEvent, EventBus};
