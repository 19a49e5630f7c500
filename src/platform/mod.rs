pub mod detector;
pub mod retry;

pub use detector::{
    Detection, DetectionMethod, DetectorError, HttpProgramDirectory, PlatformDetector,
    ProgramDirectory,
};
pub use retry::{DetectionRetryWorker, RetryPolicy, RetryQueueHandle};
