pub mod content;
pub mod loop_detector;
pub mod orchestrator;
pub mod rate_limiter;

pub use content::{ContentFinding, ContentScanner};
pub use loop_detector::LoopDetector;
pub use orchestrator::{
    ApiValidation, RequestPermit, SafetyAssessment, SafetyOrchestrator, SafetyStatus,
};
pub use rate_limiter::SlidingWindowLimiter;
