mod backend;
mod backends;
mod kind;
mod registry;

pub use backend::{DetectionOutcome, DetectionService};
pub use backends::{service_for_endpoint, HttpDetectionService, StubDetectionService};
pub use kind::DetectorKind;
pub use registry::DetectorRegistry;
