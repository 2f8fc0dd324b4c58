pub mod http;
pub mod stub;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

pub use http::HttpDetectionService;
pub use stub::StubDetectionService;

use super::backend::DetectionService;

/// Build a detection service from a configured endpoint.
///
/// `stub://detected` and `stub://clear` give fixed-verdict services for local
/// runs and tests; anything else is treated as an HTTP(S) inference endpoint.
pub fn service_for_endpoint(
    endpoint: &str,
    timeout: Duration,
) -> Result<Arc<dyn DetectionService>> {
    if let Some(rest) = endpoint.strip_prefix("stub://") {
        return Ok(Arc::new(StubDetectionService::from_spec(rest)?));
    }
    Ok(Arc::new(HttpDetectionService::new(endpoint, timeout)?))
}
