use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::backend::DetectionService;
use super::backends::service_for_endpoint;
use super::kind::DetectorKind;
use crate::config::DetectorSettings;

/// Detection services keyed by detector kind.
#[derive(Clone, Default)]
pub struct DetectorRegistry {
    services: BTreeMap<DetectorKind, Arc<dyn DetectionService>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One service per configured detector, built from its endpoint.
    pub fn from_settings(detectors: &[DetectorSettings], timeout: Duration) -> Result<Self> {
        let mut registry = Self::new();
        for detector in detectors {
            let service = service_for_endpoint(&detector.endpoint, timeout)
                .with_context(|| format!("detector '{}'", detector.kind))?;
            registry.register(detector.kind, service)?;
        }
        Ok(registry)
    }

    /// Register a service. Registering a kind twice is an error.
    pub fn register(
        &mut self,
        kind: DetectorKind,
        service: Arc<dyn DetectionService>,
    ) -> Result<()> {
        if self.services.contains_key(&kind) {
            return Err(anyhow!("detector '{}' already registered", kind));
        }
        self.services.insert(kind, service);
        Ok(())
    }

    pub fn get(&self, kind: DetectorKind) -> Option<Arc<dyn DetectionService>> {
        self.services.get(&kind).cloned()
    }

    /// Like `get`, but a missing kind is an error.
    pub fn require(&self, kind: DetectorKind) -> Result<Arc<dyn DetectionService>> {
        self.get(kind)
            .ok_or_else(|| anyhow!("no detection service registered for '{}'", kind))
    }

    pub fn kinds(&self) -> Vec<DetectorKind> {
        self.services.keys().copied().collect()
    }
}
