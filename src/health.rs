use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the backing services are fit to take traffic.
pub trait HealthCheck: Send + Sync {
    fn is_healthy(&self) -> bool;
}

pub struct AlwaysHealthy;

impl HealthCheck for AlwaysHealthy {
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Health flag flipped by whatever monitors the dependencies.
#[derive(Debug)]
pub struct HealthFlag {
    healthy: AtomicBool,
}

impl HealthFlag {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
        }
    }

    pub fn set(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

impl Default for HealthFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl HealthCheck for HealthFlag {
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
