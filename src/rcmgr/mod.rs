//! Resource Manager
//!
//! Process-wide and per-service reservations bounded by a [`Limiter`].
//!
//! ```text
//! ┌──────────────────────────── System ────────────────────────────┐
//! │  ┌──────── Service "receiver" ───────┐  ┌── Service "approver" ─┐│
//! │  │  Span  Span  Span ...             │  │  Span ...             ││
//! │  └───────────────────────────────────┘  └───────────────────────┘│
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reservation failures surface as `ResourceExceeded` and are retriable.
//! Releasing is infallible and idempotent.

mod limit;
mod scope;

pub use limit::{
    GfSpLimiter, Limit, Limiter, ScopeStat, RESERVATION_PRIORITY_ALWAYS,
    RESERVATION_PRIORITY_HIGH, RESERVATION_PRIORITY_LOW, RESERVATION_PRIORITY_MEDIUM,
};
pub use scope::{ResourceScope, ResourceScopeSpan};

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::error::{Error, Result};
use scope::ScopeInner;

/// Entry point to the scope hierarchy.
pub trait ResourceManager: Send + Sync {
    /// Creates or returns the scope of service `name`.
    fn open_service(&self, name: &str) -> Result<ResourceScope>;

    /// Usage of the system scope.
    fn system_stat(&self) -> ScopeStat;

    /// Usage of service `name`, if it is open.
    fn service_stat(&self, name: &str) -> Option<ScopeStat>;

    /// Closes every service scope.
    fn close(&self);
}

/// Scope hierarchy enforced against a [`Limiter`].
pub struct GfSpResourceManager {
    limiter: Arc<dyn Limiter>,
    system: Arc<ScopeInner>,
    services: DashMap<String, Arc<ScopeInner>>,
}

impl GfSpResourceManager {
    pub fn new(limiter: Arc<dyn Limiter>) -> Self {
        let system = Arc::new(ScopeInner::new("system", limiter.system_limits(), None));
        Self {
            limiter,
            system,
            services: DashMap::new(),
        }
    }

    /// Applies `f` to the system scope.
    pub fn view_system<T>(&self, f: impl FnOnce(&ResourceScope) -> T) -> T {
        f(&ResourceScope::new(self.system.clone()))
    }

    /// Applies `f` to service `name`, failing if the service was never opened.
    pub fn view_service<T>(&self, name: &str, f: impl FnOnce(&ResourceScope) -> T) -> Result<T> {
        let scope = self
            .services
            .get(name)
            .map(|s| ResourceScope::new(s.clone()))
            .ok_or_else(|| Error::NotFound(format!("resource scope {}", name)))?;
        Ok(f(&scope))
    }
}

impl ResourceManager for GfSpResourceManager {
    fn open_service(&self, name: &str) -> Result<ResourceScope> {
        if self.system.is_done() {
            return Err(Error::ResourceExceeded("resource manager closed".into()));
        }
        let mut entry = self.services.entry(name.to_string()).or_insert_with(|| {
            info!(service = name, "opening resource scope");
            Arc::new(ScopeInner::new(
                name,
                self.limiter.service_limits(name),
                Some(self.system.clone()),
            ))
        });
        if entry.is_done() {
            *entry = Arc::new(ScopeInner::new(
                name,
                self.limiter.service_limits(name),
                Some(self.system.clone()),
            ));
        }
        Ok(ResourceScope::new(entry.clone()))
    }

    fn system_stat(&self) -> ScopeStat {
        self.system.stat()
    }

    fn service_stat(&self, name: &str) -> Option<ScopeStat> {
        self.services
            .get(name)
            .filter(|s| !s.is_done())
            .map(|s| s.stat())
    }

    fn close(&self) {
        for service in self.services.iter() {
            service.done();
        }
        self.services.clear();
        self.system.done();
    }
}

/// Resource manager used when reservations are disabled; every scope is the
/// null scope.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullResourceManager;

impl ResourceManager for NullResourceManager {
    fn open_service(&self, _name: &str) -> Result<ResourceScope> {
        Ok(ResourceScope::null())
    }

    fn system_stat(&self) -> ScopeStat {
        ScopeStat::default()
    }

    fn service_stat(&self, _name: &str) -> Option<ScopeStat> {
        None
    }

    fn close(&self) {}
}
