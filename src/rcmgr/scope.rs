//! Resource scopes and spans
//!
//! Scopes form a chain `System -> Service -> Span`. A reservation on a span
//! is charged to every ancestor; if any ancestor refuses, the charges already
//! made are rolled back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::limit::{Limit, ScopeStat, RESERVATION_PRIORITY_ALWAYS};
use crate::error::{Error, Result};

pub(crate) struct ScopeInner {
    name: String,
    limit: Limit,
    stat: Mutex<ScopeStat>,
    parent: Option<Arc<ScopeInner>>,
    spans: Mutex<Vec<Weak<ScopeInner>>>,
    done: AtomicBool,
}

impl ScopeInner {
    pub(crate) fn new(name: impl Into<String>, limit: Limit, parent: Option<Arc<ScopeInner>>) -> Self {
        Self {
            name: name.into(),
            limit,
            stat: Mutex::new(ScopeStat::default()),
            parent,
            spans: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn stat(&self) -> ScopeStat {
        self.stat.lock().clone()
    }

    fn reserve_local(&self, delta: &ScopeStat, priority: u8) -> Result<()> {
        let mut stat = self.stat.lock();
        let mut next = stat.clone();
        next.add(delta);
        self.limit.check(&self.name, &next, priority)?;
        *stat = next;
        Ok(())
    }

    fn release_local(&self, delta: &ScopeStat) {
        self.stat.lock().sub(delta);
    }

    fn reserve(&self, delta: &ScopeStat, priority: u8) -> Result<()> {
        if self.is_done() {
            return Err(Error::ResourceExceeded(format!(
                "scope {} is already closed",
                self.name
            )));
        }
        self.reserve_local(delta, priority)?;
        if let Some(parent) = &self.parent {
            if let Err(e) = parent.reserve(delta, priority) {
                self.release_local(delta);
                return Err(e);
            }
        }
        Ok(())
    }

    fn release(&self, delta: &ScopeStat) {
        self.release_local(delta);
        if let Some(parent) = &self.parent {
            parent.release(delta);
        }
    }

    /// Closes the scope: outstanding spans first, then whatever this scope
    /// still holds is returned to its ancestors.
    pub(crate) fn done(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let spans = std::mem::take(&mut *self.spans.lock());
        for span in spans.iter().filter_map(Weak::upgrade) {
            span.done();
        }
        let held = std::mem::take(&mut *self.stat.lock());
        if let Some(parent) = &self.parent {
            parent.release(&held);
        }
        debug!(scope = %self.name, released = %held, "resource scope closed");
    }
}

// =============================================================================
// ResourceScope
// =============================================================================

/// A service-level scope. A scope without an inner state is the null scope
/// handed out when the resource manager is disabled.
#[derive(Clone)]
pub struct ResourceScope {
    inner: Option<Arc<ScopeInner>>,
}

impl ResourceScope {
    pub(crate) fn new(inner: Arc<ScopeInner>) -> Self {
        Self { inner: Some(inner) }
    }

    /// A scope that admits every reservation.
    pub fn null() -> Self {
        Self { inner: None }
    }

    pub fn name(&self) -> &str {
        self.inner.as_ref().map_or("null", |i| i.name.as_str())
    }

    pub fn limit(&self) -> Limit {
        self.inner
            .as_ref()
            .map_or_else(Limit::unlimited, |i| i.limit.clone())
    }

    pub fn stat(&self) -> ScopeStat {
        self.inner.as_ref().map(|i| i.stat()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.as_ref().is_some_and(|i| i.is_done())
    }

    /// Charges `stat` directly to this scope and its ancestors.
    pub fn reserve_resources(&self, stat: &ScopeStat) -> Result<()> {
        match &self.inner {
            Some(inner) => inner.reserve(stat, RESERVATION_PRIORITY_ALWAYS),
            None => Ok(()),
        }
    }

    pub fn release_resources(&self, stat: &ScopeStat) {
        if let Some(inner) = &self.inner {
            inner.release(stat);
        }
    }

    /// Opens a child span for a single operation.
    pub fn begin_span(&self) -> Result<ResourceScopeSpan> {
        let Some(inner) = &self.inner else {
            return Ok(ResourceScopeSpan { inner: None });
        };
        if inner.is_done() {
            return Err(Error::ResourceExceeded(format!(
                "scope {} is already closed",
                inner.name
            )));
        }
        let span = Arc::new(ScopeInner::new(
            format!("{}.span", inner.name),
            Limit::unlimited(),
            Some(inner.clone()),
        ));
        let mut spans = inner.spans.lock();
        spans.retain(|s| s.strong_count() > 0);
        spans.push(Arc::downgrade(&span));
        Ok(ResourceScopeSpan { inner: Some(span) })
    }

    /// Releases the scope and every outstanding span. Idempotent.
    pub fn release(&self) {
        if let Some(inner) = &self.inner {
            inner.done();
        }
    }
}

impl std::fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceScope")
            .field("name", &self.name())
            .field("stat", &self.stat())
            .finish()
    }
}

// =============================================================================
// ResourceScopeSpan
// =============================================================================

/// Charges held for one operation. Dropping the span releases them.
pub struct ResourceScopeSpan {
    inner: Option<Arc<ScopeInner>>,
}

impl ResourceScopeSpan {
    /// All-or-nothing reservation against the span and all ancestors.
    pub fn reserve_resources(&self, stat: &ScopeStat) -> Result<()> {
        match &self.inner {
            Some(inner) => inner.reserve(stat, RESERVATION_PRIORITY_ALWAYS),
            None => Ok(()),
        }
    }

    /// Reserves memory only while usage stays under `limit * (1 + priority) / 256`.
    pub fn reserve_memory(&self, size: i64, priority: u8) -> Result<()> {
        match &self.inner {
            Some(inner) => inner.reserve(&ScopeStat::memory(size), priority),
            None => Ok(()),
        }
    }

    pub fn release_memory(&self, size: i64) {
        if let Some(inner) = &self.inner {
            inner.release(&ScopeStat::memory(size));
        }
    }

    pub fn stat(&self) -> ScopeStat {
        self.inner.as_ref().map(|i| i.stat()).unwrap_or_default()
    }

    /// Releases every charge held by the span. Idempotent.
    pub fn done(&self) {
        if let Some(inner) = &self.inner {
            inner.done();
        }
    }
}

impl std::fmt::Debug for ResourceScopeSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceScopeSpan")
            .field("name", &self.inner.as_ref().map(|i| i.name.as_str()))
            .field("stat", &self.stat())
            .finish()
    }
}

impl Drop for ResourceScopeSpan {
    fn drop(&mut self) {
        self.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn chain(system_mem: i64, service_mem: i64) -> (Arc<ScopeInner>, ResourceScope) {
        let system = Arc::new(ScopeInner::new(
            "system",
            Limit {
                memory: system_mem,
                ..Limit::unlimited()
            },
            None,
        ));
        let service = ResourceScope::new(Arc::new(ScopeInner::new(
            "svc",
            Limit {
                memory: service_mem,
                ..Limit::unlimited()
            },
            Some(system.clone()),
        )));
        (system, service)
    }

    #[test]
    fn test_span_charges_all_ancestors() {
        let (system, service) = chain(100, 100);
        let span = service.begin_span().unwrap();
        span.reserve_resources(&ScopeStat::memory(40)).unwrap();
        assert_eq!(span.stat().memory, 40);
        assert_eq!(service.stat().memory, 40);
        assert_eq!(system.stat().memory, 40);
        span.done();
        assert!(service.stat().is_zero());
        assert!(system.stat().is_zero());
    }

    #[test]
    fn test_reservation_is_all_or_nothing() {
        let (system, service) = chain(50, 100);
        let span = service.begin_span().unwrap();
        assert_matches!(
            span.reserve_resources(&ScopeStat::memory(60)),
            Err(Error::ResourceExceeded(_))
        );
        assert!(span.stat().is_zero());
        assert!(service.stat().is_zero());
        assert!(system.stat().is_zero());
    }

    #[test]
    fn test_done_is_idempotent() {
        let (system, service) = chain(100, 100);
        let span = service.begin_span().unwrap();
        span.reserve_resources(&ScopeStat::memory(10)).unwrap();
        span.done();
        span.done();
        drop(span);
        assert!(system.stat().is_zero());
    }

    #[test]
    fn test_release_closes_outstanding_spans() {
        let (system, service) = chain(100, 100);
        let a = service.begin_span().unwrap();
        let b = service.begin_span().unwrap();
        a.reserve_resources(&ScopeStat::memory(10)).unwrap();
        b.reserve_resources(&ScopeStat::memory(20)).unwrap();
        service.reserve_resources(&ScopeStat::memory(5)).unwrap();
        service.release();
        service.release();
        assert!(system.stat().is_zero());
        assert!(service.is_closed());
        assert_matches!(
            a.reserve_resources(&ScopeStat::memory(1)),
            Err(Error::ResourceExceeded(_))
        );
        assert_matches!(service.begin_span(), Err(Error::ResourceExceeded(_)));
    }

    #[test]
    fn test_reserve_memory_respects_priority() {
        let (_system, service) = chain(256, 256);
        let span = service.begin_span().unwrap();
        assert!(span.reserve_memory(100, 101).is_ok());
        assert_matches!(span.reserve_memory(10, 101), Err(Error::ResourceExceeded(_)));
        assert!(span.reserve_memory(10, 255).is_ok());
        span.release_memory(110);
        assert!(span.stat().is_zero());
    }

    #[test]
    fn test_null_scope_admits_everything() {
        let scope = ResourceScope::null();
        let span = scope.begin_span().unwrap();
        span.reserve_resources(&ScopeStat::memory(i64::MAX)).unwrap();
        assert!(span.stat().is_zero());
        scope.release();
        assert!(!scope.is_closed());
    }
}
