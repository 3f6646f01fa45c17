//! Resource limits and usage statistics

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::TPriority;

// =============================================================================
// Reservation Priorities
// =============================================================================

/// Reserve only while usage stays below ~40% of the memory limit.
pub const RESERVATION_PRIORITY_LOW: u8 = 101;
/// Reserve only while usage stays below ~60% of the memory limit.
pub const RESERVATION_PRIORITY_MEDIUM: u8 = 152;
/// Reserve only while usage stays below ~80% of the memory limit.
pub const RESERVATION_PRIORITY_HIGH: u8 = 203;
/// Reserve whenever the memory limit allows.
pub const RESERVATION_PRIORITY_ALWAYS: u8 = 255;

// =============================================================================
// Limit
// =============================================================================

/// Caps applied to a resource scope.
///
/// Fields missing from a deserialized limit are uncapped.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default = "Limit::unlimited")]
pub struct Limit {
    /// Memory in bytes
    pub memory: i64,
    pub fd: i64,
    pub conns_inbound: i64,
    pub conns_outbound: i64,
    pub conns_total: i64,
    pub tasks_total: i64,
    pub tasks_high: i64,
    pub tasks_medium: i64,
    pub tasks_low: i64,
    /// Outbound stream caps keyed by protocol; a missing protocol is uncapped.
    pub streams_outbound: BTreeMap<String, i64>,
}

impl Limit {
    /// A limit that admits everything.
    pub fn unlimited() -> Self {
        Self {
            memory: i64::MAX,
            fd: i64::MAX,
            conns_inbound: i64::MAX,
            conns_outbound: i64::MAX,
            conns_total: i64::MAX,
            tasks_total: i64::MAX,
            tasks_high: i64::MAX,
            tasks_medium: i64::MAX,
            tasks_low: i64::MAX,
            streams_outbound: BTreeMap::new(),
        }
    }

    /// One task slot at the level of `priority`.
    pub fn for_priority(priority: TPriority) -> Self {
        let mut limit = Self {
            tasks_total: 1,
            ..Default::default()
        };
        match crate::task::PriorityLevel::of(priority) {
            crate::task::PriorityLevel::High => limit.tasks_high = 1,
            crate::task::PriorityLevel::Medium => limit.tasks_medium = 1,
            crate::task::PriorityLevel::Low => limit.tasks_low = 1,
        }
        limit
    }

    /// Returns true if every field of `self` is at least the one in `other`.
    pub fn not_less(&self, other: &Limit) -> bool {
        self.memory >= other.memory
            && self.fd >= other.fd
            && self.conns_inbound >= other.conns_inbound
            && self.conns_outbound >= other.conns_outbound
            && self.conns_total >= other.conns_total
            && self.tasks_total >= other.tasks_total
            && self.tasks_high >= other.tasks_high
            && self.tasks_medium >= other.tasks_medium
            && self.tasks_low >= other.tasks_low
            && other.streams_outbound.iter().all(|(proto, want)| {
                self.streams_outbound
                    .get(proto)
                    .map_or(true, |have| have >= want)
            })
    }

    pub fn add(&mut self, other: &Limit) {
        self.memory = self.memory.saturating_add(other.memory);
        self.fd = self.fd.saturating_add(other.fd);
        self.conns_inbound = self.conns_inbound.saturating_add(other.conns_inbound);
        self.conns_outbound = self.conns_outbound.saturating_add(other.conns_outbound);
        self.conns_total = self.conns_total.saturating_add(other.conns_total);
        self.tasks_total = self.tasks_total.saturating_add(other.tasks_total);
        self.tasks_high = self.tasks_high.saturating_add(other.tasks_high);
        self.tasks_medium = self.tasks_medium.saturating_add(other.tasks_medium);
        self.tasks_low = self.tasks_low.saturating_add(other.tasks_low);
        for (proto, n) in &other.streams_outbound {
            let entry = self.streams_outbound.entry(proto.clone()).or_insert(0);
            *entry = entry.saturating_add(*n);
        }
    }

    pub fn sub(&mut self, other: &Limit) {
        self.memory = self.memory.saturating_sub(other.memory);
        self.fd = self.fd.saturating_sub(other.fd);
        self.conns_inbound = self.conns_inbound.saturating_sub(other.conns_inbound);
        self.conns_outbound = self.conns_outbound.saturating_sub(other.conns_outbound);
        self.conns_total = self.conns_total.saturating_sub(other.conns_total);
        self.tasks_total = self.tasks_total.saturating_sub(other.tasks_total);
        self.tasks_high = self.tasks_high.saturating_sub(other.tasks_high);
        self.tasks_medium = self.tasks_medium.saturating_sub(other.tasks_medium);
        self.tasks_low = self.tasks_low.saturating_sub(other.tasks_low);
        for (proto, n) in &other.streams_outbound {
            if let Some(entry) = self.streams_outbound.get_mut(proto) {
                *entry = entry.saturating_sub(*n);
            }
        }
    }

    /// The usage a task with this estimate charges on a scope.
    pub fn to_scope_stat(&self) -> ScopeStat {
        ScopeStat {
            memory: self.memory,
            num_tasks_high: self.tasks_high,
            num_tasks_medium: self.tasks_medium,
            num_tasks_low: self.tasks_low,
            num_conns_inbound: self.conns_inbound,
            num_conns_outbound: self.conns_outbound,
            num_fd: self.fd,
            streams_outbound: self.streams_outbound.clone(),
        }
    }

    /// Memory ceiling for a reservation at `priority`.
    pub(crate) fn memory_threshold(&self, priority: u8) -> i64 {
        let scaled = i128::from(self.memory) * (1 + i128::from(priority)) / 256;
        i64::try_from(scaled).unwrap_or(i64::MAX)
    }

    /// Checks that `stat` stays within this limit. Memory is checked at `priority`.
    pub(crate) fn check(&self, scope: &str, stat: &ScopeStat, priority: u8) -> Result<()> {
        let exceeded = |what: &str, have: i64, cap: i64| {
            Error::ResourceExceeded(format!(
                "scope {} {}: {} exceeds limit {}",
                scope, what, have, cap
            ))
        };
        let threshold = self.memory_threshold(priority);
        if stat.memory > threshold {
            return Err(exceeded("memory", stat.memory, threshold));
        }
        if stat.num_fd > self.fd {
            return Err(exceeded("fd", stat.num_fd, self.fd));
        }
        if stat.num_conns_inbound > self.conns_inbound {
            return Err(exceeded("inbound conns", stat.num_conns_inbound, self.conns_inbound));
        }
        if stat.num_conns_outbound > self.conns_outbound {
            return Err(exceeded(
                "outbound conns",
                stat.num_conns_outbound,
                self.conns_outbound,
            ));
        }
        let conns = stat.num_conns_inbound.saturating_add(stat.num_conns_outbound);
        if conns > self.conns_total {
            return Err(exceeded("total conns", conns, self.conns_total));
        }
        if stat.num_tasks_high > self.tasks_high {
            return Err(exceeded("high tasks", stat.num_tasks_high, self.tasks_high));
        }
        if stat.num_tasks_medium > self.tasks_medium {
            return Err(exceeded("medium tasks", stat.num_tasks_medium, self.tasks_medium));
        }
        if stat.num_tasks_low > self.tasks_low {
            return Err(exceeded("low tasks", stat.num_tasks_low, self.tasks_low));
        }
        let tasks = stat.num_tasks();
        if tasks > self.tasks_total {
            return Err(exceeded("total tasks", tasks, self.tasks_total));
        }
        for (proto, n) in &stat.streams_outbound {
            if let Some(cap) = self.streams_outbound.get(proto) {
                if n > cap {
                    return Err(exceeded(&format!("streams[{}]", proto), *n, *cap));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory={} fd={} conns(in={},out={},total={}) tasks(total={},high={},medium={},low={})",
            self.memory,
            self.fd,
            self.conns_inbound,
            self.conns_outbound,
            self.conns_total,
            self.tasks_total,
            self.tasks_high,
            self.tasks_medium,
            self.tasks_low
        )
    }
}

// =============================================================================
// ScopeStat
// =============================================================================

/// Resources currently charged to a scope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScopeStat {
    pub memory: i64,
    pub num_tasks_high: i64,
    pub num_tasks_medium: i64,
    pub num_tasks_low: i64,
    pub num_conns_inbound: i64,
    pub num_conns_outbound: i64,
    pub num_fd: i64,
    pub streams_outbound: BTreeMap<String, i64>,
}

impl ScopeStat {
    pub fn memory(bytes: i64) -> Self {
        Self {
            memory: bytes,
            ..Default::default()
        }
    }

    pub fn num_tasks(&self) -> i64 {
        self.num_tasks_high
            .saturating_add(self.num_tasks_medium)
            .saturating_add(self.num_tasks_low)
    }

    pub fn add(&mut self, other: &ScopeStat) {
        self.memory = self.memory.saturating_add(other.memory);
        self.num_tasks_high = self.num_tasks_high.saturating_add(other.num_tasks_high);
        self.num_tasks_medium = self.num_tasks_medium.saturating_add(other.num_tasks_medium);
        self.num_tasks_low = self.num_tasks_low.saturating_add(other.num_tasks_low);
        self.num_conns_inbound = self.num_conns_inbound.saturating_add(other.num_conns_inbound);
        self.num_conns_outbound = self
            .num_conns_outbound
            .saturating_add(other.num_conns_outbound);
        self.num_fd = self.num_fd.saturating_add(other.num_fd);
        for (proto, n) in &other.streams_outbound {
            let entry = self.streams_outbound.entry(proto.clone()).or_insert(0);
            *entry = entry.saturating_add(*n);
        }
    }

    /// Subtracts `other`, clamping every counter at zero.
    pub fn sub(&mut self, other: &ScopeStat) {
        let dec = |v: i64, by: i64| v.saturating_sub(by).max(0);
        self.memory = dec(self.memory, other.memory);
        self.num_tasks_high = dec(self.num_tasks_high, other.num_tasks_high);
        self.num_tasks_medium = dec(self.num_tasks_medium, other.num_tasks_medium);
        self.num_tasks_low = dec(self.num_tasks_low, other.num_tasks_low);
        self.num_conns_inbound = dec(self.num_conns_inbound, other.num_conns_inbound);
        self.num_conns_outbound = dec(self.num_conns_outbound, other.num_conns_outbound);
        self.num_fd = dec(self.num_fd, other.num_fd);
        for (proto, n) in &other.streams_outbound {
            if let Some(entry) = self.streams_outbound.get_mut(proto) {
                *entry = dec(*entry, *n);
            }
        }
        self.streams_outbound.retain(|_, n| *n > 0);
    }

    pub fn is_zero(&self) -> bool {
        *self == ScopeStat::default()
    }
}

impl fmt::Display for ScopeStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory={} tasks(high={},medium={},low={}) conns(in={},out={}) fd={}",
            self.memory,
            self.num_tasks_high,
            self.num_tasks_medium,
            self.num_tasks_low,
            self.num_conns_inbound,
            self.num_conns_outbound,
            self.num_fd
        )
    }
}

// =============================================================================
// Limiter
// =============================================================================

/// Source of system and per-service limits.
pub trait Limiter: Send + Sync {
    fn system_limits(&self) -> Limit;
    fn service_limits(&self, name: &str) -> Limit;
}

/// Limiter backed by static tables. Services without an entry get the
/// default service limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GfSpLimiter {
    pub system: Limit,
    pub default_service: Limit,
    pub services: HashMap<String, Limit>,
}

impl Default for GfSpLimiter {
    fn default() -> Self {
        Self {
            system: Limit::unlimited(),
            default_service: Limit::unlimited(),
            services: HashMap::new(),
        }
    }
}

impl Limiter for GfSpLimiter {
    fn system_limits(&self) -> Limit {
        self.system.clone()
    }

    fn service_limits(&self, name: &str) -> Limit {
        self.services
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_service.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_not_less() {
        let cap = Limit {
            memory: 100,
            tasks_total: 2,
            tasks_low: 2,
            ..Default::default()
        };
        let want = Limit {
            memory: 50,
            tasks_total: 1,
            tasks_low: 1,
            ..Default::default()
        };
        assert!(cap.not_less(&want));
        assert!(!want.not_less(&cap));
        assert!(Limit::unlimited().not_less(&cap));
    }

    #[test]
    fn test_add_sub() {
        let mut a = Limit::for_priority(200);
        a.memory = 10;
        let b = a.clone();
        a.add(&b);
        assert_eq!(a.memory, 20);
        assert_eq!(a.tasks_high, 2);
        a.sub(&b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_for_priority_levels() {
        assert_eq!(Limit::for_priority(0).tasks_low, 1);
        assert_eq!(Limit::for_priority(100).tasks_medium, 1);
        assert_eq!(Limit::for_priority(255).tasks_high, 1);
        assert_eq!(Limit::for_priority(255).tasks_total, 1);
    }

    #[test]
    fn test_memory_threshold_scales_with_priority() {
        let limit = Limit {
            memory: 256,
            ..Limit::unlimited()
        };
        assert_eq!(limit.memory_threshold(RESERVATION_PRIORITY_ALWAYS), 256);
        assert_eq!(limit.memory_threshold(RESERVATION_PRIORITY_LOW), 102);
        assert_eq!(Limit::unlimited().memory_threshold(255), i64::MAX);
    }

    #[test]
    fn test_check_stream_caps() {
        let mut limit = Limit::unlimited();
        limit.streams_outbound.insert("/replicate/1".into(), 1);
        let mut stat = ScopeStat::default();
        stat.streams_outbound.insert("/replicate/1".into(), 2);
        assert_matches!(
            limit.check("svc", &stat, RESERVATION_PRIORITY_ALWAYS),
            Err(Error::ResourceExceeded(_))
        );
        stat.streams_outbound.clear();
        stat.streams_outbound.insert("/other".into(), 99);
        assert!(limit.check("svc", &stat, RESERVATION_PRIORITY_ALWAYS).is_ok());
    }

    #[test]
    fn test_scope_stat_sub_clamps() {
        let mut s = ScopeStat::memory(5);
        s.sub(&ScopeStat::memory(10));
        assert!(s.is_zero());
    }

    #[test]
    fn test_limiter_falls_back_to_default_service() {
        let mut limiter = GfSpLimiter::default();
        limiter.services.insert(
            "receiver".into(),
            Limit {
                memory: 1,
                ..Limit::unlimited()
            },
        );
        assert_eq!(limiter.service_limits("receiver").memory, 1);
        assert_eq!(limiter.service_limits("approver").memory, i64::MAX);
    }
}
