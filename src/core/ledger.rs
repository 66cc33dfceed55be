//! Per-device logical memory accounting.
//!
//! The ledger admits reservations against each device's budget and evicts the
//! oldest unpinned reservations when a request does not fit. It never touches
//! real device memory; callers treat a reservation as permission to allocate.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::device::DeviceId;

/// Usage summary for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerUsage {
    /// Bytes held by active reservations.
    pub used_bytes: u64,
    /// Device budget.
    pub total_bytes: u64,
    /// Number of active reservations.
    pub reservation_count: usize,
}

/// An active claim on a device's memory budget.
#[derive(Debug, Clone)]
pub struct MemoryReservation {
    /// Device the claim is against.
    pub device_id: DeviceId,
    /// Caller-chosen tag, unique per device while active.
    pub tag: String,
    /// Claimed bytes.
    pub size_bytes: u64,
    /// When the claim was admitted.
    pub created_at: Instant,
    /// Pinned reservations are never evicted.
    pub pinned: bool,
}

#[derive(Debug, Default)]
struct DeviceBudget {
    total: u64,
    used: u64,
    /// Reservations in creation order, keyed by admission sequence.
    by_age: BTreeMap<u64, MemoryReservation>,
    /// Tag to admission sequence.
    by_tag: HashMap<String, u64>,
}

impl DeviceBudget {
    fn fits(&self, size: u64) -> bool {
        self.used.checked_add(size).is_some_and(|after| after <= self.total)
    }

    fn evictable_bytes(&self) -> u64 {
        self.by_age
            .values()
            .filter(|r| !r.pinned)
            .map(|r| r.size_bytes)
            .sum()
    }

    fn remove(&mut self, tag: &str) -> Option<MemoryReservation> {
        let seq = self.by_tag.remove(tag)?;
        let reservation = self.by_age.remove(&seq)?;
        self.used -= reservation.size_bytes;
        Some(reservation)
    }

    /// Drop oldest unpinned reservations until `incoming` fits.
    fn evict_for(&mut self, incoming: u64) -> Vec<String> {
        if self.fits(incoming) {
            return Vec::new();
        }
        let pinned = self.used - self.evictable_bytes();
        if pinned.checked_add(incoming).is_none_or(|floor| floor > self.total) {
            // Emptying every evictable slot would still not make room.
            return Vec::new();
        }
        let mut evicted = Vec::new();
        let victims: Vec<String> = self
            .by_age
            .values()
            .filter(|r| !r.pinned)
            .map(|r| r.tag.clone())
            .collect();
        for tag in victims {
            if self.fits(incoming) {
                break;
            }
            if self.remove(&tag).is_some() {
                evicted.push(tag);
            }
        }
        evicted
    }
}

/// Thread-safe memory ledger for all devices.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    budgets: HashMap<DeviceId, DeviceBudget>,
    next_seq: u64,
}

impl MemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or resize) a device budget. Existing reservations are kept.
    ///
    /// A shrink below the bytes already reserved is clamped to the reserved
    /// amount, so usage never exceeds the budget.
    pub fn register_device(&self, device_id: DeviceId, total_bytes: u64) {
        let mut state = self.state.lock();
        let budget = state.budgets.entry(device_id).or_default();
        if total_bytes < budget.used {
            warn!(
                device_id,
                requested = total_bytes,
                reserved = budget.used,
                "budget shrink below reserved bytes clamped"
            );
        }
        budget.total = total_bytes.max(budget.used);
    }

    /// Admit an evictable reservation.
    ///
    /// If the request does not fit, one eviction pass runs and the admission
    /// is retried once. Returns `false` for unknown devices, duplicate active
    /// tags, or when the request still does not fit.
    pub fn try_reserve(&self, device_id: DeviceId, tag: &str, size_bytes: u64) -> bool {
        self.reserve(device_id, tag, size_bytes, false)
    }

    /// Admit a reservation that eviction will never remove.
    ///
    /// Same admission rules as [`MemoryLedger::try_reserve`].
    pub fn try_reserve_pinned(&self, device_id: DeviceId, tag: &str, size_bytes: u64) -> bool {
        self.reserve(device_id, tag, size_bytes, true)
    }

    fn reserve(&self, device_id: DeviceId, tag: &str, size_bytes: u64, pinned: bool) -> bool {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        let Some(budget) = state.budgets.get_mut(&device_id) else {
            warn!(device_id, tag, "reservation against unknown device");
            return false;
        };
        if budget.by_tag.contains_key(tag) {
            warn!(device_id, tag, "reservation tag already active");
            return false;
        }
        if !budget.fits(size_bytes) {
            let evicted = budget.evict_for(size_bytes);
            if !evicted.is_empty() {
                info!(device_id, count = evicted.len(), ?evicted, "evicted reservations");
            }
            if !budget.fits(size_bytes) {
                debug!(device_id, tag, size_bytes, used = budget.used, total = budget.total, "reservation denied");
                return false;
            }
        }
        budget.used += size_bytes;
        budget.by_tag.insert(tag.to_owned(), seq);
        budget.by_age.insert(
            seq,
            MemoryReservation {
                device_id,
                tag: tag.to_owned(),
                size_bytes,
                created_at: Instant::now(),
                pinned,
            },
        );
        state.next_seq += 1;
        true
    }

    /// Remove a reservation. Unknown devices and tags are ignored.
    pub fn release(&self, device_id: DeviceId, tag: &str) {
        let mut state = self.state.lock();
        if let Some(reservation) = state
            .budgets
            .get_mut(&device_id)
            .and_then(|budget| budget.remove(tag))
        {
            debug!(device_id, tag, size = reservation.size_bytes, "reservation released");
        }
    }

    /// Evict least-recently-created unpinned reservations until `incoming_bytes` fits.
    ///
    /// Returns the evicted tags, oldest first. Evicts nothing if the request
    /// already fits, or if it could not fit even after evicting everything
    /// evictable.
    pub fn evict_lru(&self, device_id: DeviceId, incoming_bytes: u64) -> Vec<String> {
        let mut state = self.state.lock();
        let evicted = state
            .budgets
            .get_mut(&device_id)
            .map(|budget| budget.evict_for(incoming_bytes))
            .unwrap_or_default();
        if !evicted.is_empty() {
            info!(device_id, count = evicted.len(), "evicted reservations");
        }
        evicted
    }

    /// Usage summary for a device.
    #[must_use]
    pub fn usage(&self, device_id: DeviceId) -> Option<LedgerUsage> {
        let state = self.state.lock();
        state.budgets.get(&device_id).map(|budget| LedgerUsage {
            used_bytes: budget.used,
            total_bytes: budget.total,
            reservation_count: budget.by_age.len(),
        })
    }

    /// Active reservations on a device, oldest first.
    #[must_use]
    pub fn reservations(&self, device_id: DeviceId) -> Vec<MemoryReservation> {
        let state = self.state.lock();
        state
            .budgets
            .get(&device_id)
            .map(|budget| budget.by_age.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a tag is currently reserved on a device.
    #[must_use]
    pub fn contains(&self, device_id: DeviceId, tag: &str) -> bool {
        let state = self.state.lock();
        state
            .budgets
            .get(&device_id)
            .is_some_and(|budget| budget.by_tag.contains_key(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(total: u64) -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.register_device(0, total);
        ledger
    }

    fn assert_consistent(ledger: &MemoryLedger) {
        let usage = ledger.usage(0).unwrap();
        let sum: u64 = ledger.reservations(0).iter().map(|r| r.size_bytes).sum();
        assert_eq!(usage.used_bytes, sum);
        assert!(usage.used_bytes <= usage.total_bytes);
    }

    #[test]
    fn test_reserve_and_release() {
        let ledger = ledger(100);
        assert!(ledger.try_reserve(0, "a", 40));
        assert!(ledger.try_reserve(0, "b", 60));
        assert_eq!(ledger.usage(0).unwrap().used_bytes, 100);

        ledger.release(0, "a");
        ledger.release(0, "a");
        ledger.release(0, "missing");
        assert_eq!(
            ledger.usage(0),
            Some(LedgerUsage { used_bytes: 60, total_bytes: 100, reservation_count: 1 })
        );
        assert_consistent(&ledger);
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let ledger = ledger(100);
        assert!(ledger.try_reserve(0, "a", 10));
        assert!(!ledger.try_reserve(0, "a", 10));
        assert_eq!(ledger.usage(0).unwrap().used_bytes, 10);
    }

    #[test]
    fn test_unknown_device_rejected() {
        let ledger = ledger(100);
        assert!(!ledger.try_reserve(7, "a", 1));
        assert!(ledger.usage(7).is_none());
    }

    #[test]
    fn test_eviction_is_minimal_and_oldest_first() {
        let ledger = ledger(100);
        assert!(ledger.try_reserve(0, "oldest", 30));
        assert!(ledger.try_reserve(0, "middle", 30));
        assert!(ledger.try_reserve(0, "newest", 30));

        // Needs 20 more than the 10 free: evicting "oldest" alone is enough.
        assert!(ledger.try_reserve(0, "incoming", 30));
        assert!(!ledger.contains(0, "oldest"));
        assert!(ledger.contains(0, "middle"));
        assert!(ledger.contains(0, "newest"));
        assert_eq!(ledger.usage(0).unwrap().used_bytes, 90);
        assert_consistent(&ledger);
    }

    #[test]
    fn test_pinned_reservations_survive_eviction() {
        let ledger = ledger(100);
        assert!(ledger.try_reserve_pinned(0, "running", 60));
        assert!(ledger.try_reserve(0, "cache", 30));

        assert!(ledger.try_reserve(0, "next", 40));
        assert!(ledger.contains(0, "running"));
        assert!(!ledger.contains(0, "cache"));

        // Only pinned bytes plus this one remain; nothing evictable can help.
        assert!(!ledger.try_reserve(0, "too-big", 50));
        assert!(ledger.contains(0, "next"));
        assert_consistent(&ledger);
    }

    #[test]
    fn test_oversized_request_evicts_nothing() {
        let ledger = ledger(100);
        assert!(ledger.try_reserve(0, "a", 50));
        assert!(!ledger.try_reserve(0, "huge", 150));
        assert!(ledger.contains(0, "a"));
        assert!(ledger.evict_lru(0, 150).is_empty());
    }

    #[test]
    fn test_evict_lru_reports_tags() {
        let ledger = ledger(100);
        assert!(ledger.try_reserve(0, "a", 50));
        assert!(ledger.try_reserve(0, "b", 50));
        assert_eq!(ledger.evict_lru(0, 0), Vec::<String>::new());
        assert_eq!(ledger.evict_lru(0, 60), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(ledger.usage(0).unwrap().reservation_count, 0);
    }
    #[test]
    fn test_shrink_below_reserved_is_clamped() {
        let l = ledger(1_000);
        assert!(l.try_reserve_pinned(0, "a", 600));

        l.register_device(0, 400);
        let usage = l.usage(0).unwrap();
        assert_eq!(usage.total_bytes, 600);
        assert!(usage.used_bytes <= usage.total_bytes);
        assert!(!l.try_reserve(0, "b", 1));

        l.release(0, "a");
        l.register_device(0, 400);
        assert_eq!(l.usage(0).unwrap().total_bytes, 400);
    }
}
