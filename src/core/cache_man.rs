//! Memory budget and request epochs shared by every cache.
//!
//! The frame cache and the stream manager both account decoded frames here;
//! when the budget is exceeded the frame cache evicts LRU buffers. The epoch
//! counter is bumped by the stream manager when a scrub jumps, so queued
//! decode requests for the old position are dropped by [`Workers`](super::Workers).

use log::{debug, info};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use sysinfo::System;

#[derive(Debug)]
pub struct CacheManager {
    /// Bytes currently accounted
    memory_usage: AtomicUsize,
    max_memory_bytes: AtomicUsize,
    current_epoch: Arc<AtomicU64>,
}

/// `mem_fraction` of available memory after keeping `reserve_gb` for the system.
fn memory_limit(mem_fraction: f64, reserve_gb: f64) -> (usize, usize, usize) {
    let mut sys = System::new();
    sys.refresh_memory();
    let available = sys.available_memory() as usize;
    let reserve = (reserve_gb * 1024.0 * 1024.0 * 1024.0) as usize;
    let usable = available.saturating_sub(reserve);
    (available, reserve, (usable as f64 * mem_fraction) as usize)
}

impl CacheManager {
    pub fn new(mem_fraction: f64, reserve_gb: f64) -> Self {
        let (available, reserve, limit) = memory_limit(mem_fraction, reserve_gb);
        info!(
            "CacheManager init: available={} MB, reserve={} MB, limit={} MB ({}%)",
            available / 1024 / 1024,
            reserve / 1024 / 1024,
            limit / 1024 / 1024,
            (mem_fraction * 100.0) as u32
        );
        Self::with_limit(limit)
    }

    /// Fixed budget in bytes, independent of the host.
    pub fn with_limit(max_memory_bytes: usize) -> Self {
        Self {
            memory_usage: AtomicUsize::new(0),
            max_memory_bytes: AtomicUsize::new(max_memory_bytes),
            current_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bump the epoch, cancelling every queued request. Returns the new epoch.
    pub fn increment_epoch(&self) -> u64 {
        let new_epoch = self.current_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Epoch incremented: {}", new_epoch);
        new_epoch
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    /// Shared epoch counter for [`Workers`](super::Workers).
    pub fn epoch_ref(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.current_epoch)
    }

    pub fn check_memory_limit(&self) -> bool {
        self.memory_usage.load(Ordering::Relaxed) > self.max_memory_bytes.load(Ordering::Relaxed)
    }

    /// (usage, limit) in bytes
    pub fn mem(&self) -> (usize, usize) {
        (
            self.memory_usage.load(Ordering::Relaxed),
            self.max_memory_bytes.load(Ordering::Relaxed),
        )
    }

    pub fn mem_usage_fraction(&self) -> f64 {
        let (usage, limit) = self.mem();
        if limit == 0 { 0.0 } else { usage as f64 / limit as f64 }
    }

    pub fn add_memory(&self, bytes: usize) {
        let new_usage = self.memory_usage.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let limit = self.max_memory_bytes.load(Ordering::Relaxed);
        if new_usage > limit {
            debug!(
                "Memory limit exceeded: {} MB / {} MB",
                new_usage / 1024 / 1024,
                limit / 1024 / 1024
            );
        }
    }

    /// Saturating: never underflows on double free.
    pub fn free_memory(&self, bytes: usize) {
        let _ = self
            .memory_usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some(cur.saturating_sub(bytes)));
    }

    pub fn set_memory_limit(&self, mem_fraction: f64, reserve_gb: f64) {
        let (_, _, limit) = memory_limit(mem_fraction, reserve_gb);
        self.max_memory_bytes.store(limit, Ordering::Relaxed);
        info!(
            "Memory limit updated: {} MB ({}%)",
            limit / 1024 / 1024,
            (mem_fraction * 100.0) as u32
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_manager_creation() {
        let manager = CacheManager::new(0.5, 1.0);
        assert_eq!(manager.current_epoch(), 0);
        assert_eq!(manager.mem().0, 0);
    }

    #[test]
    fn test_epoch_increment() {
        let manager = CacheManager::with_limit(1024);
        assert_eq!(manager.increment_epoch(), 1);
        assert_eq!(manager.increment_epoch(), 2);
        assert_eq!(manager.epoch_ref().load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_memory_tracking() {
        let manager = CacheManager::with_limit(1024 * 1024);
        manager.add_memory(1024 * 1024);
        assert!(!manager.check_memory_limit());
        manager.add_memory(1);
        assert!(manager.check_memory_limit());

        manager.free_memory(512 * 1024);
        assert_eq!(manager.mem().0, 512 * 1024 + 1);
        manager.free_memory(usize::MAX);
        assert_eq!(manager.mem().0, 0);
    }
}
