//! NBD port pool.
//!
//! Leases TCP ports from a fixed inclusive range. All mutations serialize
//! on a write lock; reads share a read lock. Nothing is persisted; the
//! table is rebuilt from live process state at startup.

use crate::error::{NbdError, NbdResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One leased port.
#[derive(Debug, Clone, Serialize)]
pub struct PortAllocation {
    pub port: u16,
    pub job_id: String,
    pub vm_name: String,
    pub export_name: String,
    pub allocated_at: DateTime<Utc>,
}

/// Occupancy snapshot of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PortPoolStats {
    pub allocated: usize,
    pub capacity: usize,
    pub utilization_percent: f64,
    /// Age in seconds of each leased port.
    pub port_ages_secs: BTreeMap<u16, i64>,
}

/// Fixed-range port allocator.
pub struct PortAllocator {
    min: u16,
    max: u16,
    allocations: Arc<RwLock<BTreeMap<u16, PortAllocation>>>,
}

impl PortAllocator {
    /// Create an allocator over the inclusive range `[min, max]`.
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            allocations: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Lease the smallest free port for a job.
    pub async fn allocate(
        &self,
        job_id: impl Into<String>,
        vm_name: impl Into<String>,
        export_name: impl Into<String>,
    ) -> NbdResult<u16> {
        let mut allocations = self.allocations.write().await;

        let port = (self.min..=self.max)
            .find(|p| !allocations.contains_key(p))
            .ok_or(NbdError::NoPortsAvailable {
                min: self.min,
                max: self.max,
            })?;

        let allocation = PortAllocation {
            port,
            job_id: job_id.into(),
            vm_name: vm_name.into(),
            export_name: export_name.into(),
            allocated_at: Utc::now(),
        };

        debug!(port, job_id = %allocation.job_id, "allocated NBD port");
        allocations.insert(port, allocation);

        Ok(port)
    }

    /// Re-register a port observed in live process state during recovery.
    pub async fn adopt(&self, allocation: PortAllocation) -> NbdResult<()> {
        if allocation.port < self.min || allocation.port > self.max {
            return Err(NbdError::PortOutOfRange(allocation.port));
        }

        let mut allocations = self.allocations.write().await;
        allocations.insert(allocation.port, allocation);
        Ok(())
    }

    /// Release a port. Unknown ports are a warning, not an error.
    pub async fn release(&self, port: u16) {
        let mut allocations = self.allocations.write().await;
        if allocations.remove(&port).is_none() {
            warn!(port, "release of unallocated NBD port");
        } else {
            debug!(port, "released NBD port");
        }
    }

    /// Release every port owned by a job; returns the count released.
    pub async fn release_by_job(&self, job_id: &str) -> usize {
        let mut allocations = self.allocations.write().await;
        let ports: Vec<u16> = allocations
            .values()
            .filter(|a| a.job_id == job_id)
            .map(|a| a.port)
            .collect();

        for port in &ports {
            allocations.remove(port);
        }

        if !ports.is_empty() {
            debug!(job_id, count = ports.len(), "released NBD ports for job");
        }

        ports.len()
    }

    /// Allocation for a specific port.
    pub async fn get(&self, port: u16) -> Option<PortAllocation> {
        self.allocations.read().await.get(&port).cloned()
    }

    /// All current allocations.
    pub async fn list(&self) -> Vec<PortAllocation> {
        self.allocations.read().await.values().cloned().collect()
    }

    /// Pool capacity.
    pub fn capacity(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    /// Occupancy snapshot.
    pub async fn stats(&self) -> PortPoolStats {
        let allocations = self.allocations.read().await;
        let now = Utc::now();
        let capacity = self.capacity();

        PortPoolStats {
            allocated: allocations.len(),
            capacity,
            utilization_percent: allocations.len() as f64 / capacity as f64 * 100.0,
            port_ages_secs: allocations
                .iter()
                .map(|(port, a)| (*port, (now - a.allocated_at).num_seconds()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocates_smallest_free_port() {
        let allocator = PortAllocator::new(10100, 10102);
        let p1 = allocator.allocate("job-1", "vm-a", "exp-a").await.unwrap();
        let p2 = allocator.allocate("job-2", "vm-b", "exp-b").await.unwrap();
        assert_eq!(p1, 10100);
        assert_eq!(p2, 10101);

        allocator.release(p1).await;
        let p3 = allocator.allocate("job-3", "vm-c", "exp-c").await.unwrap();
        assert_eq!(p3, 10100);
    }

    #[tokio::test]
    async fn test_exhaustion_leaves_pool_unchanged() {
        let allocator = PortAllocator::new(10100, 10101);
        allocator.allocate("job-1", "vm", "e1").await.unwrap();
        allocator.allocate("job-2", "vm", "e2").await.unwrap();

        let err = allocator.allocate("job-3", "vm", "e3").await.unwrap_err();
        assert!(matches!(err, NbdError::NoPortsAvailable { .. }));
        assert_eq!(allocator.stats().await.allocated, 2);
    }

    #[tokio::test]
    async fn test_concurrent_allocation_is_exclusive() {
        let allocator = Arc::new(PortAllocator::new(10100, 10102));

        let mut handles = Vec::new();
        for i in 0..4 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator
                    .allocate(format!("job-{}", i), "vm", format!("exp-{}", i))
                    .await
            }));
        }

        let mut ports = Vec::new();
        let mut failures = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(port) => ports.push(port),
                Err(NbdError::NoPortsAvailable { .. }) => failures += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 3, "three distinct ports leased");
        assert_eq!(failures, 1, "fourth allocation exhausts the pool");

        // Releasing one lets a retry succeed.
        allocator.release(ports[0]).await;
        assert!(allocator.allocate("job-r", "vm", "exp-r").await.is_ok());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let allocator = PortAllocator::new(10100, 10100);
        let port = allocator.allocate("job-1", "vm", "e").await.unwrap();
        allocator.release(port).await;
        // Second release warns but must not panic or error.
        allocator.release(port).await;
        assert_eq!(allocator.stats().await.allocated, 0);
    }

    #[tokio::test]
    async fn test_release_by_job() {
        let allocator = PortAllocator::new(10100, 10105);
        allocator.allocate("job-1", "vm", "e0").await.unwrap();
        allocator.allocate("job-1", "vm", "e1").await.unwrap();
        allocator.allocate("job-2", "vm", "e2").await.unwrap();

        assert_eq!(allocator.release_by_job("job-1").await, 2);
        assert_eq!(allocator.stats().await.allocated, 1);
        assert_eq!(allocator.release_by_job("job-1").await, 0);
    }

    #[tokio::test]
    async fn test_stats_utilization() {
        let allocator = PortAllocator::new(10100, 10103);
        allocator.allocate("job-1", "vm", "e").await.unwrap();
        let stats = allocator.stats().await;
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.allocated, 1);
        assert!((stats.utilization_percent - 25.0).abs() < f64::EPSILON);
        assert!(stats.port_ages_secs.contains_key(&10100));
    }

    #[tokio::test]
    async fn test_adopt_rejects_out_of_range() {
        let allocator = PortAllocator::new(10100, 10102);
        let err = allocator
            .adopt(PortAllocation {
                port: 9000,
                job_id: "job".into(),
                vm_name: "vm".into(),
                export_name: "e".into(),
                allocated_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NbdError::PortOutOfRange(9000)));
    }
}
