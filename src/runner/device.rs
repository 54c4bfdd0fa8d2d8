//! Device assignment and the per-device memory ledger
//!
//! There is no process-wide "current device". A [`DevicePool`] is created per
//! run from a [`DeviceAssignment`]; memory is taken from it through
//! [`Reservation`] guards that give the memory back when dropped.

use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::core::config::PipelineConfig;
use crate::core::error::{Result, SegError};
use crate::core::types::DeviceId;

/// Which devices a run may use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAssignment {
    gpus: Vec<u32>,
    cpu_workers: usize,
}

impl DeviceAssignment {
    /// CPU-only execution with `workers` parallel batch loops
    pub fn cpu(workers: usize) -> Self {
        Self {
            gpus: Vec::new(),
            cpu_workers: workers.max(1),
        }
    }

    /// One batch loop per listed GPU
    pub fn gpus(ids: impl IntoIterator<Item = u32>) -> Self {
        let mut gpus: Vec<u32> = Vec::new();
        for id in ids {
            if !gpus.contains(&id) {
                gpus.push(id);
            }
        }
        Self {
            gpus,
            cpu_workers: 1,
        }
    }

    /// Parse a comma-separated GPU list such as `"0,1"`; empty means CPU
    pub fn parse(gpu_list: &str, cpu_workers: usize) -> Result<Self> {
        let ids: Vec<u32> = gpu_list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u32>()
                    .map_err(|_| SegError::Config(format!("invalid GPU id '{}' in '{}'", s, gpu_list)))
            })
            .collect::<Result<_>>()?;
        if ids.is_empty() {
            Ok(Self::cpu(cpu_workers))
        } else {
            Ok(Self::gpus(ids))
        }
    }

    pub fn is_cpu_only(&self) -> bool {
        self.gpus.is_empty()
    }

    /// Distinct devices models get loaded on
    pub fn devices(&self) -> Vec<DeviceId> {
        if self.gpus.is_empty() {
            vec![DeviceId::Cpu]
        } else {
            self.gpus.iter().map(|&id| DeviceId::Gpu(id)).collect()
        }
    }

    /// Parallel batch loops per device
    pub fn workers_per_device(&self) -> usize {
        if self.gpus.is_empty() {
            self.cpu_workers
        } else {
            1
        }
    }

    pub fn worker_count(&self) -> usize {
        self.devices().len() * self.workers_per_device()
    }
}

#[derive(Debug)]
struct Ledger {
    capacity: u64,
    used: u64,
}

/// Memory budget bookkeeping for every assigned device
#[derive(Debug)]
pub struct DevicePool {
    ledgers: Mutex<AHashMap<DeviceId, Ledger>>,
}

impl DevicePool {
    pub fn new(assignment: &DeviceAssignment, config: &PipelineConfig) -> Arc<Self> {
        let ledgers = assignment
            .devices()
            .into_iter()
            .map(|device| {
                let capacity = if device.is_gpu() {
                    config.gpu_memory_bytes
                } else {
                    config.cpu_memory_bytes
                };
                (device, Ledger { capacity, used: 0 })
            })
            .collect();
        Arc::new(Self {
            ledgers: Mutex::new(ledgers),
        })
    }

    /// Pool with explicit per-device capacities
    pub fn with_capacities(capacities: impl IntoIterator<Item = (DeviceId, u64)>) -> Arc<Self> {
        let ledgers = capacities
            .into_iter()
            .map(|(device, capacity)| (device, Ledger { capacity, used: 0 }))
            .collect();
        Arc::new(Self {
            ledgers: Mutex::new(ledgers),
        })
    }

    /// Free bytes on a device (0 for unknown devices)
    pub fn available(&self, device: DeviceId) -> u64 {
        self.ledgers
            .lock()
            .get(&device)
            .map(|l| l.capacity.saturating_sub(l.used))
            .unwrap_or(0)
    }

    pub fn used(&self, device: DeviceId) -> u64 {
        self.ledgers.lock().get(&device).map(|l| l.used).unwrap_or(0)
    }

    /// Take `bytes` from `device`, failing with a resource-exhaustion error
    ///
    /// `batch_size` is only used to describe the failure.
    pub fn reserve(self: &Arc<Self>, device: DeviceId, bytes: u64, batch_size: usize) -> Result<Reservation> {
        let mut ledgers = self.ledgers.lock();
        let ledger = ledgers.get_mut(&device).ok_or_else(|| {
            SegError::Config(format!("device {} is not part of this run's assignment", device))
        })?;
        let available = ledger.capacity.saturating_sub(ledger.used);
        if bytes > available {
            return Err(SegError::ResourceExhaustion {
                device,
                batch_size,
                required_bytes: bytes,
                available_bytes: available,
            });
        }
        ledger.used += bytes;
        Ok(Reservation {
            pool: Arc::clone(self),
            device,
            bytes,
        })
    }

    fn release(&self, device: DeviceId, bytes: u64) {
        if let Some(ledger) = self.ledgers.lock().get_mut(&device) {
            ledger.used = ledger.used.saturating_sub(bytes);
        }
    }
}

/// Memory held on a device until the guard is dropped
#[derive(Debug)]
pub struct Reservation {
    pool: Arc<DevicePool>,
    device: DeviceId,
    bytes: u64,
}

impl Reservation {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pool.release(self.device, self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_list() {
        let assignment = DeviceAssignment::parse("0, 1,1", 4).unwrap();
        assert_eq!(assignment.devices(), vec![DeviceId::Gpu(0), DeviceId::Gpu(1)]);
        assert_eq!(assignment.worker_count(), 2);

        let cpu = DeviceAssignment::parse("", 4).unwrap();
        assert!(cpu.is_cpu_only());
        assert_eq!(cpu.devices(), vec![DeviceId::Cpu]);
        assert_eq!(cpu.worker_count(), 4);

        assert!(DeviceAssignment::parse("0,x", 1).is_err());
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let pool = DevicePool::with_capacities([(DeviceId::Gpu(0), 100)]);
        {
            let _weights = pool.reserve(DeviceId::Gpu(0), 60, 1).unwrap();
            assert_eq!(pool.available(DeviceId::Gpu(0)), 40);

            let err = pool.reserve(DeviceId::Gpu(0), 50, 2).unwrap_err();
            match err {
                SegError::ResourceExhaustion {
                    device,
                    batch_size,
                    available_bytes,
                    ..
                } => {
                    assert_eq!(device, DeviceId::Gpu(0));
                    assert_eq!(batch_size, 2);
                    assert_eq!(available_bytes, 40);
                }
                other => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(pool.available(DeviceId::Gpu(0)), 100);
    }

    #[test]
    fn test_unknown_device_rejected() {
        let pool = DevicePool::with_capacities([(DeviceId::Cpu, 100)]);
        assert!(matches!(
            pool.reserve(DeviceId::Gpu(3), 1, 1),
            Err(SegError::Config(_))
        ));
    }
}
