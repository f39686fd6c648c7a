use std::sync::Arc;
use std::time::Duration;

use crate::device::{FenceStatus, GpuBackend};
use crate::error::{Error, Result};

use super::ByteRange;

/// Who waits on a fence before a locked range is reused.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitStrategy {
    /// The CPU writes the range, so the CPU must wait for the device.
    CpuDriven,
    /// The device itself writes the range; only its queue needs to wait.
    GpuDriven,
}

/// Lock manager configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Wait policy, fixed for the manager's lifetime.
    pub strategy: WaitStrategy,

    /// Timeout of each blocking wait once the initial poll missed.
    pub long_timeout: Duration,

    /// Give up after this many consecutive long timeouts on one fence.
    ///
    /// `None` retries until the device makes progress.
    pub max_timeouts: Option<u32>,
}

impl LockConfig {
    pub fn gpu_driven() -> Self {
        Self {
            strategy: WaitStrategy::GpuDriven,
            ..Self::default()
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            strategy: WaitStrategy::CpuDriven,
            long_timeout: Duration::from_secs(1),
            max_timeouts: None,
        }
    }
}

/// A byte range the device may still be reading, and the fence that ends it.
#[derive(Debug)]
pub struct Lock<F> {
    pub range: ByteRange,
    pub fence: F,
}

/// Bookkeeping of fences protecting ranges of one buffer.
///
/// Every write into a previously locked range must be preceded by
/// [`wait_for_range`](Self::wait_for_range); every range handed to the device
/// must be followed by [`lock_range`](Self::lock_range) once the commands
/// reading it have been recorded. Locks on disjoint ranges never wait on each
/// other.
pub struct LockManager<D: GpuBackend> {
    device: Arc<D>,
    config: LockConfig,
    locks: Vec<Lock<D::Fence>>,
    poisoned: bool,
}

/// Shortest blocking wait; a zero timeout would only ever poll.
pub const MIN_LONG_TIMEOUT: Duration = Duration::from_micros(1);

impl<D: GpuBackend> LockManager<D> {
    pub fn new(device: Arc<D>, mut config: LockConfig) -> Self {
        if config.long_timeout < MIN_LONG_TIMEOUT {
            log::warn!(
                "LockManager: long timeout {:?} raised to {MIN_LONG_TIMEOUT:?}",
                config.long_timeout
            );
            config.long_timeout = MIN_LONG_TIMEOUT;
        }
        Self {
            device,
            config,
            locks: Vec::new(),
            poisoned: false,
        }
    }

    /// Number of outstanding locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// True once a fence wait failed; the protected memory can no longer be trusted.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Ranges still protected by a fence, oldest first.
    pub fn outstanding(&self) -> impl Iterator<Item = ByteRange> + '_ {
        self.locks.iter().map(|lock| lock.range)
    }

    /// Fences `range` after every command recorded so far.
    pub fn lock_range(&mut self, range: ByteRange) -> Result<()> {
        self.check_usable()?;
        if range.is_empty() {
            return Ok(());
        }

        match self.device.insert_fence() {
            Ok(fence) => {
                self.locks.push(Lock { range, fence });
                Ok(())
            }
            Err(err) => {
                // The range is now in use by the device with nothing to wait on.
                self.poisoned = true;
                Err(Error::FenceInsert { range, source: err })
            }
        }
    }

    /// Waits for and releases every lock overlapping `range`.
    pub fn wait_for_range(&mut self, range: ByteRange) -> Result<()> {
        self.check_usable()?;
        if range.is_empty() {
            return Ok(());
        }

        let mut index = 0;
        while index < self.locks.len() {
            if !self.locks[index].range.overlaps(&range) {
                index += 1;
                continue;
            }
            let lock = self.locks.remove(index);
            self.discharge(lock)?;
        }
        Ok(())
    }

    /// Waits for and releases every outstanding lock.
    ///
    /// Fences are always destroyed, even after a failure; the first error is returned.
    pub fn wait_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for lock in std::mem::take(&mut self.locks) {
            if self.poisoned {
                self.device.destroy_fence(lock.fence);
                continue;
            }
            if let Err(err) = self.discharge(lock) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::Poisoned);
        }
        Ok(())
    }

    fn discharge(&mut self, lock: Lock<D::Fence>) -> Result<()> {
        let result = self.wait(&lock);
        self.device.destroy_fence(lock.fence);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn wait(&self, lock: &Lock<D::Fence>) -> Result<()> {
        let fence_error = |source| Error::FenceWait {
            range: lock.range,
            source,
        };

        match self.config.strategy {
            WaitStrategy::CpuDriven => {
                // First a free poll; most fences are long signaled by the time a
                // ring laps around to them.
                let mut flush = false;
                let mut timeout = Duration::ZERO;
                let mut timeouts = 0u32;

                loop {
                    match self.device.client_wait(&lock.fence, flush, timeout) {
                        Ok(FenceStatus::Signaled) => return Ok(()),
                        Ok(FenceStatus::TimedOut) => {}
                        Err(source) => return Err(fence_error(source)),
                    }

                    if flush {
                        timeouts += 1;
                        log::warn!(
                            "fence for bytes {} still pending after {:?} (long wait #{timeouts})",
                            lock.range,
                            timeout
                        );
                        if self.config.max_timeouts.is_some_and(|max| timeouts >= max) {
                            return Err(Error::FenceTimeout {
                                range: lock.range,
                                timeouts,
                            });
                        }
                    }

                    flush = true;
                    timeout = self.config.long_timeout;
                }
            }
            WaitStrategy::GpuDriven => self.device.block_device_on(&lock.fence).map_err(fence_error),
        }
    }
}

impl<D: GpuBackend> Drop for LockManager<D> {
    fn drop(&mut self) {
        if let Err(err) = self.wait_all() {
            log::error!("LockManager: releasing outstanding locks failed: {err}");
        }
    }
}
