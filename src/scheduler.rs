//! Cooperative scheduler for sliced executions
//!
//! Executions spawned on a [`LuaVM`] run a bounded number of instructions
//! per slice. Between slices the scheduler yields to the tokio event loop
//! and checks the wall-clock deadline.

use crate::config::SchedulerConfig;
use crate::error::{LuaError, Result};
use crate::value::Value;
use crate::vm::{LuaVM, Slice};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Drives parked executions to completion
#[derive(Debug, Clone)]
pub struct Scheduler {
    /// Instruction budget of one slice
    pub slice_size: u64,

    /// Wall-clock limit per execution
    pub timeout: Option<Duration>,
}

impl Scheduler {
    /// Create a scheduler
    pub fn new(slice_size: u64, timeout: Option<Duration>) -> Self {
        Scheduler {
            slice_size: slice_size.max(1),
            timeout,
        }
    }

    /// Create a scheduler from configuration
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.slice_size, config.timeout())
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    /// Run one execution to completion
    pub async fn run(&self, vm: &mut LuaVM, id: Uuid) -> Result<Vec<Value>> {
        let deadline = self.deadline();
        let kill_flag = vm.kill_flag();
        let mut slices = 0u64;

        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    vm.cancel(id);
                    warn!(execution = %id, slices, "execution timed out");
                    return Err(LuaError::Timeout);
                }
            }
            if kill_flag.swap(false, Ordering::Relaxed) {
                vm.cancel(id);
                warn!(execution = %id, slices, "execution killed");
                return Err(LuaError::Killed);
            }

            match vm.resume(id, self.slice_size)? {
                Slice::Complete(results) => {
                    debug!(execution = %id, slices, "execution finished");
                    return Ok(results);
                }
                Slice::Suspended => {
                    slices += 1;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Run several executions round robin
    ///
    /// Every id gets an entry in the result map. A failing execution does not
    /// stop the others.
    pub async fn run_all(
        &self,
        vm: &mut LuaVM,
        ids: &[Uuid],
    ) -> HashMap<Uuid, Result<Vec<Value>>> {
        let mut results = HashMap::new();
        let mut queue: VecDeque<(Uuid, Option<Instant>)> =
            ids.iter().map(|id| (*id, self.deadline())).collect();

        while let Some((id, deadline)) = queue.pop_front() {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                vm.cancel(id);
                warn!(execution = %id, "execution timed out");
                results.insert(id, Err(LuaError::Timeout));
                continue;
            }

            match vm.resume(id, self.slice_size) {
                Ok(Slice::Suspended) => queue.push_back((id, deadline)),
                Ok(Slice::Complete(values)) => {
                    results.insert(id, Ok(values));
                }
                Err(err) => {
                    results.insert(id, Err(err));
                }
            }
            tokio::task::yield_now().await;
        }
        results
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let config = SchedulerConfig {
            slice_size: 0,
            timeout_ms: 30,
        };
        let scheduler = Scheduler::from_config(&config);
        assert_eq!(scheduler.slice_size, 1);
        assert_eq!(scheduler.timeout, Some(Duration::from_millis(30)));
        assert_eq!(Scheduler::default().timeout, None);
    }
}
