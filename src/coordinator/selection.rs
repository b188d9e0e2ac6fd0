//! Picking a worker for a task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{SelectionPolicy, WorkerEndpoint};
use crate::error::DispatchError;
use crate::task::WorkerType;

/// The configured workers plus the policy for `auto` tasks.
pub struct WorkerRegistry {
    workers: Vec<WorkerEndpoint>,
    policy: SelectionPolicy,
    next: AtomicUsize,
}

impl WorkerRegistry {
    pub fn new(workers: Vec<WorkerEndpoint>, policy: SelectionPolicy) -> Self {
        Self {
            workers,
            policy,
            next: AtomicUsize::new(0),
        }
    }

    pub fn workers(&self) -> &[WorkerEndpoint] {
        &self.workers
    }

    pub fn get(&self, name: &str) -> Option<&WorkerEndpoint> {
        self.workers.iter().find(|w| w.name == name)
    }

    /// Resolve `worker_type` to a configured worker.
    ///
    /// `active` holds the dispatched/running task count per location and is
    /// only consulted by [`SelectionPolicy::LeastLoaded`].
    pub fn select(
        &self,
        worker_type: &WorkerType,
        active: &HashMap<String, usize>,
    ) -> Result<&WorkerEndpoint, DispatchError> {
        if self.workers.is_empty() {
            return Err(DispatchError::NoWorkers);
        }
        match worker_type {
            WorkerType::Named(name) => self
                .get(name)
                .ok_or_else(|| DispatchError::UnknownWorker(name.clone())),
            WorkerType::Auto => Ok(match self.policy {
                SelectionPolicy::LeastLoaded => self.least_loaded(active),
                SelectionPolicy::RoundRobin => {
                    let i = self.next.fetch_add(1, Ordering::Relaxed);
                    &self.workers[i % self.workers.len()]
                }
            }),
        }
    }

    /// Ties go to the earliest configured worker.
    fn least_loaded(&self, active: &HashMap<String, usize>) -> &WorkerEndpoint {
        let mut best = &self.workers[0];
        let mut best_load = active.get(&best.name).copied().unwrap_or(0);
        for worker in &self.workers[1..] {
            let load = active.get(&worker.name).copied().unwrap_or(0);
            if load < best_load {
                best = worker;
                best_load = load;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(policy: SelectionPolicy) -> WorkerRegistry {
        WorkerRegistry::new(
            vec![
                WorkerEndpoint::new("mac", "http://mac:8081"),
                WorkerEndpoint::new("vm", "http://vm:8081"),
                WorkerEndpoint::new("pi", "http://pi:8081"),
            ],
            policy,
        )
    }

    #[test]
    fn least_loaded_picks_idle_worker() {
        let reg = registry(SelectionPolicy::LeastLoaded);
        let active = HashMap::from([("mac".to_string(), 3), ("vm".to_string(), 1)]);
        assert_eq!(reg.select(&WorkerType::Auto, &active).unwrap().name, "pi");
    }

    #[test]
    fn least_loaded_ties_go_to_first() {
        let reg = registry(SelectionPolicy::LeastLoaded);
        assert_eq!(
            reg.select(&WorkerType::Auto, &HashMap::new()).unwrap().name,
            "mac"
        );
    }

    #[test]
    fn round_robin_cycles() {
        let reg = registry(SelectionPolicy::RoundRobin);
        let picks: Vec<String> = (0..4)
            .map(|_| reg.select(&WorkerType::Auto, &HashMap::new()).unwrap().name.clone())
            .collect();
        assert_eq!(picks, vec!["mac", "vm", "pi", "mac"]);
    }

    #[test]
    fn named_worker_must_exist() {
        let reg = registry(SelectionPolicy::LeastLoaded);
        assert_eq!(
            reg.select(&WorkerType::Named("vm".into()), &HashMap::new())
                .unwrap()
                .name,
            "vm"
        );
        assert!(matches!(
            reg.select(&WorkerType::Named("laptop".into()), &HashMap::new()),
            Err(DispatchError::UnknownWorker(name)) if name == "laptop"
        ));
    }

    #[test]
    fn empty_registry_has_no_workers() {
        let reg = WorkerRegistry::new(Vec::new(), SelectionPolicy::LeastLoaded);
        assert!(matches!(
            reg.select(&WorkerType::Auto, &HashMap::new()),
            Err(DispatchError::NoWorkers)
        ));
    }
}
