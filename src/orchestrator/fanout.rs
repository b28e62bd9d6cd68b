//! Per-folder units run concurrently on named threads and joined together.
//!
//! Every unit reports `(index, result)` on one channel. A join either waits
//! for all of them (`settle`) or returns on the first failure (`fail_fast`).
//! Units are never cancelled: whatever is still running when a join returns
//! is handed to a drain thread that logs each late outcome.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};

use crate::error::SandboxError;

type Report<T> = (usize, Result<T, SandboxError>);

/// A set of running units.
pub struct FanOut<T> {
    labels: Vec<String>,
    results: Vec<Option<Result<T, SandboxError>>>,
    rx: Receiver<Report<T>>,
}

impl<T: Send + 'static> FanOut<T> {
    /// Start one thread per `(label, work)` pair.
    pub fn spawn<F>(units: impl IntoIterator<Item = (String, F)>) -> Self
    where
        F: FnOnce() -> Result<T, SandboxError> + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let mut labels = Vec::new();
        let mut results = Vec::new();

        for (index, (label, work)) in units.into_iter().enumerate() {
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("unit-{}", label))
                .spawn(move || {
                    let _ = tx.send((index, work()));
                });
            results.push(match spawned {
                Ok(_) => None,
                Err(e) => {
                    log::error!("Failed to start unit {}: {}", label, e);
                    Some(Err(SandboxError::Io(e)))
                }
            });
            labels.push(label);
        }

        Self {
            labels,
            results,
            rx,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn pending(&self) -> Vec<usize> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    fn first_pending(&self) -> Option<usize> {
        self.results.iter().position(Option::is_none)
    }

    fn next_report(&self, deadline: Instant) -> Result<Report<T>, RecvTimeoutError> {
        self.rx.recv_deadline(deadline)
    }

    /// Wait for every unit, up to `timeout` in total.
    ///
    /// Results come back in spawn order. Units still running at the deadline
    /// are reported as `TimedOut`.
    pub fn settle(mut self, timeout: Duration) -> Vec<(String, Result<T, SandboxError>)> {
        let deadline = Instant::now() + timeout;

        while self.first_pending().is_some() {
            match self.next_report(deadline) {
                Ok((index, result)) => self.results[index] = Some(result),
                Err(RecvTimeoutError::Timeout) => {
                    self.drain(|label| log::warn!("{} still running after {:?}", label, timeout));
                    for index in self.pending() {
                        self.results[index] = Some(Err(SandboxError::TimedOut {
                            label: self.labels[index].clone(),
                            timeout,
                        }));
                    }
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    for index in self.pending() {
                        self.results[index] =
                            Some(Err(SandboxError::UnitLost(self.labels[index].clone())));
                    }
                    break;
                }
            }
        }

        self.labels
            .into_iter()
            .zip(self.results)
            .map(|(label, result)| {
                let result = result.unwrap_or_else(|| Err(SandboxError::UnitLost(label.clone())));
                (label, result)
            })
            .collect()
    }

    /// Wait until every unit succeeds or the first one fails.
    ///
    /// The first failure is returned tagged with its unit's label; the other
    /// units keep running in the background.
    pub fn fail_fast(mut self, timeout: Duration) -> Result<Vec<(String, T)>, SandboxError> {
        let deadline = Instant::now() + timeout;

        let failed_early = self
            .results
            .iter()
            .position(|r| matches!(r, Some(Err(_))));
        if let Some(index) = failed_early {
            return Err(self.abandon(index));
        }

        while let Some(first_pending) = self.first_pending() {
            match self.next_report(deadline) {
                Ok((index, Ok(value))) => self.results[index] = Some(Ok(value)),
                Ok((index, Err(e))) => {
                    self.results[index] = Some(Err(e));
                    return Err(self.abandon(index));
                }
                Err(RecvTimeoutError::Timeout) => {
                    let label = self.labels[first_pending].clone();
                    self.drain(|label| log::warn!("{} still running after {:?}", label, timeout));
                    return Err(SandboxError::TimedOut { label, timeout });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SandboxError::UnitLost(self.labels[first_pending].clone()));
                }
            }
        }

        Ok(self
            .labels
            .into_iter()
            .zip(self.results)
            .filter_map(|(label, result)| match result {
                Some(Ok(value)) => Some((label, value)),
                _ => None,
            })
            .collect())
    }

    /// Take the error of unit `index` and leave the rest to the drain thread.
    fn abandon(&mut self, index: usize) -> SandboxError {
        let label = self.labels[index].clone();
        let error = match self.results[index].take() {
            Some(Err(e)) => e,
            _ => SandboxError::UnitLost(label.clone()),
        };
        // Keep the slot filled so the drain does not wait for it.
        self.results[index] = Some(Err(SandboxError::UnitLost(label.clone())));
        log::error!("{} failed: {}", label, error);
        self.drain(|label| log::info!("Not waiting for {}", label));
        error.in_unit(label)
    }

    /// Log the outcome of every still-pending unit from a background thread.
    fn drain(&self, note: impl Fn(&str)) {
        let pending: Vec<(usize, String)> = self
            .pending()
            .into_iter()
            .map(|index| (index, self.labels[index].clone()))
            .collect();
        if pending.is_empty() {
            return;
        }
        for (_, label) in &pending {
            note(label);
        }

        let rx = self.rx.clone();
        let spawned = thread::Builder::new()
            .name("unit-drain".to_string())
            .spawn(move || {
                let mut remaining = pending;
                while !remaining.is_empty() {
                    let Ok((index, result)) = rx.recv() else {
                        for (_, label) in &remaining {
                            log::warn!("{} stopped without reporting a result", label);
                        }
                        return;
                    };
                    let Some(at) = remaining.iter().position(|(i, _)| *i == index) else {
                        continue;
                    };
                    let (_, label) = remaining.swap_remove(at);
                    match result {
                        Ok(_) => log::info!("{} finished in the background", label),
                        Err(e) => log::error!("{} failed in the background: {}", label, e),
                    }
                }
            });
        if let Err(e) = spawned {
            log::warn!("Failed to start drain thread: {}", e);
        }
    }
}
