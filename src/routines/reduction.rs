use std::sync::{Arc, Barrier, Mutex, PoisonError};

use ndarray::ArrayView1;
use rayon::prelude::*;
use serde::Serialize;

/// Collective operations over the workers that hold the partitions of a field
///
/// Every worker must call the reductions in the same order, since they block until all ranks
/// have contributed. Only the coordinator writes files or prints progress.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Sum `local` over all ranks, every rank receives the same total
    fn all_reduce_sum(&self, local: f64) -> f64;

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }
}

/// A single process owning every degree of freedom
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, local: f64) -> f64 {
        local
    }
}

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<f64>>,
}

/// In-process worker group, one handle per thread
///
/// Contributions are summed in rank order so every rank sees a bit-identical total. This is
/// a harness for exercising partitioned fields in tests and demos, not a transport between
/// processes; distributed runs implement [Communicator] over their own message layer.
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadComm {
    /// Create `size` connected handles, the handle at position `i` has rank `i`
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![0.0; size]),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn all_reduce_sum(&self, local: f64) -> f64 {
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slots[self.rank] = local;
        }
        self.shared.barrier.wait();
        let total = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .sum();
        // Nobody may overwrite a slot before every rank has read the total
        self.shared.barrier.wait();
        total
    }
}

/// Mean and standard deviation of a control field over all of its degrees of freedom
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlSummary {
    pub mean: f64,
    pub std: f64,
}

fn local_sum(values: &ArrayView1<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sum()
}

fn local_squared_deviation(values: &ArrayView1<f64>, mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| (v - mean) * (v - mean)).sum()
}

/// Two-pass collective summary of a partitioned field
///
/// The global mean is reduced first, then the squared deviations from that global mean. A rank
/// holding no local values contributes zero to both sums. `global_len` is the total number of
/// degrees of freedom across all ranks.
pub fn summarize(
    local: ArrayView1<f64>,
    global_len: usize,
    comm: &dyn Communicator,
) -> ControlSummary {
    if global_len == 0 {
        return ControlSummary {
            mean: 0.0,
            std: 0.0,
        };
    }
    let n = global_len as f64;
    let mean = comm.all_reduce_sum(local_sum(&local)) / n;
    let variance = comm.all_reduce_sum(local_squared_deviation(&local, mean)) / n;
    ControlSummary {
        mean,
        std: variance.sqrt(),
    }
}

/// Same reduction as [summarize] over partitions held in memory
pub fn summarize_partitions(partitions: &[ArrayView1<f64>]) -> ControlSummary {
    let n: usize = partitions.iter().map(|p| p.len()).sum();
    if n == 0 {
        return ControlSummary {
            mean: 0.0,
            std: 0.0,
        };
    }
    let sum: f64 = partitions.par_iter().map(local_sum).sum();
    let mean = sum / n as f64;
    let squared: f64 = partitions
        .par_iter()
        .map(|p| local_squared_deviation(p, mean))
        .sum();
    ControlSummary {
        mean,
        std: (squared / n as f64).sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};
    use std::thread;

    #[test]
    fn self_comm_matches_population_statistics() {
        let values = array![1.0, 2.0, 3.0, 4.0];
        let summary = summarize(values.view(), values.len(), &SelfComm);
        assert_eq!(summary.mean, 2.5);
        assert!((summary.std - 1.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn empty_partition_contributes_nothing() {
        let left = array![2.0, 4.0];
        let empty: Array1<f64> = Array1::zeros(0);
        let summary = summarize_partitions(&[left.view(), empty.view()]);
        assert_eq!(summary.mean, 3.0);
        assert_eq!(summary.std, 1.0);
    }

    #[test]
    fn zero_length_field_reports_zero() {
        let empty: Array1<f64> = Array1::zeros(0);
        let summary = summarize(empty.view(), 0, &SelfComm);
        assert_eq!(summary.mean, 0.0);
        assert_eq!(summary.std, 0.0);
    }

    #[test]
    fn thread_group_reduces_across_ranks() {
        let partitions = vec![vec![1.0, 2.0, 3.0], vec![], vec![10.0]];
        let handles: Vec<_> = ThreadComm::group(3)
            .into_iter()
            .zip(partitions)
            .map(|(comm, local)| {
                thread::spawn(move || {
                    let local = Array1::from(local);
                    summarize(local.view(), 4, &comm)
                })
            })
            .collect();
        let results: Vec<ControlSummary> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let mean = 16.0 / 4.0;
        let var = ((1.0f64 - mean).powi(2)
            + (2.0f64 - mean).powi(2)
            + (3.0f64 - mean).powi(2)
            + (10.0f64 - mean).powi(2))
            / 4.0;
        for r in &results {
            assert_eq!(r.mean, mean);
            assert!((r.std - var.sqrt()).abs() < 1e-12);
            assert_eq!(r, &results[0]);
        }
    }
}
