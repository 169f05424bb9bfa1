//! Concurrent multi-file analysis driver
//!
//! Schedules archive loads and per-tensor analysis across CPU cores under
//! two gates: a CPU semaphore sized from the core count bounds how many
//! tensor sweeps run at once, and a file-admission bound derived from
//! physical memory caps how many multi-gigabyte archives are mapped
//! concurrently. Results merge append-only into one [`AnalyzedModel`]
//! under a single mutex; completion order across tensors and files is
//! explicitly unspecified.
//!
//! Cancellation is cooperative: a shared flag is polled between files and
//! at the start of every tensor analysis. A sweep that has begun always
//! runs to completion, which keeps the hot loop branch-free.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use regex::Regex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::analyze::{analyze_tensor, AnalyzedModel, AnalyzedTensor};
use crate::error::{MedirError, Result};
use crate::safetensors::SafetensorsFile;

/// Cooperative cancellation flag shared by the driver, its workers and
/// the signal handler.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    /// A fresh, uncancelled flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

const GIB: u64 = 1024 * 1024 * 1024;

/// Driver sizing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Concurrent tensor analyses (the CPU semaphore capacity).
    pub cpu_permits: usize,
    /// Concurrently admitted archive files.
    pub file_permits: usize,
}

impl PipelineConfig {
    /// Size from the running system: CPU count bounded to `[2, 1024]`,
    /// file admission from total physical memory at roughly one file per
    /// 5 GiB, bounded to `[1, 16]`.
    #[must_use]
    pub fn from_system() -> Self {
        let sys = sysinfo::System::new_all();
        Self {
            cpu_permits: clamp_cpus(num_cpus::get()),
            file_permits: file_permits_for(sys.total_memory()),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_system()
    }
}

fn clamp_cpus(n: usize) -> usize {
    n.clamp(2, 1024)
}

/// Safetensors shards tend to run about 4.5 GiB; assume 5 and keep one
/// admission slot of headroom.
#[allow(clippy::cast_possible_truncation)]
fn file_permits_for(total_bytes: u64) -> usize {
    (total_bytes / (5 * GIB)).saturating_sub(1).clamp(1, 16) as usize
}

/// Analyze every tensor whose name matches `filter` across `files`.
///
/// `on_file` is invoked once per completed file with that file's analyzed
/// tensors, in worker-completion order across files; it is where report
/// lines are printed. The returned model aggregates all files.
///
/// # Errors
///
/// The first error from any worker cancels the remaining work and is
/// returned. [`MedirError::Cancelled`] is returned when `cancel` fires
/// before the work is complete.
pub async fn analyze_files<F>(
    files: Vec<PathBuf>,
    filter: Regex,
    config: PipelineConfig,
    cancel: Cancellation,
    on_file: F,
) -> Result<AnalyzedModel>
where
    F: Fn(&Path, &[AnalyzedTensor]) + Send + Sync + 'static,
{
    let cpu = Arc::new(Semaphore::new(config.cpu_permits.max(1)));
    let model = Arc::new(Mutex::new(AnalyzedModel::default()));
    let on_file = Arc::new(on_file);
    let filter = Arc::new(filter);

    // Files flow through a bounded queue so that at most `file_permits`
    // archives are mapped at any moment.
    let (tx, rx) = mpsc::channel::<PathBuf>(config.file_permits.max(1));
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let feeder = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            for f in files {
                if cancel.is_cancelled() {
                    break;
                }
                if tx.send(f).await.is_err() {
                    break;
                }
            }
        })
    };

    let mut workers: JoinSet<Result<()>> = JoinSet::new();
    for _ in 0..config.file_permits.max(1) {
        let rx = Arc::clone(&rx);
        let cpu = Arc::clone(&cpu);
        let cancel = cancel.clone();
        let model = Arc::clone(&model);
        let on_file = Arc::clone(&on_file);
        let filter = Arc::clone(&filter);
        workers.spawn(async move {
            loop {
                let next = { rx.lock().await.recv().await };
                let Some(path) = next else {
                    return Ok(());
                };
                if cancel.is_cancelled() {
                    return Err(MedirError::Cancelled);
                }
                let analyzed = match process_file(&path, &filter, &cpu, &cancel).await {
                    Ok(a) => a,
                    Err(e) => {
                        cancel.cancel();
                        return Err(e);
                    }
                };
                if cancel.is_cancelled() {
                    return Err(MedirError::Cancelled);
                }
                on_file(&path, &analyzed);
                model
                    .lock()
                    .expect("analysis collection mutex poisoned")
                    .tensors
                    .extend(analyzed);
            }
        });
    }
    // The workers hold the only receiver handles now; once they all
    // return, the queue closes and the feeder unblocks.
    drop(rx);

    feeder.await.map_err(|e| MedirError::Io {
        message: format!("file feeder failed: {e}"),
    })?;

    let mut first_err = None;
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if e != MedirError::Cancelled && first_err.is_none() {
                    first_err = Some(e);
                }
            }
            Err(e) => {
                cancel.cancel();
                if first_err.is_none() {
                    first_err = Some(MedirError::Io {
                        message: format!("worker failed: {e}"),
                    });
                }
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(MedirError::Cancelled);
    }
    let model = Arc::try_unwrap(model)
        .map_err(|_| MedirError::Io {
            message: "analysis collection still shared after shutdown".to_string(),
        })?
        .into_inner()
        .expect("analysis collection mutex poisoned");
    Ok(model)
}

/// Open one archive and fan its matching tensors out under the CPU gate.
async fn process_file(
    path: &Path,
    filter: &Regex,
    cpu: &Arc<Semaphore>,
    cancel: &Cancellation,
) -> Result<Vec<AnalyzedTensor>> {
    let opened = {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || SafetensorsFile::open(&path))
            .await
            .map_err(|e| MedirError::Io {
                message: format!("archive open task failed: {e}"),
            })??
    };
    let file = Arc::new(opened);

    let matched: Vec<usize> = file
        .tensors()
        .iter()
        .enumerate()
        .filter(|(_, t)| filter.is_match(&t.name))
        .map(|(i, _)| i)
        .collect();
    info!(
        file = %path.display(),
        num_tensors = file.tensors().len(),
        to_analyze = matched.len(),
        "analyze"
    );

    let mut tasks: JoinSet<Result<(usize, AnalyzedTensor)>> = JoinSet::new();
    for (slot, idx) in matched.iter().copied().enumerate() {
        let file = Arc::clone(&file);
        let cpu = Arc::clone(cpu);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            {
                let t = &file.tensors()[idx];
                debug!(name = %t.name, dtype = %t.dtype, numel = t.numel(), "analyze tensor");
            }
            let analyzed = run_gated(cpu, cancel, move || {
                let t = &file.tensors()[idx];
                analyze_tensor(&t.name, t.dtype, file.data(t))
            })
            .await?;
            Ok((slot, analyzed))
        });
    }

    // Keep this file's batch in tensor order; cross-file order stays up to
    // the workers.
    let mut out: Vec<Option<AnalyzedTensor>> = matched.iter().map(|_| None).collect();
    while let Some(res) = tasks.join_next().await {
        let joined = res.map_err(|e| MedirError::Io {
            message: format!("analysis task failed: {e}"),
        })?;
        match joined {
            Ok((slot, t)) => out[slot] = Some(t),
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        }
    }
    Ok(out.into_iter().flatten().collect())
}

/// Run one unit of blocking analysis work under the CPU semaphore,
/// polling cancellation after admission.
async fn run_gated<T, F>(cpu: Arc<Semaphore>, cancel: Cancellation, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let _permit = cpu
        .acquire_owned()
        .await
        .map_err(|_| MedirError::Cancelled)?;
    if cancel.is_cancelled() {
        return Err(MedirError::Cancelled);
    }
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| MedirError::Io {
            message: format!("analysis task failed: {e}"),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_clamp_cpus() {
        assert_eq!(clamp_cpus(0), 2);
        assert_eq!(clamp_cpus(1), 2);
        assert_eq!(clamp_cpus(8), 8);
        assert_eq!(clamp_cpus(4096), 1024);
    }

    #[test]
    fn test_file_permits_for() {
        assert_eq!(file_permits_for(0), 1);
        assert_eq!(file_permits_for(8 * GIB), 1);
        assert_eq!(file_permits_for(64 * GIB), 11);
        assert_eq!(file_permits_for(1024 * GIB), 16);
    }

    #[test]
    fn test_cancellation_flag() {
        let c = Cancellation::new();
        assert!(!c.is_cancelled());
        let c2 = c.clone();
        c2.cancel();
        assert!(c.is_cancelled());
        c.cancel();
        assert!(c.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_cpu_gate_bounds_concurrency() {
        let cpu = Arc::new(Semaphore::new(2));
        let cancel = Cancellation::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for _ in 0..8 {
            let cpu = Arc::clone(&cpu);
            let cancel = cancel.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                run_gated(cpu, cancel, move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.expect("join").expect("gated work");
        }
        assert!(peak.load(Ordering::SeqCst) >= 1);
        assert!(peak.load(Ordering::SeqCst) <= 2, "more than two analyses ran at once");
    }

    #[tokio::test]
    async fn test_gate_observes_cancellation() {
        let cpu = Arc::new(Semaphore::new(1));
        let cancel = Cancellation::new();
        cancel.cancel();
        let res = run_gated::<(), _>(cpu, cancel, || Ok(())).await;
        assert_eq!(res, Err(MedirError::Cancelled));
    }
}
