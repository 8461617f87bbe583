//! Resource monitoring for collection indexing
//!
//! Tracks process memory and encoding throughput while a model is loaded and
//! a collection is encoded. The numbers end up in the index manifest.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Sampling interval for peak memory tracking
const SAMPLE_INTERVAL_MS: u64 = 50;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Resource usage of one indexing job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// Time to load both encoders (seconds)
    pub model_load_time_secs: f64,

    /// Time spent encoding documents and queries (seconds)
    pub encode_time_secs: f64,

    /// Texts encoded per second
    pub throughput_per_sec: f64,

    /// Process RSS before the model load (MB)
    pub baseline_memory_mb: f64,

    /// RSS growth caused by the model load (MB)
    pub model_memory_mb: f64,

    /// Peak process RSS while encoding (MB)
    pub peak_memory_mb: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ResourceMetrics {
    /// Format a summary line for display
    pub fn format_summary(&self) -> String {
        format!(
            "Load: {:.1}s | Encode: {:.1}s | Throughput: {:.1}/s | Peak RAM: {:.0}MB (model: {:.0}MB)",
            self.model_load_time_secs,
            self.encode_time_secs,
            self.throughput_per_sec,
            self.peak_memory_mb,
            self.model_memory_mb
        )
    }
}

/// Monitor for tracking resource usage during an indexing job
pub struct ResourceMonitor {
    system: System,
    pid: Pid,
    baseline_memory_mb: f64,
    model_memory_mb: f64,
    model_load_time: Option<Duration>,
    peak_memory_mb: Arc<AtomicU64>,
    sampling_active: Arc<AtomicBool>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        Self {
            system,
            pid,
            baseline_memory_mb: 0.0,
            model_memory_mb: 0.0,
            model_load_time: None,
            peak_memory_mb: Arc::new(AtomicU64::new(0f64.to_bits())),
            sampling_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Apple Silicon shares memory between CPU and GPU, so RSS includes
    /// accelerator allocations
    fn unified_memory() -> bool {
        cfg!(all(target_os = "macos", target_arch = "aarch64"))
    }

    /// Current process RSS in MB
    fn process_memory_mb(&mut self) -> f64 {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        self.system
            .process(self.pid)
            .map(|p| p.memory() as f64 / BYTES_PER_MB)
            .unwrap_or(0.0)
    }

    /// Snapshot baseline memory before model load
    pub fn snapshot_baseline(&mut self) {
        self.baseline_memory_mb = self.process_memory_mb();
        self.peak_memory_mb
            .store(self.baseline_memory_mb.to_bits(), Ordering::SeqCst);
        tracing::debug!("Baseline memory: {:.1} MB", self.baseline_memory_mb);
    }

    /// Record memory after the encoders are loaded
    pub fn record_model_loaded(&mut self, load_duration: Duration) {
        let current = self.process_memory_mb();
        self.model_memory_mb = (current - self.baseline_memory_mb).max(0.0);
        self.model_load_time = Some(load_duration);
        raise_peak(&self.peak_memory_mb, current);

        tracing::debug!(
            "Encoders loaded: {:.1} MB (delta: {:.1} MB) in {:?}",
            current,
            self.model_memory_mb,
            load_duration
        );
    }

    /// Start background memory sampling
    ///
    /// Sampling runs until the returned handle is dropped.
    pub fn start_sampling(&self) -> SamplingHandle {
        self.sampling_active.store(true, Ordering::SeqCst);

        let peak = Arc::clone(&self.peak_memory_mb);
        let active = Arc::clone(&self.sampling_active);
        let pid = self.pid;

        // Plain thread: encoding may block the async workers
        let handle = std::thread::spawn(move || {
            let mut system = System::new();
            while active.load(Ordering::SeqCst) {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                if let Some(process) = system.process(pid) {
                    raise_peak(&peak, process.memory() as f64 / BYTES_PER_MB);
                }
                std::thread::sleep(Duration::from_millis(SAMPLE_INTERVAL_MS));
            }
        });

        SamplingHandle {
            sampling_active: Arc::clone(&self.sampling_active),
            _thread: Some(handle),
        }
    }

    /// Stop sampling and compute the final metrics
    pub fn finalize(mut self, encode_duration: Duration, encoded_count: usize) -> ResourceMetrics {
        self.sampling_active.store(false, Ordering::SeqCst);

        let final_memory = self.process_memory_mb();
        raise_peak(&self.peak_memory_mb, final_memory);

        let encode_secs = encode_duration.as_secs_f64();
        let throughput = if encode_secs > 0.0 {
            encoded_count as f64 / encode_secs
        } else {
            0.0
        };

        let notes = if Self::unified_memory() {
            Some("Apple Silicon unified memory - accelerator memory included in process RAM".to_string())
        } else {
            None
        };

        ResourceMetrics {
            model_load_time_secs: self
                .model_load_time
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            encode_time_secs: encode_secs,
            throughput_per_sec: throughput,
            baseline_memory_mb: self.baseline_memory_mb,
            model_memory_mb: self.model_memory_mb,
            peak_memory_mb: f64::from_bits(self.peak_memory_mb.load(Ordering::SeqCst)),
            notes,
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Store `current_mb` as the peak if it exceeds the stored value
fn raise_peak(peak: &AtomicU64, current_mb: f64) {
    let current_bits = current_mb.to_bits();
    let mut peak_bits = peak.load(Ordering::SeqCst);
    while current_mb > f64::from_bits(peak_bits) {
        match peak.compare_exchange(peak_bits, current_bits, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(actual) => peak_bits = actual,
        }
    }
}

/// Handle for background memory sampling
///
/// Dropping the handle stops the sampler on its next tick; the thread is not
/// joined.
pub struct SamplingHandle {
    sampling_active: Arc<AtomicBool>,
    _thread: Option<std::thread::JoinHandle<()>>,
}

impl Drop for SamplingHandle {
    fn drop(&mut self) {
        self.sampling_active.store(false, Ordering::SeqCst);
    }
}
