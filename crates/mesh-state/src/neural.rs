//! Built-in inference engine.
//!
//! Activation is `tanh(0.5 * x)` applied element-wise. Inputs are bounded:
//! at most [`MAX_INPUT_LEN`] values, each finite with magnitude at most
//! [`MAX_INPUT_MAGNITUDE`]. Out-of-bounds input is an error, never a panic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use mesh_protocol::AgentId;

use crate::collaborators::{CollaboratorError, InferenceEngine, InferenceMetrics, InferenceOutput};

pub const MAX_INPUT_LEN: usize = 10_000;
pub const MAX_INPUT_MAGNITUDE: f32 = 1000.0;
/// Values above this count as a spike.
pub const SPIKE_THRESHOLD: f32 = 0.1;
/// Maximum jitter applied by `optimize_connections`, in either direction.
const CONNECTION_JITTER: f32 = 0.05;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NeuralError {
    #[error("input has {len} values, limit is {limit}")]
    TooLarge { len: usize, limit: usize },

    #[error("input value at index {index} is not finite")]
    NonFinite { index: usize },

    #[error("input value {value} at index {index} exceeds magnitude {limit}")]
    OutOfRange { index: usize, value: f32, limit: f32 },
}

impl From<NeuralError> for CollaboratorError {
    fn from(e: NeuralError) -> Self {
        CollaboratorError::InvalidInput(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub iterations: u32,
    pub operations_per_second: f64,
    pub average_operation_us: f64,
    pub memory_usage: usize,
}

#[derive(Debug, Default)]
struct MemoryPool {
    pool: Vec<f32>,
    usage: usize,
}

/// Pool is cleared once it grows past this many floats.
const POOL_RESET_FLOATS: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct NeuralRuntime {
    operations: AtomicU64,
    memory: Mutex<MemoryPool>,
}

impl NeuralRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(inputs: &[f32]) -> Result<(), NeuralError> {
        if inputs.len() > MAX_INPUT_LEN {
            return Err(NeuralError::TooLarge {
                len: inputs.len(),
                limit: MAX_INPUT_LEN,
            });
        }
        for (index, &value) in inputs.iter().enumerate() {
            if !value.is_finite() {
                return Err(NeuralError::NonFinite { index });
            }
            if value.abs() > MAX_INPUT_MAGNITUDE {
                return Err(NeuralError::OutOfRange {
                    index,
                    value,
                    limit: MAX_INPUT_MAGNITUDE,
                });
            }
        }
        Ok(())
    }

    pub fn activate(&self, inputs: &[f32]) -> Result<Vec<f32>, NeuralError> {
        Self::validate(inputs)?;
        self.operations.fetch_add(1, Ordering::Relaxed);
        Ok(inputs.iter().map(|&x| (x * 0.5).tanh()).collect())
    }

    /// Nudge each weight by a small pseudo-random amount, clamped to [0, 1].
    /// The jitter sequence is derived from the operation counter, so a fresh
    /// runtime always produces the same adjustments.
    pub fn optimize_connections(&self, weights: &[f32]) -> Vec<f32> {
        let op = self.operations.fetch_add(1, Ordering::Relaxed);
        let mut state = op
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        weights
            .iter()
            .map(|&w| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
                (w + (unit - 0.5) * 2.0 * CONNECTION_JITTER).clamp(0.0, 1.0)
            })
            .collect()
    }

    /// Spikes per second over a window of `window_ms` milliseconds.
    pub fn spike_rate(&self, spikes: &[f32], window_ms: f32) -> f32 {
        self.operations.fetch_add(1, Ordering::Relaxed);
        if spikes.is_empty() || window_ms <= 0.0 {
            return 0.0;
        }
        let count = spikes.iter().filter(|&&x| x > SPIKE_THRESHOLD).count() as f32;
        count / (window_ms / 1000.0)
    }

    /// Mean neuron activity times mean synapse weight.
    pub fn mesh_efficiency(&self, neurons: &[f32], synapses: &[f32]) -> f32 {
        self.operations.fetch_add(1, Ordering::Relaxed);
        if neurons.is_empty() || synapses.is_empty() {
            return 0.0;
        }
        let activity = neurons.iter().sum::<f32>() / neurons.len() as f32;
        let weight = synapses.iter().sum::<f32>() / synapses.len() as f32;
        activity * weight
    }

    /// Reserve `size` bytes from the pool. Returns the byte offset.
    pub fn allocate(&self, size: usize) -> usize {
        let mut mem = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let floats = size / std::mem::size_of::<f32>();
        let offset = mem.pool.len();
        let new_len = offset + floats;
        mem.pool.resize(new_len, 0.0);
        mem.usage += size;
        offset * std::mem::size_of::<f32>()
    }

    pub fn deallocate(&self, size: usize) {
        let mut mem = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        mem.usage = mem.usage.saturating_sub(size);
        if mem.pool.len() > POOL_RESET_FLOATS {
            mem.pool.clear();
            mem.pool.shrink_to_fit();
        }
    }

    /// Bytes accounted through `allocate` plus the pool's backing storage.
    pub fn memory_usage(&self) -> usize {
        let mem = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        mem.usage + mem.pool.capacity() * std::mem::size_of::<f32>()
    }

    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn reset_metrics(&self) {
        self.operations.store(0, Ordering::Relaxed);
        self.memory.lock().unwrap_or_else(PoisonError::into_inner).usage = 0;
    }

    /// Time `iterations` activations over a maximal input.
    pub fn benchmark(&self, iterations: u32) -> BenchmarkResult {
        let data: Vec<f32> = (0..MAX_INPUT_LEN)
            .map(|i| i as f32 / MAX_INPUT_LEN as f32)
            .collect();
        let start = Instant::now();
        let mut completed = 0u32;
        for _ in 0..iterations {
            if self.activate(&data).is_ok() {
                completed += 1;
            }
        }
        let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
        BenchmarkResult {
            iterations: completed,
            operations_per_second: completed as f64 / elapsed,
            average_operation_us: elapsed * 1_000_000.0 / completed.max(1) as f64,
            memory_usage: self.memory_usage(),
        }
    }
}

impl InferenceEngine for NeuralRuntime {
    fn run_inference<'a>(
        &'a self,
        agent_id: &'a AgentId,
        input: &'a [f32],
    ) -> BoxFuture<'a, Result<InferenceOutput, CollaboratorError>> {
        Box::pin(async move {
            let start = Instant::now();
            let output = self.activate(input).map_err(|e| {
                tracing::warn!(agent_id = %agent_id, error = %e, "Rejected inference input");
                CollaboratorError::from(e)
            })?;
            Ok(InferenceOutput {
                metrics: InferenceMetrics {
                    input_len: input.len(),
                    duration_us: start.elapsed().as_micros() as u64,
                    operations: self.operations(),
                    memory_bytes: self.memory_usage(),
                },
                output,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_values() {
        let rt = NeuralRuntime::new();
        let out = rt.activate(&[0.0, 2.0, -2.0]).unwrap();
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 1.0f32.tanh()).abs() < 1e-6);
        assert!((out[2] + 1.0f32.tanh()).abs() < 1e-6);
        assert_eq!(rt.operations(), 1);
    }

    #[test]
    fn test_input_bounds() {
        let rt = NeuralRuntime::new();
        assert!(rt.activate(&vec![0.5; MAX_INPUT_LEN]).is_ok());
        assert_eq!(
            rt.activate(&vec![0.5; MAX_INPUT_LEN + 1]),
            Err(NeuralError::TooLarge {
                len: MAX_INPUT_LEN + 1,
                limit: MAX_INPUT_LEN
            })
        );
        assert_eq!(
            rt.activate(&[1.0, f32::NAN]),
            Err(NeuralError::NonFinite { index: 1 })
        );
        assert!(matches!(
            rt.activate(&[1000.5]),
            Err(NeuralError::OutOfRange { index: 0, .. })
        ));
        assert!(rt.activate(&[1000.0, -1000.0]).is_ok());
    }

    #[test]
    fn test_spike_rate() {
        let rt = NeuralRuntime::new();
        // Three spikes over half a second.
        let rate = rt.spike_rate(&[0.5, 0.05, 0.2, 0.11, 0.1], 500.0);
        assert!((rate - 6.0).abs() < 1e-6);
        assert_eq!(rt.spike_rate(&[0.5], 0.0), 0.0);
        assert_eq!(rt.spike_rate(&[], 100.0), 0.0);
    }

    #[test]
    fn test_mesh_efficiency() {
        let rt = NeuralRuntime::new();
        let eff = rt.mesh_efficiency(&[0.5, 1.0], &[0.2, 0.4]);
        assert!((eff - 0.225).abs() < 1e-6);
        assert_eq!(rt.mesh_efficiency(&[], &[1.0]), 0.0);
    }

    #[test]
    fn test_optimized_connections_stay_in_band() {
        let rt = NeuralRuntime::new();
        let weights = [0.0, 0.02, 0.5, 0.98, 1.0];
        let out = rt.optimize_connections(&weights);
        for (before, after) in weights.iter().zip(&out) {
            assert!((0.0..=1.0).contains(after));
            assert!((after - before).abs() <= CONNECTION_JITTER + 1e-6);
        }
        // Same counter state yields the same jitter.
        assert_eq!(NeuralRuntime::new().optimize_connections(&weights), out);
    }

    #[test]
    fn test_memory_accounting() {
        let rt = NeuralRuntime::new();
        assert_eq!(rt.allocate(64), 0);
        assert_eq!(rt.allocate(64), 64);
        assert!(rt.memory_usage() >= 128);
        rt.deallocate(1_000_000);
        rt.reset_metrics();
        assert_eq!(rt.operations(), 0);
    }

    #[tokio::test]
    async fn test_run_inference_reports_metrics() {
        let rt = NeuralRuntime::new();
        let id = AgentId::new("a1");
        let out = rt.run_inference(&id, &[0.0, 1.0]).await.unwrap();
        assert_eq!(out.output.len(), 2);
        assert_eq!(out.metrics.input_len, 2);
        assert_eq!(out.metrics.operations, 1);

        let err = rt.run_inference(&id, &[f32::INFINITY]).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::InvalidInput(_)));
    }
}
