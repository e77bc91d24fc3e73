use crate::buffer::DeviceBuffer;
use crate::context::{block_on, GpuContext};
use crate::error::{check_size, CoreError, Result};
use crate::ops;
use crate::sparse_matrix::{DeviceCsr, SparseMatrix};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Represents an accelerator execution device, holding the wgpu context.
#[derive(Debug, Clone)]
pub struct GpuDevice {
    pub(crate) context: Arc<GpuContext>,
}

impl GpuDevice {
    /// Opens the accelerator. Blocks until the adapter and device are ready.
    ///
    /// # Errors
    /// `CoreError::AcceleratorInit` when no adapter with `SHADER_F64` exists.
    pub fn new() -> Result<Self> {
        log::info!("GpuDevice::new() creating native context");
        let context = block_on(GpuContext::new())?;
        log::info!("GpuDevice created successfully");
        Ok(Self {
            context: Arc::new(context),
        })
    }

    pub fn name(&self) -> &str {
        &self.context.adapter_name
    }

    // --- Resource Creation ---

    /// Creates a device buffer initialised with data from a host slice.
    pub fn create_buffer(&self, label: &str, data: &[f64]) -> DeviceBuffer {
        DeviceBuffer::upload(&self.context, label, data)
    }

    /// Creates a zero-filled device buffer of `size` elements.
    pub fn create_zeroed_buffer(&self, label: &str, size: usize) -> DeviceBuffer {
        // wgpu zero-initialises fresh allocations.
        DeviceBuffer::empty(&self.context, label, size)
    }

    /// Uploads the CSR arrays of a host matrix.
    pub fn create_sparse_matrix(&self, matrix: &SparseMatrix) -> Result<DeviceCsr> {
        DeviceCsr::upload(&self.context, matrix)
    }

    // --- Operations ---

    /// `y = alpha * x + beta * y`
    pub fn axpby(&self, alpha: f64, x: &DeviceBuffer, beta: f64, y: &mut DeviceBuffer) -> Result<()> {
        check_size("axpby", y.size(), x.size())?;
        ops::axpby(&self.context, alpha, x, beta, y)
    }

    /// `y = alpha * y`
    pub fn scale(&self, alpha: f64, y: &mut DeviceBuffer) -> Result<()> {
        ops::scale(&self.context, alpha, y)
    }

    /// Sets every entry of `y` to `value`.
    pub fn fill(&self, value: f64, y: &mut DeviceBuffer) -> Result<()> {
        ops::fill(&self.context, value, y)
    }

    /// `y = x .* y`
    pub fn pointwise_mult(&self, x: &DeviceBuffer, y: &mut DeviceBuffer) -> Result<()> {
        check_size("pointwise_mult", y.size(), x.size())?;
        ops::pointwise_mult(&self.context, x, y)
    }

    /// Calculates the dot product `x^T * y` on the device.
    pub fn dot(&self, x: &DeviceBuffer, y: &DeviceBuffer) -> Result<f64> {
        check_size("dot", x.size(), y.size())?;
        ops::dot(&self.context, x, y)
    }

    /// `y = alpha * A * x + beta * y`
    pub fn spmv(
        &self,
        matrix: &DeviceCsr,
        alpha: f64,
        x: &DeviceBuffer,
        beta: f64,
        y: &mut DeviceBuffer,
    ) -> Result<()> {
        check_size("spmv input", matrix.cols, x.size())?;
        check_size("spmv output", matrix.rows, y.size())?;
        ops::spmv(&self.context, matrix, alpha, x, beta, y)
    }

    /// Returns (bytes uploaded, bytes downloaded) since the last reset.
    pub fn transfer_stats(&self) -> (u64, u64) {
        self.context.transfer_stats()
    }

    pub fn reset_transfer_stats(&self) {
        self.context.reset_transfer_stats()
    }
}

// --- Process context ---

/// Settings for [`Context::init`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Try to open an accelerator. Falls back to host-only when none is found.
    pub accelerator: bool,
    /// Host worker threads; `None` lets rayon pick.
    pub threads: Option<usize>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            accelerator: false,
            threads: None,
        }
    }
}

impl ContextConfig {
    pub fn new(accelerator: bool, threads: Option<usize>) -> Self {
        Self {
            accelerator,
            threads,
        }
    }

    pub fn host_only() -> Self {
        Self::default()
    }

    pub fn with_accelerator() -> Self {
        Self {
            accelerator: true,
            ..Self::default()
        }
    }
}

/// Process-wide execution context: optional accelerator, host thread pool and
/// the instrumentation timer. Created once and handed to every operand.
#[derive(Debug)]
pub struct Context {
    config: ContextConfig,
    accelerator: Option<GpuDevice>,
    pool: rayon::ThreadPool,
    started: Instant,
}

impl Context {
    /// Creates the context.
    ///
    /// # Errors
    /// Fails only when the host thread pool cannot be created. A missing
    /// accelerator is logged and leaves the context host-only.
    pub fn init(config: ContextConfig) -> Result<Arc<Self>> {
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("sparsolve-worker-{}", i));
        if let Some(threads) = config.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to build thread pool: {}", e)))?;

        let accelerator = if config.accelerator {
            match GpuDevice::new() {
                Ok(device) => Some(device),
                Err(e) => {
                    log::warn!("Accelerator requested but unavailable, staying on host: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let context = Self {
            config,
            accelerator,
            pool,
            started: Instant::now(),
        };
        log::info!("{}", context.info());
        Ok(Arc::new(context))
    }

    /// Host-only context with the default thread count.
    pub fn host() -> Result<Arc<Self>> {
        Self::init(ContextConfig::host_only())
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn has_accelerator(&self) -> bool {
        self.accelerator.is_some()
    }

    pub fn accelerator(&self) -> Option<&GpuDevice> {
        self.accelerator.as_ref()
    }

    /// The accelerator, or `AcceleratorUnavailable`.
    pub fn gpu(&self) -> Result<&GpuDevice> {
        self.accelerator
            .as_ref()
            .ok_or(CoreError::AcceleratorUnavailable)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` inside the host thread pool.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// Microseconds since the context was created. Instrumentation only.
    pub fn time_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }

    pub fn info(&self) -> String {
        match &self.accelerator {
            Some(device) => format!(
                "Context: {} host threads, accelerator {}",
                self.threads(),
                device.name()
            ),
            None => format!("Context: {} host threads, no accelerator", self.threads()),
        }
    }

    /// Logs the accelerator transfer statistics and the elapsed time.
    /// Operands keep their own handles, so dropping the last `Arc<Context>`
    /// releases the device.
    pub fn stop(&self) {
        if let Some(device) = &self.accelerator {
            let (to_gpu, from_gpu) = device.transfer_stats();
            log::info!(
                "Accelerator traffic: {} bytes to device, {} bytes from device",
                to_gpu,
                from_gpu
            );
        }
        log::info!("Context stopped after {} us", self.time_us());
    }
}
