use crate::error::{CoreError, Result};
use bytemuck::Pod;
use cfg_if::cfg_if;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use wgpu::{util::DeviceExt, PollType};

/// Drives a device future to completion on the calling thread.
///
/// Every accelerator call made by this crate is bulk-synchronous: the caller
/// blocks until the device has finished the submitted work.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    cfg_if! {
        if #[cfg(feature = "native")] {
            pollster::block_on(future)
        } else {
            futures::executor::block_on(future)
        }
    }
}

/// Host <-> device byte counters shared by every clone of a [`GpuContext`].
#[derive(Debug, Default)]
pub(crate) struct TransferCounters {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl TransferCounters {
    fn upload(&self, bytes: u64) {
        let total = self.uploaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
        log::trace!("uploaded {} bytes, {} in total", bytes, total);
    }

    fn download(&self, bytes: u64) {
        let total = self.downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
        log::trace!("downloaded {} bytes, {} in total", bytes, total);
    }

    fn snapshot(&self) -> (u64, u64) {
        (
            self.uploaded.load(Ordering::Relaxed),
            self.downloaded.load(Ordering::Relaxed),
        )
    }

    fn reset(&self) {
        self.uploaded.store(0, Ordering::Relaxed);
        self.downloaded.store(0, Ordering::Relaxed);
    }
}

type PipelineCache = Mutex<HashMap<&'static str, Arc<wgpu::ComputePipeline>>>;

/// Device, queue, transfer counters and the compiled compute pipelines.
/// Internal to this crate; cheap to clone.
#[derive(Debug, Clone)]
pub(crate) struct GpuContext {
    pub(crate) device: Arc<wgpu::Device>,
    pub(crate) queue: Arc<wgpu::Queue>,
    pub(crate) adapter_name: String,
    counters: Arc<TransferCounters>,
    pipelines: Arc<PipelineCache>,
}

impl GpuContext {
    /// Opens the first high-performance adapter that grants `SHADER_F64`.
    pub(crate) async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| CoreError::AcceleratorInit(format!("no adapter: {}", e)))?;

        let info = adapter.get_info();
        log::info!("Accelerator adapter: {} ({:?})", info.name, info.backend);
        if !adapter.features().contains(wgpu::Features::SHADER_F64) {
            return Err(CoreError::AcceleratorInit(format!(
                "{} lacks SHADER_F64",
                info.name
            )));
        }

        let mut required_limits = wgpu::Limits::default().using_resolution(adapter.limits());
        // SpMV binds five storage buffers.
        required_limits.max_storage_buffers_per_shader_stage =
            required_limits.max_storage_buffers_per_shader_stage.max(5);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("sparsolve device"),
                required_features: wgpu::Features::SHADER_F64,
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| CoreError::AcceleratorInit(format!("device request failed: {}", e)))?;

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_name: format!("{} ({:?})", info.name, info.backend),
            counters: Arc::new(TransferCounters::default()),
            pipelines: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Creates a buffer initialised with `contents` and counts the upload.
    pub(crate) fn create_buffer_with_data(
        &self,
        label: &str,
        contents: &[u8],
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        log::debug!("Uploading '{}' ({} bytes)", label, contents.len());
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage,
            });
        self.counters.upload(contents.len() as u64);
        buffer
    }

    /// Creates an uninitialised buffer; nothing is transferred.
    pub(crate) fn create_empty_buffer(
        &self,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            // Zero-sized bindings are invalid; keep at least one element.
            size: size.max(8),
            usage,
            mapped_at_creation: false,
        })
    }

    /// Overwrites the start of `buffer` with `data`.
    pub(crate) fn write_buffer<T: Pod>(&self, buffer: &wgpu::Buffer, data: &[T]) -> Result<()> {
        let bytes = std::mem::size_of_val(data) as u64;
        if bytes == 0 {
            return Ok(());
        }
        if buffer.size() < bytes || !buffer.usage().contains(wgpu::BufferUsages::COPY_DST) {
            return Err(CoreError::Internal(format!(
                "cannot write {} bytes into a {} byte buffer with usage {:?}",
                bytes,
                buffer.size(),
                buffer.usage()
            )));
        }
        self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
        self.counters.upload(bytes);
        Ok(())
    }

    fn submit_copy(&self, label: &str, source: &wgpu::Buffer, destination: &wgpu::Buffer, bytes: u64) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        encoder.copy_buffer_to_buffer(source, 0, destination, 0, bytes);
        self.queue.submit(Some(encoder.finish()));
    }

    /// Device-side copy of `bytes` bytes between two buffers; waits for completion.
    pub(crate) fn copy_buffer(&self, source: &wgpu::Buffer, destination: &wgpu::Buffer, bytes: u64) {
        if bytes > 0 {
            self.submit_copy("device copy", source, destination, bytes);
            self.wait_idle();
        }
    }

    /// Blocks until all submitted work has finished.
    pub(crate) fn wait_idle(&self) {
        cfg_if! {
            if #[cfg(not(target_arch = "wasm32"))] {
                let _ = self.device.poll(PollType::Wait);
            }
        }
    }

    /// Reads `count` values of `T` back from a `COPY_SRC` buffer through a
    /// mappable staging buffer.
    pub(crate) async fn read_buffer_to_cpu<T: Pod>(
        &self,
        buffer: &wgpu::Buffer,
        count: usize,
    ) -> Result<Vec<T>> {
        let bytes = (count * std::mem::size_of::<T>()) as u64;
        if bytes == 0 {
            return Ok(Vec::new());
        }
        if buffer.size() < bytes {
            return Err(CoreError::Internal(format!(
                "readback of {} bytes from a {} byte buffer",
                bytes,
                buffer.size()
            )));
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.submit_copy("readback", buffer, &staging, bytes);

        let (mapped_tx, mapped_rx) = futures::channel::oneshot::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |mapped| {
            // The receiver only goes away when the read is abandoned.
            let _ = mapped_tx.send(mapped);
        });
        self.wait_idle();

        mapped_rx
            .await
            .map_err(|_| CoreError::Internal("readback was cancelled".to_string()))?
            .map_err(|e| CoreError::Accelerator(format!("mapping the readback failed: {}", e)))?;
        let values = bytemuck::cast_slice::<u8, T>(&staging.slice(..).get_mapped_range()).to_vec();
        staging.unmap();
        self.counters.download(bytes);
        Ok(values)
    }

    /// Returns the compute pipeline registered under `key`, compiling it on first use.
    pub(crate) fn pipeline(&self, key: &'static str, source: &str) -> Result<Arc<wgpu::ComputePipeline>> {
        let mut cache = self
            .pipelines
            .lock()
            .map_err(|_| CoreError::Internal("pipeline cache poisoned".to_string()))?;
        if let Some(pipeline) = cache.get(key) {
            return Ok(Arc::clone(pipeline));
        }
        log::debug!("Compiling compute pipeline '{}'", key);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(key),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = Arc::new(self.device.create_compute_pipeline(
            &wgpu::ComputePipelineDescriptor {
                label: Some(key),
                layout: None, // Derived from the shader's bindings
                module: &module,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            },
        ));
        cache.insert(key, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// `(uploaded, downloaded)` bytes.
    pub(crate) fn transfer_stats(&self) -> (u64, u64) {
        self.counters.snapshot()
    }

    pub(crate) fn reset_transfer_stats(&self) {
        self.counters.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let counters = TransferCounters::default();
        counters.upload(16);
        counters.upload(8);
        counters.download(4);
        assert_eq!(counters.snapshot(), (24, 4));
        counters.reset();
        assert_eq!(counters.snapshot(), (0, 0));
    }
}
