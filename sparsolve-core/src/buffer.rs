use crate::context::{block_on, GpuContext};
use crate::error::{check_size, Result};
use std::{mem, sync::Arc};

/// An `f64` array resident in accelerator memory.
///
/// Created through [`GpuDevice`](crate::device::GpuDevice); every method blocks
/// until the device has finished.
#[derive(Debug)]
pub struct DeviceBuffer {
    buffer: wgpu::Buffer,
    size: usize,
    label: String,
    pub(crate) context: Arc<GpuContext>,
}

pub(crate) const VECTOR_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

impl DeviceBuffer {
    pub(crate) fn upload(context: &Arc<GpuContext>, label: &str, data: &[f64]) -> Self {
        let buffer = if data.is_empty() {
            context.create_empty_buffer(label, 0, VECTOR_USAGE)
        } else {
            context.create_buffer_with_data(label, bytemuck::cast_slice(data), VECTOR_USAGE)
        };
        Self {
            buffer,
            size: data.len(),
            label: label.to_string(),
            context: Arc::clone(context),
        }
    }

    pub(crate) fn upload_indices(context: &Arc<GpuContext>, label: &str, data: &[u32]) -> wgpu::Buffer {
        if data.is_empty() {
            context.create_empty_buffer(label, 0, VECTOR_USAGE)
        } else {
            context.create_buffer_with_data(label, bytemuck::cast_slice(data), VECTOR_USAGE)
        }
    }

    pub(crate) fn empty(context: &Arc<GpuContext>, label: &str, size: usize) -> Self {
        let buffer =
            context.create_empty_buffer(label, (size * mem::size_of::<f64>()) as u64, VECTOR_USAGE);
        Self {
            buffer,
            size,
            label: label.to_string(),
            context: Arc::clone(context),
        }
    }

    pub(crate) fn into_inner(self) -> wgpu::Buffer {
        self.buffer
    }

    pub(crate) fn inner(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Number of `f64` elements.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn size_bytes(&self) -> u64 {
        (self.size * mem::size_of::<f64>()) as u64
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Downloads the contents to the host.
    pub fn read_contents(&self) -> Result<Vec<f64>> {
        block_on(self.context.read_buffer_to_cpu(&self.buffer, self.size))
    }

    /// Overwrites the contents from a host slice of the same length.
    pub fn write_contents(&self, data: &[f64]) -> Result<()> {
        check_size("DeviceBuffer::write_contents", self.size, data.len())?;
        self.context.write_buffer(&self.buffer, data)
    }

    /// Device-side copy from a buffer of equal length.
    pub fn clone_from(&mut self, source: &DeviceBuffer) -> Result<()> {
        check_size("DeviceBuffer::clone_from", self.size, source.size)?;
        self.context
            .copy_buffer(source.inner(), &self.buffer, self.size_bytes());
        Ok(())
    }

    /// Deep copy into a fresh device allocation.
    pub fn duplicate(&self, label: &str) -> Result<DeviceBuffer> {
        let mut copy = DeviceBuffer::empty(&self.context, label, self.size);
        copy.clone_from(self)?;
        Ok(copy)
    }
}
