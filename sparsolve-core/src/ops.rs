// Compute kernels for accelerator-resident data.
// Callers check sizes; every function here submits, waits and returns.

use crate::{
    buffer::DeviceBuffer, context::GpuContext, error::Result, sparse_matrix::DeviceCsr,
};
use bytemuck::{Pod, Zeroable};

const WORKGROUP_SIZE: u32 = 64;
const MAX_GROUPS_PER_DIM: u32 = 65_535;

const AXPBY_SHADER: &str = include_str!("./shaders/axpby.wgsl");
const SCALE_SHADER: &str = include_str!("./shaders/scale.wgsl");
const FILL_SHADER: &str = include_str!("./shaders/fill.wgsl");
const POINTWISE_SHADER: &str = include_str!("./shaders/pointwise_mult.wgsl");
const DOT_SHADER: &str = include_str!("./shaders/dot_partial.wgsl");
const SPMV_SHADER: &str = include_str!("./shaders/spmv.wgsl");

// --- Helper Structs (Internal) ---

/// Uniform block shared by every kernel. Layout matches `Params` in the shaders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct KernelParams {
    alpha: f64,
    beta: f64,
    n: u32,
    row_stride: u32,
    groups_x: u32,
    _padding: u32,
}

/// Workgroup grid for `n` threads. Grids wider than the per-dimension limit fold into y.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Grid {
    x: u32,
    y: u32,
}

impl Grid {
    fn for_len(n: usize) -> Self {
        let groups = (n as u32).div_ceil(WORKGROUP_SIZE).max(1);
        if groups <= MAX_GROUPS_PER_DIM {
            Grid { x: groups, y: 1 }
        } else {
            Grid {
                x: MAX_GROUPS_PER_DIM,
                y: groups.div_ceil(MAX_GROUPS_PER_DIM),
            }
        }
    }

    fn row_stride(&self) -> u32 {
        self.x * WORKGROUP_SIZE
    }

    fn total_groups(&self) -> usize {
        (self.x as usize) * (self.y as usize)
    }

    fn params(&self, alpha: f64, beta: f64, n: usize) -> KernelParams {
        KernelParams {
            alpha,
            beta,
            n: n as u32,
            row_stride: self.row_stride(),
            groups_x: self.x,
            _padding: 0,
        }
    }
}

/// Binds `params` at slot 0 and `buffers` at slots 1.., then dispatches `grid`.
fn dispatch(
    context: &GpuContext,
    key: &'static str,
    source: &str,
    params: &KernelParams,
    buffers: &[&wgpu::Buffer],
    grid: Grid,
) -> Result<()> {
    let pipeline = context.pipeline(key, source)?;
    let params_buffer = context.create_buffer_with_data(
        key,
        bytemuck::bytes_of(params),
        wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    );

    let mut entries = Vec::with_capacity(buffers.len() + 1);
    entries.push(wgpu::BindGroupEntry {
        binding: 0,
        resource: params_buffer.as_entire_binding(),
    });
    for (slot, buffer) in buffers.iter().enumerate() {
        entries.push(wgpu::BindGroupEntry {
            binding: slot as u32 + 1,
            resource: buffer.as_entire_binding(),
        });
    }

    let layout = pipeline.get_bind_group_layout(0);
    let bind_group = context
        .device
        .create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(key),
            layout: &layout,
            entries: &entries,
        });

    let mut encoder = context
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(key) });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(key),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(grid.x, grid.y, 1);
    }
    context.queue.submit(Some(encoder.finish()));
    context.wait_idle();
    log::trace!("Kernel '{}' finished on {}x{} groups", key, grid.x, grid.y);
    Ok(())
}

// --- Level-1 kernels ---

/// `y = alpha * x + beta * y`
pub(crate) fn axpby(
    context: &GpuContext,
    alpha: f64,
    x: &DeviceBuffer,
    beta: f64,
    y: &mut DeviceBuffer,
) -> Result<()> {
    let n = y.size();
    if n == 0 {
        return Ok(());
    }
    let grid = Grid::for_len(n);
    dispatch(
        context,
        "axpby",
        AXPBY_SHADER,
        &grid.params(alpha, beta, n),
        &[x.inner(), y.inner()],
        grid,
    )
}

/// `y = alpha * y`
pub(crate) fn scale(context: &GpuContext, alpha: f64, y: &mut DeviceBuffer) -> Result<()> {
    let n = y.size();
    if n == 0 {
        return Ok(());
    }
    let grid = Grid::for_len(n);
    dispatch(
        context,
        "scale",
        SCALE_SHADER,
        &grid.params(alpha, 0.0, n),
        &[y.inner()],
        grid,
    )
}

/// `y[i] = value` for all `i`
pub(crate) fn fill(context: &GpuContext, value: f64, y: &mut DeviceBuffer) -> Result<()> {
    let n = y.size();
    if n == 0 {
        return Ok(());
    }
    let grid = Grid::for_len(n);
    dispatch(
        context,
        "fill",
        FILL_SHADER,
        &grid.params(value, 0.0, n),
        &[y.inner()],
        grid,
    )
}

/// `y[i] = x[i] * y[i]`
pub(crate) fn pointwise_mult(
    context: &GpuContext,
    x: &DeviceBuffer,
    y: &mut DeviceBuffer,
) -> Result<()> {
    let n = y.size();
    if n == 0 {
        return Ok(());
    }
    let grid = Grid::for_len(n);
    dispatch(
        context,
        "pointwise_mult",
        POINTWISE_SHADER,
        &grid.params(1.0, 0.0, n),
        &[x.inner(), y.inner()],
        grid,
    )
}

/// `x . y`; one partial sum per workgroup, finished on the host.
pub(crate) fn dot(context: &GpuContext, x: &DeviceBuffer, y: &DeviceBuffer) -> Result<f64> {
    let n = x.size();
    if n == 0 {
        return Ok(0.0);
    }
    let grid = Grid::for_len(n);
    let partial_count = grid.total_groups();
    let partials = context.create_empty_buffer(
        "dot partials",
        (partial_count * std::mem::size_of::<f64>()) as u64,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
    );
    dispatch(
        context,
        "dot_partial",
        DOT_SHADER,
        &grid.params(1.0, 0.0, n),
        &[x.inner(), y.inner(), &partials],
        grid,
    )?;
    let sums: Vec<f64> =
        crate::context::block_on(context.read_buffer_to_cpu(&partials, partial_count))?;
    Ok(sums.iter().sum())
}

// --- Sparse kernels ---

/// `y = alpha * A * x + beta * y` for a device CSR matrix.
pub(crate) fn spmv(
    context: &GpuContext,
    matrix: &DeviceCsr,
    alpha: f64,
    x: &DeviceBuffer,
    beta: f64,
    y: &mut DeviceBuffer,
) -> Result<()> {
    let rows = matrix.rows;
    if rows == 0 {
        return Ok(());
    }
    let grid = Grid::for_len(rows);
    dispatch(
        context,
        "spmv_csr",
        SPMV_SHADER,
        &grid.params(alpha, beta, rows),
        &[
            &matrix.row_ptr,
            &matrix.col_indices,
            &matrix.values,
            x.inner(),
            y.inner(),
        ],
        grid,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_match_uniform_layout() {
        assert_eq!(std::mem::size_of::<KernelParams>(), 32);
    }

    #[test]
    fn small_grids_stay_one_dimensional() {
        let grid = Grid::for_len(1000);
        assert_eq!(grid, Grid { x: 16, y: 1 });
        assert_eq!(grid.row_stride(), 1024);
    }

    #[test]
    fn large_grids_fold_into_second_dimension() {
        let n = (MAX_GROUPS_PER_DIM as usize + 10) * WORKGROUP_SIZE as usize;
        let grid = Grid::for_len(n);
        assert_eq!(grid.x, MAX_GROUPS_PER_DIM);
        assert_eq!(grid.y, 2);
        assert!(grid.total_groups() * WORKGROUP_SIZE as usize >= n);
    }

    #[test]
    fn empty_input_still_dispatches_one_group() {
        assert_eq!(Grid::for_len(0), Grid { x: 1, y: 1 });
    }
}
