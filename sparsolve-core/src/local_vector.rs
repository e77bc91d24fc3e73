use crate::buffer::DeviceBuffer;
use crate::device::Context;
use crate::error::{check_size, CoreError, Result};
use crate::traits::{Residency, Vector};
use std::fmt;
use std::sync::Arc;

enum Storage {
    Host(Vec<f64>),
    Accelerator(DeviceBuffer),
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Host(values) => write!(f, "Host({} values)", values.len()),
            Storage::Accelerator(buffer) => write!(f, "Accelerator({} values)", buffer.size()),
        }
    }
}

/// Single-partition vector backed by one contiguous buffer on host or accelerator.
#[derive(Debug)]
pub struct LocalVector {
    name: String,
    storage: Storage,
    context: Arc<Context>,
}

// --- Random fills ---

pub(crate) fn uniform_samples(seed: u64, len: usize, a: f64, b: f64) -> Vec<f64> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| a + (b - a) * rng.f64()).collect()
}

/// Box-Muller over a seeded uniform stream.
pub(crate) fn normal_samples(seed: u64, len: usize, mean: f64, variance: f64) -> Vec<f64> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let sigma = variance.sqrt();
    let mut values = Vec::with_capacity(len);
    while values.len() < len {
        // (0, 1] keeps the logarithm finite.
        let u1 = 1.0 - rng.f64();
        let u2 = rng.f64();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = 2.0 * std::f64::consts::PI * u2;
        values.push(mean + sigma * radius * angle.cos());
        if values.len() < len {
            values.push(mean + sigma * radius * angle.sin());
        }
    }
    values
}

impl LocalVector {
    /// Host vector of `size` zeros.
    pub fn allocate(context: &Arc<Context>, name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            storage: Storage::Host(vec![0.0; size]),
            context: Arc::clone(context),
        }
    }

    pub fn from_slice(context: &Arc<Context>, name: &str, values: &[f64]) -> Self {
        Self {
            name: name.to_string(),
            storage: Storage::Host(values.to_vec()),
            context: Arc::clone(context),
        }
    }

    /// Zeroed vector with the same size, context and residency as `self`.
    pub fn like(&self, name: &str) -> Result<Self> {
        let storage = match &self.storage {
            Storage::Host(values) => Storage::Host(vec![0.0; values.len()]),
            Storage::Accelerator(buffer) => {
                Storage::Accelerator(self.context.gpu()?.create_zeroed_buffer(name, buffer.size()))
            }
        };
        Ok(Self {
            name: name.to_string(),
            storage,
            context: Arc::clone(&self.context),
        })
    }

    /// Deep copy with the same residency.
    pub fn duplicate(&self, name: &str) -> Result<Self> {
        let storage = match &self.storage {
            Storage::Host(values) => Storage::Host(values.clone()),
            Storage::Accelerator(buffer) => Storage::Accelerator(buffer.duplicate(name)?),
        };
        Ok(Self {
            name: name.to_string(),
            storage,
            context: Arc::clone(&self.context),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Host(values) => values.len(),
            Storage::Accelerator(buffer) => buffer.size(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the storage with `size` zeros, keeping the residency.
    pub fn resize(&mut self, size: usize) -> Result<()> {
        self.storage = match &self.storage {
            Storage::Host(_) => Storage::Host(vec![0.0; size]),
            Storage::Accelerator(_) => {
                Storage::Accelerator(self.context.gpu()?.create_zeroed_buffer(&self.name, size))
            }
        };
        Ok(())
    }

    /// Host copy of the values.
    pub fn to_vec(&self) -> Result<Vec<f64>> {
        match &self.storage {
            Storage::Host(values) => Ok(values.clone()),
            Storage::Accelerator(buffer) => buffer.read_contents(),
        }
    }

    pub fn copy_from_slice(&mut self, values: &[f64]) -> Result<()> {
        check_size("LocalVector::copy_from_slice", self.len(), values.len())?;
        match &mut self.storage {
            Storage::Host(dst) => dst.copy_from_slice(values),
            Storage::Accelerator(buffer) => buffer.write_contents(values)?,
        }
        Ok(())
    }

    /// Runs `f` on a host view of the values, downloading when necessary.
    pub fn with_host<R>(&self, f: impl FnOnce(&[f64]) -> R) -> Result<R> {
        match &self.storage {
            Storage::Host(values) => Ok(f(values)),
            Storage::Accelerator(buffer) => {
                log::debug!("'{}': host fallback (read)", self.name);
                let values = buffer.read_contents()?;
                Ok(f(&values))
            }
        }
    }

    /// Runs `f` on a mutable host view; accelerator data is downloaded and
    /// written back afterwards.
    pub fn with_host_mut<R>(&mut self, f: impl FnOnce(&mut [f64]) -> R) -> Result<R> {
        match &mut self.storage {
            Storage::Host(values) => Ok(f(values)),
            Storage::Accelerator(buffer) => {
                log::debug!("'{}': host fallback (read-write)", self.name);
                let mut values = buffer.read_contents()?;
                let result = f(&mut values);
                buffer.write_contents(&values)?;
                Ok(result)
            }
        }
    }

    /// Values at `indices`, in order.
    pub fn gather(&self, indices: &[usize]) -> Result<Vec<f64>> {
        let len = self.len();
        if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
            return Err(CoreError::InvalidDimensions(format!(
                "gather index {} out of range for '{}' of size {}",
                bad, self.name, len
            )));
        }
        self.with_host(|values| indices.iter().map(|&i| values[i]).collect())
    }

    /// Copies `len` entries of `source` starting at `source_offset` into
    /// `self` starting at `offset`.
    pub fn copy_range_from(
        &mut self,
        source: &LocalVector,
        source_offset: usize,
        offset: usize,
        len: usize,
    ) -> Result<()> {
        if source_offset + len > source.len() || offset + len > self.len() {
            return Err(CoreError::InvalidDimensions(format!(
                "copy_range_from: range [{}, {}) -> [{}, {}) exceeds sizes {} -> {}",
                source_offset,
                source_offset + len,
                offset,
                offset + len,
                source.len(),
                self.len()
            )));
        }
        if len == 0 {
            return Ok(());
        }
        let chunk = source.with_host(|src| src[source_offset..source_offset + len].to_vec())?;
        self.with_host_mut(|dst| dst[offset..offset + len].copy_from_slice(&chunk))
    }

    pub(crate) fn device_buffer(&self) -> Option<&DeviceBuffer> {
        match &self.storage {
            Storage::Accelerator(buffer) => Some(buffer),
            Storage::Host(_) => None,
        }
    }

    pub(crate) fn device_buffer_mut(&mut self) -> Option<&mut DeviceBuffer> {
        match &mut self.storage {
            Storage::Accelerator(buffer) => Some(buffer),
            Storage::Host(_) => None,
        }
    }

    /// Both operands on the accelerator: the device buffers. Otherwise `None`.
    fn device_pair<'a>(&'a mut self, x: &'a LocalVector) -> Option<(&'a mut DeviceBuffer, &'a DeviceBuffer)> {
        match (&mut self.storage, &x.storage) {
            (Storage::Accelerator(y), Storage::Accelerator(x)) => Some((y, x)),
            _ => None,
        }
    }

    fn zip_host(&mut self, x: &LocalVector, op: impl Fn(&mut f64, f64)) -> Result<()> {
        x.with_host(|xs| self.with_host_mut(|ys| ys.iter_mut().zip(xs).for_each(|(y, &x)| op(y, x))))?
    }

    /// `self = alpha * x + beta * self` on whichever side holds the data.
    fn axpby(&mut self, alpha: f64, x: &LocalVector, beta: f64) -> Result<()> {
        check_size(&self.name, self.len(), x.len())?;
        let context = Arc::clone(&self.context);
        if let Some((y, xd)) = self.device_pair(x) {
            return context.gpu()?.axpby(alpha, xd, beta, y);
        }
        self.zip_host(x, |y, x| *y = alpha * x + beta * *y)
    }
}

impl Residency for LocalVector {
    fn is_host(&self) -> bool {
        matches!(self.storage, Storage::Host(_))
    }

    fn move_to_host(&mut self) -> Result<()> {
        if let Storage::Accelerator(buffer) = &self.storage {
            let values = buffer.read_contents()?;
            log::debug!("'{}': moved {} values to host", self.name, values.len());
            self.storage = Storage::Host(values);
        }
        Ok(())
    }

    fn move_to_accelerator(&mut self) -> Result<()> {
        if let Storage::Host(values) = &self.storage {
            let buffer = self.context.gpu()?.create_buffer(&self.name, values);
            log::debug!("'{}': moved {} values to accelerator", self.name, buffer.size());
            self.storage = Storage::Accelerator(buffer);
        }
        Ok(())
    }
}

impl Vector for LocalVector {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.len()
    }

    fn local_size(&self) -> usize {
        self.len()
    }

    fn set_values(&mut self, value: f64) -> Result<()> {
        match &mut self.storage {
            Storage::Host(values) => {
                values.fill(value);
                Ok(())
            }
            Storage::Accelerator(buffer) => self.context.gpu()?.fill(value, buffer),
        }
    }

    fn set_random_uniform(&mut self, seed: u64, a: f64, b: f64) -> Result<()> {
        let samples = uniform_samples(seed, self.len(), a, b);
        self.copy_from_slice(&samples)
    }

    fn set_random_normal(&mut self, seed: u64, mean: f64, variance: f64) -> Result<()> {
        let samples = normal_samples(seed, self.len(), mean, variance);
        self.copy_from_slice(&samples)
    }

    fn copy_from(&mut self, x: &Self) -> Result<()> {
        check_size(&self.name, self.len(), x.len())?;
        if let Some((y, xd)) = self.device_pair(x) {
            return y.clone_from(xd);
        }
        self.zip_host(x, |y, x| *y = x)
    }

    fn clear(&mut self) -> Result<()> {
        self.storage = Storage::Host(Vec::new());
        Ok(())
    }

    fn add_scale(&mut self, x: &Self, alpha: f64) -> Result<()> {
        self.axpby(alpha, x, 1.0)
    }

    fn scale_add(&mut self, alpha: f64, x: &Self) -> Result<()> {
        self.axpby(1.0, x, alpha)
    }

    fn scale_add_scale(&mut self, alpha: f64, x: &Self, beta: f64) -> Result<()> {
        self.axpby(beta, x, alpha)
    }

    fn scale_add2(&mut self, alpha: f64, x: &Self, beta: f64, y: &Self, gamma: f64) -> Result<()> {
        self.axpby(beta, x, alpha)?;
        self.axpby(gamma, y, 1.0)
    }

    fn scale(&mut self, alpha: f64) -> Result<()> {
        match &mut self.storage {
            Storage::Host(values) => {
                values.iter_mut().for_each(|v| *v *= alpha);
                Ok(())
            }
            Storage::Accelerator(buffer) => self.context.gpu()?.scale(alpha, buffer),
        }
    }

    fn point_wise_mult(&mut self, x: &Self) -> Result<()> {
        check_size(&self.name, self.len(), x.len())?;
        let context = Arc::clone(&self.context);
        if let Some((y, xd)) = self.device_pair(x) {
            return context.gpu()?.pointwise_mult(xd, y);
        }
        self.zip_host(x, |y, x| *y *= x)
    }

    fn point_wise_mult2(&mut self, x: &Self, y: &Self) -> Result<()> {
        self.copy_from(x)?;
        self.point_wise_mult(y)
    }

    fn power(&mut self, p: f64) -> Result<()> {
        self.with_host_mut(|values| values.iter_mut().for_each(|v| *v = v.powf(p)))
    }

    fn dot(&self, x: &Self) -> Result<f64> {
        check_size(&self.name, self.len(), x.len())?;
        if let (Storage::Accelerator(a), Storage::Accelerator(b)) = (&self.storage, &x.storage) {
            return self.context.gpu()?.dot(a, b);
        }
        x.with_host(|xs| self.with_host(|ys| ys.iter().zip(xs).map(|(a, b)| a * b).sum::<f64>()))?
    }

    fn norm(&self) -> Result<f64> {
        Ok(self.dot(self)?.sqrt())
    }

    fn reduce(&self) -> Result<f64> {
        self.with_host(|values| values.iter().sum())
    }

    fn asum(&self) -> Result<f64> {
        self.with_host(|values| values.iter().map(|v| v.abs()).sum())
    }

    fn amax(&self) -> Result<(usize, f64)> {
        self.with_host(|values| {
            values
                .iter()
                .enumerate()
                .fold((0, 0.0_f64), |best, (i, v)| {
                    if v.abs() > best.1 {
                        (i, v.abs())
                    } else {
                        best
                    }
                })
        })
    }

    fn restriction(&mut self, fine: &Self, map: &[Option<usize>]) -> Result<()> {
        check_size("restriction map", fine.len(), map.len())?;
        let coarse_len = self.len();
        if let Some(bad) = map.iter().flatten().find(|&&j| j >= coarse_len) {
            return Err(CoreError::InvalidDimensions(format!(
                "restriction target {} out of range for coarse size {}",
                bad, coarse_len
            )));
        }
        let mut coarse = vec![0.0; coarse_len];
        fine.with_host(|values| {
            for (value, target) in values.iter().zip(map) {
                if let Some(j) = target {
                    coarse[*j] += value;
                }
            }
        })?;
        self.copy_from_slice(&coarse)
    }

    fn prolongation(&mut self, coarse: &Self, map: &[Option<usize>]) -> Result<()> {
        check_size("prolongation map", self.len(), map.len())?;
        let coarse_values = coarse.to_vec()?;
        if let Some(bad) = map.iter().flatten().find(|&&j| j >= coarse_values.len()) {
            return Err(CoreError::InvalidDimensions(format!(
                "prolongation source {} out of range for coarse size {}",
                bad,
                coarse_values.len()
            )));
        }
        let fine: Vec<f64> = map
            .iter()
            .map(|target| target.map_or(0.0, |j| coarse_values[j]))
            .collect();
        self.copy_from_slice(&fine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Context;

    fn assert_approx_eq_vec(a: &[f64], b: &[f64], eps: f64) {
        assert_eq!(a.len(), b.len(), "Vector lengths differ");
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < eps, "Mismatch at {}: {} vs {}", i, x, y);
        }
    }

    fn vector(ctx: &Arc<Context>, values: &[f64]) -> LocalVector {
        LocalVector::from_slice(ctx, "v", values)
    }

    #[test]
    fn unit_scale_is_idempotent() {
        let ctx = Context::host().unwrap();
        let original = [1.5, -2.0, 0.0, 3.25, 1e-300];
        let mut v = vector(&ctx, &original);
        v.scale(1.0).unwrap();
        v.scale(1.0).unwrap();
        assert_eq!(v.to_vec().unwrap(), original);
    }

    #[test]
    fn linear_combinations() {
        let ctx = Context::host().unwrap();
        let x = vector(&ctx, &[1.0, 2.0, 3.0]);
        let y = vector(&ctx, &[-1.0, 0.0, 1.0]);

        let mut v = vector(&ctx, &[1.0, 1.0, 1.0]);
        v.add_scale(&x, 2.0).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![3.0, 5.0, 7.0]);

        v.scale_add(0.5, &x).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![2.5, 4.5, 6.5]);

        v.scale_add_scale(2.0, &x, -1.0).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![4.0, 7.0, 10.0]);

        v.scale_add2(0.0, &x, 1.0, &y, 3.0).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![-2.0, 2.0, 6.0]);
    }

    #[test]
    fn reductions() {
        let ctx = Context::host().unwrap();
        let v = vector(&ctx, &[3.0, -4.0, 1.0, -4.0]);
        assert_eq!(v.dot(&v).unwrap(), 42.0);
        assert_eq!(v.reduce().unwrap(), -4.0);
        assert_eq!(v.asum().unwrap(), 12.0);
        assert_eq!(v.amax().unwrap(), (1, 4.0));
        assert!((v.norm().unwrap() - 42.0_f64.sqrt()).abs() < 1e-14);
    }

    #[test]
    fn pointwise_and_power() {
        let ctx = Context::host().unwrap();
        let x = vector(&ctx, &[2.0, 3.0]);
        let y = vector(&ctx, &[4.0, -1.0]);
        let mut v = LocalVector::allocate(&ctx, "v", 2);
        v.point_wise_mult2(&x, &y).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![8.0, -3.0]);
        v.power(2.0).unwrap();
        assert_eq!(v.to_vec().unwrap(), vec![64.0, 9.0]);
    }

    #[test]
    fn restriction_sums_and_prolongation_injects() {
        let ctx = Context::host().unwrap();
        let map = [Some(0), Some(1), Some(0), None];
        let fine = vector(&ctx, &[1.0, 2.0, 3.0, 4.0]);
        let mut coarse = LocalVector::allocate(&ctx, "c", 2);
        coarse.restriction(&fine, &map).unwrap();
        assert_eq!(coarse.to_vec().unwrap(), vec![4.0, 2.0]);

        let mut back = LocalVector::allocate(&ctx, "f", 4);
        back.prolongation(&coarse, &map).unwrap();
        assert_eq!(back.to_vec().unwrap(), vec![4.0, 2.0, 4.0, 0.0]);
    }

    #[test]
    fn random_fills_are_reproducible() {
        let ctx = Context::host().unwrap();
        let mut a = LocalVector::allocate(&ctx, "a", 1000);
        let mut b = LocalVector::allocate(&ctx, "b", 1000);
        a.set_random_normal(7, 0.0, 1.0).unwrap();
        b.set_random_normal(7, 0.0, 1.0).unwrap();
        assert_eq!(a.to_vec().unwrap(), b.to_vec().unwrap());

        let mean = a.reduce().unwrap() / 1000.0;
        assert!(mean.abs() < 0.15, "sample mean {}", mean);

        a.set_random_uniform(3, -1.0, 2.0).unwrap();
        assert!(a.to_vec().unwrap().iter().all(|v| (-1.0..2.0).contains(v)));
    }

    #[test]
    fn range_copy_and_gather() {
        let ctx = Context::host().unwrap();
        let src = vector(&ctx, &[1.0, 2.0, 3.0, 4.0]);
        let mut dst = LocalVector::allocate(&ctx, "d", 3);
        dst.copy_range_from(&src, 1, 0, 2).unwrap();
        assert_eq!(dst.to_vec().unwrap(), vec![2.0, 3.0, 0.0]);
        assert!(dst.copy_range_from(&src, 3, 0, 2).is_err());
        assert_eq!(src.gather(&[3, 0]).unwrap(), vec![4.0, 1.0]);
        assert!(src.gather(&[4]).is_err());
    }

    #[test]
    fn size_mismatch_is_an_error() {
        let ctx = Context::host().unwrap();
        let mut a = LocalVector::allocate(&ctx, "a", 3);
        let b = LocalVector::allocate(&ctx, "b", 4);
        assert!(matches!(a.add_scale(&b, 1.0), Err(CoreError::InvalidDimensions(_))));
        assert!(a.dot(&b).is_err());
    }

    #[test]
    fn host_only_context_refuses_accelerator_moves() {
        let ctx = Context::host().unwrap();
        let mut v = LocalVector::allocate(&ctx, "v", 3);
        assert_eq!(v.move_to_accelerator(), Err(CoreError::AcceleratorUnavailable));
        assert!(v.is_host());
    }

    #[test]
    fn accelerator_kernels_match_host() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_module("wgpu", log::LevelFilter::Off)
            .try_init();
        let ctx = Context::init(crate::device::ContextConfig::with_accelerator()).unwrap();
        if !ctx.has_accelerator() {
            log::warn!("No accelerator available, skipping");
            return;
        }
        let xs: Vec<f64> = (0..300).map(|i| (i as f64 * 0.37).sin()).collect();
        let ys: Vec<f64> = (0..300).map(|i| (i as f64 * 0.11).cos()).collect();

        let x_host = vector(&ctx, &xs);
        let mut y_host = vector(&ctx, &ys);
        let mut x_dev = vector(&ctx, &xs);
        let mut y_dev = vector(&ctx, &ys);
        x_dev.move_to_accelerator().unwrap();
        y_dev.move_to_accelerator().unwrap();
        assert!(y_dev.is_accelerator());

        y_host.scale_add_scale(0.5, &x_host, 2.0).unwrap();
        y_dev.scale_add_scale(0.5, &x_dev, 2.0).unwrap();
        assert_approx_eq_vec(&y_dev.to_vec().unwrap(), &y_host.to_vec().unwrap(), 1e-12);

        let d_host = y_host.dot(&x_host).unwrap();
        let d_dev = y_dev.dot(&x_dev).unwrap();
        assert!((d_host - d_dev).abs() < 1e-10);

        y_dev.point_wise_mult(&x_dev).unwrap();
        y_host.point_wise_mult(&x_host).unwrap();
        y_dev.move_to_host().unwrap();
        assert_approx_eq_vec(&y_dev.to_vec().unwrap(), &y_host.to_vec().unwrap(), 1e-12);
    }
}
