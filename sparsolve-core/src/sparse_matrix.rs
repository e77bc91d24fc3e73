use crate::buffer::DeviceBuffer;
use crate::context::GpuContext;
use crate::error::{CoreError, Result};
use std::ops::Range;
use std::sync::Arc;

/// Represents a sparse matrix in Compressed Sparse Row (CSR) format on the host.
///
/// Column indices are sorted and unique within each row.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    /// Number of rows.
    rows: usize,
    /// Number of columns.
    cols: usize,
    /// Vector containing the non-zero values of the matrix.
    pub(crate) values: Vec<f64>,
    /// Vector containing the column indices corresponding to the values.
    pub(crate) col_indices: Vec<usize>,
    /// `row_ptr[i]..row_ptr[i + 1]` is the slice of row `i`; length `rows + 1`.
    pub(crate) row_ptr: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triplet {
    row: usize,
    col: usize,
    value: f64,
}

impl Triplet {
    pub fn new(row: usize, col: usize, value: f64) -> Self {
        Triplet { row, col, value }
    }

    pub fn row(&self) -> usize {
        self.row
    }

    pub fn col(&self) -> usize {
        self.col
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

impl SparseMatrix {
    /// Creates a new empty SparseMatrix with given dimensions.
    pub fn new(rows: usize, cols: usize) -> Self {
        SparseMatrix {
            rows,
            cols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_ptr: vec![0; rows + 1],
        }
    }

    pub fn identity(n: usize) -> Self {
        SparseMatrix {
            rows: n,
            cols: n,
            values: vec![1.0; n],
            col_indices: (0..n).collect(),
            row_ptr: (0..=n).collect(),
        }
    }

    /// Builds a matrix from coordinate entries. Duplicates are summed.
    pub fn from_triplets(rows: usize, cols: usize, triplets: &[Triplet]) -> Result<Self> {
        if let Some(t) = triplets.iter().find(|t| t.row >= rows || t.col >= cols) {
            return Err(CoreError::InvalidDimensions(format!(
                "Triplet ({}, {}) out of bounds for {}x{} matrix",
                t.row, t.col, rows, cols
            )));
        }
        let mut coords = triplets.to_vec();
        coords.sort_unstable_by_key(|t| (t.row, t.col));

        let mut row_ptr = vec![0usize; rows + 1];
        let mut values: Vec<f64> = Vec::with_capacity(coords.len());
        let mut col_indices: Vec<usize> = Vec::with_capacity(coords.len());
        let mut last: Option<(usize, usize)> = None;
        for t in &coords {
            if last == Some((t.row, t.col)) {
                if let Some(v) = values.last_mut() {
                    *v += t.value;
                }
                continue;
            }
            values.push(t.value);
            col_indices.push(t.col);
            row_ptr[t.row + 1] += 1;
            last = Some((t.row, t.col));
        }
        for i in 1..=rows {
            row_ptr[i] += row_ptr[i - 1];
        }

        Ok(SparseMatrix {
            rows,
            cols,
            values,
            col_indices,
            row_ptr,
        })
    }

    /// Creates a SparseMatrix from CSR components. Rows are sorted by column
    /// if they are not already.
    pub fn from_csr(
        rows: usize,
        cols: usize,
        values: Vec<f64>,
        col_indices: Vec<usize>,
        row_ptr: Vec<usize>,
    ) -> Result<Self> {
        if row_ptr.len() != rows + 1 {
            return Err(CoreError::InvalidDimensions(
                "row_ptr length must be rows + 1".to_string(),
            ));
        }
        if values.len() != col_indices.len() {
            return Err(CoreError::InvalidDimensions(
                "values and col_indices must have the same length".to_string(),
            ));
        }
        if row_ptr.last() != Some(&values.len()) || row_ptr[0] != 0 {
            return Err(CoreError::InvalidDimensions(
                "Last element of row_ptr must equal the number of non-zero values".to_string(),
            ));
        }
        if row_ptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(CoreError::InvalidDimensions(
                "row_ptr must be non-decreasing".to_string(),
            ));
        }
        if col_indices.iter().any(|&c| c >= cols) {
            return Err(CoreError::InvalidDimensions(
                "Column index out of bounds".to_string(),
            ));
        }

        let mut matrix = SparseMatrix {
            rows,
            cols,
            values,
            col_indices,
            row_ptr,
        };
        matrix.sort_rows();
        Ok(matrix)
    }

    fn sort_rows(&mut self) {
        for row in 0..self.rows {
            let range = self.row_ptr[row]..self.row_ptr[row + 1];
            let cols = &self.col_indices[range.clone()];
            if cols.windows(2).all(|w| w[0] < w[1]) {
                continue;
            }
            let mut entries: Vec<(usize, f64)> = cols
                .iter()
                .copied()
                .zip(self.values[range.clone()].iter().copied())
                .collect();
            entries.sort_by_key(|&(c, _)| c);
            for (k, (c, v)) in range.zip(entries) {
                self.col_indices[k] = c;
                self.values[k] = v;
            }
        }
    }

    /// Creates a SparseMatrix from a dense row-major representation, dropping zeros.
    pub fn from_dense(dense: &[Vec<f64>]) -> Result<Self> {
        let rows = dense.len();
        let cols = dense.first().map_or(0, |row| row.len());
        if dense.iter().any(|row| row.len() != cols) {
            return Err(CoreError::InvalidDimensions(
                "Input dense matrix must be rectangular".to_string(),
            ));
        }
        let mut values = Vec::new();
        let mut col_indices = Vec::new();
        let mut row_ptr = Vec::with_capacity(rows + 1);
        row_ptr.push(0);
        for row in dense {
            for (c, &val) in row.iter().enumerate() {
                if val != 0.0 {
                    values.push(val);
                    col_indices.push(c);
                }
            }
            row_ptr.push(values.len());
        }
        Ok(SparseMatrix {
            rows,
            cols,
            values,
            col_indices,
            row_ptr,
        })
    }

    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let mut dense = vec![vec![0.0; self.cols]; self.rows];
        for t in self.iter() {
            dense[t.row][t.col] = t.value;
        }
        dense
    }

    /// Returns the dimensions of the matrix (rows, cols).
    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    /// Returns the number of non-zero elements.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Gets the stored value at a specific row and column.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        let (cols, values) = self.row(row);
        cols.binary_search(&col).ok().map(|k| values[k])
    }

    /// Column indices and values of one row.
    pub fn row(&self, row: usize) -> (&[usize], &[f64]) {
        let range = self.row_ptr[row]..self.row_ptr[row + 1];
        (&self.col_indices[range.clone()], &self.values[range])
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    pub fn iter(&self) -> impl Iterator<Item = Triplet> + '_ {
        (0..self.rows).flat_map(move |row| {
            let (cols, values) = self.row(row);
            cols.iter()
                .zip(values)
                .map(move |(&col, &value)| Triplet { row, col, value })
        })
    }

    // --- Kernels ---

    /// Entry `row` of `A x`.
    #[inline]
    pub(crate) fn row_dot(&self, row: usize, x: &[f64]) -> f64 {
        let (cols, values) = self.row(row);
        cols.iter().zip(values).map(|(&c, &v)| v * x[c]).sum()
    }

    /// Sequential `y = alpha * A * x + beta * y`.
    pub fn spmv(&self, alpha: f64, x: &[f64], beta: f64, y: &mut [f64]) -> Result<()> {
        self.check_spmv(x.len(), y.len())?;
        for (row, yi) in y.iter_mut().enumerate() {
            let ax = self.row_dot(row, x);
            *yi = if beta == 0.0 {
                alpha * ax
            } else {
                alpha * ax + beta * *yi
            };
        }
        Ok(())
    }

    pub(crate) fn check_spmv(&self, x_len: usize, y_len: usize) -> Result<()> {
        if x_len != self.cols || y_len != self.rows {
            return Err(CoreError::InvalidDimensions(format!(
                "spmv: {}x{} matrix with x of {} and y of {}",
                self.rows, self.cols, x_len, y_len
            )));
        }
        Ok(())
    }

    pub fn transpose(&self) -> SparseMatrix {
        let mut row_ptr = vec![0usize; self.cols + 1];
        for &c in &self.col_indices {
            row_ptr[c + 1] += 1;
        }
        for i in 1..=self.cols {
            row_ptr[i] += row_ptr[i - 1];
        }
        let mut next = row_ptr.clone();
        let mut col_indices = vec![0usize; self.nnz()];
        let mut values = vec![0.0; self.nnz()];
        // Rows are visited in order, so every transposed row comes out sorted.
        for t in self.iter() {
            let pos = next[t.col];
            col_indices[pos] = t.row;
            values[pos] = t.value;
            next[t.col] += 1;
        }
        SparseMatrix {
            rows: self.cols,
            cols: self.rows,
            values,
            col_indices,
            row_ptr,
        }
    }

    /// Sparse product `self * other`.
    pub fn matmul(&self, other: &SparseMatrix) -> Result<SparseMatrix> {
        if self.cols != other.rows {
            return Err(CoreError::InvalidDimensions(format!(
                "matmul: {}x{} times {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        let mut accumulator = vec![0.0; other.cols];
        let mut marker: Vec<Option<usize>> = vec![None; other.cols];
        let mut row_ptr = Vec::with_capacity(self.rows + 1);
        row_ptr.push(0);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        let mut touched = Vec::new();

        for row in 0..self.rows {
            touched.clear();
            let (a_cols, a_vals) = self.row(row);
            for (&k, &a) in a_cols.iter().zip(a_vals) {
                let (b_cols, b_vals) = other.row(k);
                for (&j, &b) in b_cols.iter().zip(b_vals) {
                    if marker[j] != Some(row) {
                        marker[j] = Some(row);
                        accumulator[j] = 0.0;
                        touched.push(j);
                    }
                    accumulator[j] += a * b;
                }
            }
            touched.sort_unstable();
            for &j in &touched {
                col_indices.push(j);
                values.push(accumulator[j]);
            }
            row_ptr.push(col_indices.len());
        }

        Ok(SparseMatrix {
            rows: self.rows,
            cols: other.cols,
            values,
            col_indices,
            row_ptr,
        })
    }

    /// Block `rows x cols` re-indexed from zero.
    pub fn extract_submatrix(&self, rows: Range<usize>, cols: Range<usize>) -> Result<SparseMatrix> {
        if rows.end > self.rows || cols.end > self.cols || rows.start > rows.end || cols.start > cols.end {
            return Err(CoreError::InvalidDimensions(format!(
                "submatrix {:?}x{:?} outside {}x{}",
                rows, cols, self.rows, self.cols
            )));
        }
        let mut row_ptr = Vec::with_capacity(rows.len() + 1);
        row_ptr.push(0);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        for row in rows.clone() {
            let (c, v) = self.row(row);
            for (&col, &val) in c.iter().zip(v) {
                if cols.contains(&col) {
                    col_indices.push(col - cols.start);
                    values.push(val);
                }
            }
            row_ptr.push(col_indices.len());
        }
        Ok(SparseMatrix {
            rows: rows.len(),
            cols: cols.len(),
            values,
            col_indices,
            row_ptr,
        })
    }

    /// Diagonal entries; structurally missing ones are zero.
    pub fn extract_diagonal(&self) -> Vec<f64> {
        (0..self.rows.min(self.cols))
            .map(|i| self.get(i, i).unwrap_or(0.0))
            .collect()
    }

    /// Symmetric permutation: entry `(i, j)` moves to `(perm[i], perm[j])`.
    pub fn permute(&self, perm: &[usize]) -> Result<SparseMatrix> {
        if !self.is_square() || perm.len() != self.rows {
            return Err(CoreError::InvalidDimensions(format!(
                "permutation of length {} for {}x{} matrix",
                perm.len(),
                self.rows,
                self.cols
            )));
        }
        let mut seen = vec![false; perm.len()];
        for &p in perm {
            if p >= perm.len() || std::mem::replace(&mut seen[p], true) {
                return Err(CoreError::InvalidDimensions(
                    "permutation is not a bijection".to_string(),
                ));
            }
        }
        let triplets: Vec<Triplet> = self
            .iter()
            .map(|t| Triplet::new(perm[t.row], perm[t.col], t.value))
            .collect();
        SparseMatrix::from_triplets(self.rows, self.cols, &triplets)
    }

    pub fn scale(&mut self, alpha: f64) {
        self.values.iter_mut().for_each(|v| *v *= alpha);
    }

    pub fn info(&self) -> String {
        format!(
            "SparseMatrix {}x{}, nnz={}",
            self.rows,
            self.cols,
            self.nnz()
        )
    }
}

/// CSR arrays mirrored in accelerator memory. Indices are `u32`.
#[derive(Debug)]
pub struct DeviceCsr {
    pub(crate) rows: usize,
    pub(crate) cols: usize,
    pub(crate) nnz: usize,
    pub(crate) values: wgpu::Buffer,
    pub(crate) col_indices: wgpu::Buffer,
    pub(crate) row_ptr: wgpu::Buffer,
}

impl DeviceCsr {
    pub(crate) fn upload(context: &Arc<GpuContext>, matrix: &SparseMatrix) -> Result<Self> {
        let to_u32 = |v: &[usize]| -> Result<Vec<u32>> {
            v.iter()
                .map(|&x| {
                    u32::try_from(x).map_err(|_| {
                        CoreError::Unsupported(format!("index {} exceeds device index range", x))
                    })
                })
                .collect()
        };
        let col_indices_u32 = to_u32(&matrix.col_indices)?;
        let row_ptr_u32 = to_u32(&matrix.row_ptr)?;

        let values = DeviceBuffer::upload(context, "csr values", &matrix.values);
        Ok(Self {
            rows: matrix.rows,
            cols: matrix.cols,
            nnz: matrix.nnz(),
            values: values.into_inner(),
            col_indices: DeviceBuffer::upload_indices(context, "csr col indices", &col_indices_u32),
            row_ptr: DeviceBuffer::upload_indices(context, "csr row pointers", &row_ptr_u32),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn nnz(&self) -> usize {
        self.nnz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // [ 1.0, 0.0, 2.0, 0.0 ]
    // [ 0.0, 3.0, 0.0, 4.0 ]
    // [ 0.0, 0.0, 5.0, 0.0 ]
    fn sample() -> SparseMatrix {
        SparseMatrix::from_csr(
            3,
            4,
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
            vec![0, 2, 1, 3, 2],
            vec![0, 2, 4, 5],
        )
        .unwrap()
    }

    #[test]
    fn test_from_csr_validation() {
        match SparseMatrix::from_csr(3, 4, vec![1.0], vec![0], vec![0, 1]) {
            Err(CoreError::InvalidDimensions(msg)) => assert!(msg.contains("row_ptr length")),
            other => panic!("Expected InvalidDimensions error, got {:?}", other),
        }
        match SparseMatrix::from_csr(2, 3, vec![1.0, 2.0], vec![0, 3], vec![0, 1, 2]) {
            Err(CoreError::InvalidDimensions(msg)) => {
                assert!(msg.contains("Column index out of bounds"))
            }
            other => panic!("Expected InvalidDimensions error, got {:?}", other),
        }
        assert!(SparseMatrix::from_csr(3, 4, vec![1.0, 2.0], vec![0, 1], vec![0, 1, 1, 1]).is_err());
    }

    #[test]
    fn test_from_csr_sorts_rows() {
        let m = SparseMatrix::from_csr(1, 3, vec![3.0, 1.0], vec![2, 0], vec![0, 2]).unwrap();
        assert_eq!(m.col_indices(), &[0, 2]);
        assert_eq!(m.values(), &[1.0, 3.0]);
    }

    #[test]
    fn test_get() {
        let m = sample();
        assert_eq!(m.get(0, 2), Some(2.0));
        assert_eq!(m.get(1, 3), Some(4.0));
        assert_eq!(m.get(2, 0), None);
        assert_eq!(m.get(3, 0), None);
    }

    #[test]
    fn test_triplets_sum_duplicates() {
        let m = SparseMatrix::from_triplets(
            2,
            2,
            &[
                Triplet::new(1, 1, 2.0),
                Triplet::new(0, 0, 1.0),
                Triplet::new(1, 1, 3.0),
            ],
        )
        .unwrap();
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.get(1, 1), Some(5.0));
        assert!(SparseMatrix::from_triplets(2, 2, &[Triplet::new(2, 0, 1.0)]).is_err());
    }

    #[test]
    fn test_spmv() {
        let m = sample();
        let x = [1.0, 1.0, 1.0, 1.0];
        let mut y = [1.0, 1.0, 1.0];
        m.spmv(2.0, &x, 1.0, &mut y).unwrap();
        assert_eq!(y, [7.0, 15.0, 11.0]);
        assert!(m.spmv(1.0, &x[..3], 0.0, &mut y).is_err());
    }

    #[test]
    fn test_transpose_and_dense() {
        let m = sample();
        let t = m.transpose();
        assert_eq!(t.dims(), (4, 3));
        assert_eq!(t.transpose(), m);
        let dense = m.to_dense();
        assert_eq!(SparseMatrix::from_dense(&dense).unwrap(), m);
        for (i, row) in t.to_dense().iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert_eq!(v, dense[j][i]);
            }
        }
    }

    #[test]
    fn test_matmul_matches_dense_product() {
        let a = sample();
        let at = a.transpose();
        let p = a.matmul(&at).unwrap();
        let ad = a.to_dense();
        let pd = p.to_dense();
        for i in 0..3 {
            for j in 0..3 {
                let expected: f64 = (0..4).map(|k| ad[i][k] * ad[j][k]).sum();
                assert_eq!(pd[i][j], expected);
            }
        }
        assert!(a.matmul(&a).is_err());
    }

    #[test]
    fn test_submatrix_diagonal_permute() {
        let m = sample();
        let sub = m.extract_submatrix(1..3, 1..4).unwrap();
        assert_eq!(sub.to_dense(), vec![vec![3.0, 0.0, 4.0], vec![0.0, 5.0, 0.0]]);
        assert_eq!(m.extract_diagonal(), vec![1.0, 3.0, 5.0]);

        let sq = SparseMatrix::from_dense(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let p = sq.permute(&[1, 0]).unwrap();
        assert_eq!(p.to_dense(), vec![vec![4.0, 3.0], vec![2.0, 1.0]]);
        assert!(sq.permute(&[0, 0]).is_err());
    }
}
