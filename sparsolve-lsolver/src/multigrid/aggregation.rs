//! Strength of connection and three-phase aggregation for smoothed
//! aggregation AMG (Vanek, Mandel and Brezina, 1996).

use sparsolve_core::SparseMatrix;

/// `|a_ij| >= eps * sqrt(|a_ii * a_jj|)` for `i != j`.
#[inline]
pub fn is_strong(a_ij: f64, a_ii: f64, a_jj: f64, eps: f64) -> bool {
    a_ij.abs() >= eps * (a_ii * a_jj).abs().sqrt()
}

/// Strongly coupled neighbours of every row.
pub fn strong_neighbours(a: &SparseMatrix, eps: f64) -> Vec<Vec<usize>> {
    let diag = a.extract_diagonal();
    (0..a.rows())
        .map(|i| {
            let (cols, vals) = a.row(i);
            cols.iter()
                .zip(vals)
                .filter(|&(&j, &v)| j != i && v != 0.0 && is_strong(v, diag[i], diag[j], eps))
                .map(|(&j, _)| j)
                .collect()
        })
        .collect()
}

/// Fine node to aggregate map.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    /// `None` for nodes without strong connections.
    pub map: Vec<Option<usize>>,
    pub count: usize,
}

impl Aggregation {
    pub fn unaggregated(&self) -> usize {
        self.map.iter().filter(|m| m.is_none()).count()
    }
}

/// Three phases over the strong graph:
/// 1. a node whose strong neighbourhood is entirely free becomes the root of
///    a new aggregate holding that neighbourhood;
/// 2. free nodes join a neighbouring phase-1 aggregate;
/// 3. what is left is grouped with its still free strong neighbours.
pub fn aggregate(a: &SparseMatrix, eps: f64) -> Aggregation {
    let n = a.rows();
    let strong = strong_neighbours(a, eps);
    let mut map: Vec<Option<usize>> = vec![None; n];
    let mut count = 0;

    for i in 0..n {
        if map[i].is_some() || strong[i].is_empty() {
            continue;
        }
        if strong[i].iter().all(|&j| map[j].is_none()) {
            map[i] = Some(count);
            for &j in &strong[i] {
                map[j] = Some(count);
            }
            count += 1;
        }
    }

    let phase_one = map.clone();
    for i in 0..n {
        if map[i].is_some() {
            continue;
        }
        if let Some(agg) = strong[i].iter().find_map(|&j| phase_one[j]) {
            map[i] = Some(agg);
        }
    }

    for i in 0..n {
        if map[i].is_some() || strong[i].is_empty() {
            continue;
        }
        map[i] = Some(count);
        for &j in &strong[i] {
            if map[j].is_none() {
                map[j] = Some(count);
            }
        }
        count += 1;
    }

    Aggregation { map, count }
}
