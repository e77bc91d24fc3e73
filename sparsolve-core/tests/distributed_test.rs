use sparsolve_core::{
    Communicator, Context, CoreError, ExchangeStatus, GlobalMatrix, GlobalVector, LocalMatrix,
    LocalVector, Operator, ParallelManager, SparseMatrix, ThreadComm, Triplet, Vector,
};
use std::sync::Arc;
use std::thread;

// Helper for float comparison in tests
fn assert_approx_eq_vec(a: &[f64], b: &[f64], tolerance: f64) {
    assert_eq!(a.len(), b.len(), "Vector lengths differ");
    for i in 0..a.len() {
        let diff = (a[i] - b[i]).abs();
        assert!(
            diff <= tolerance,
            "Verification failed at index {}: expected {}, got {}, diff {}",
            i,
            b[i],
            a[i],
            diff
        );
    }
}

/// Runs `f` once per rank, each on its own thread.
fn run_partitions<F>(size: usize, f: F)
where
    F: Fn(Arc<dyn Communicator>) + Sync,
{
    let world = ThreadComm::world(size);
    thread::scope(|s| {
        for comm in world {
            let f = &f;
            let comm: Arc<dyn Communicator> = comm;
            s.spawn(move || f(comm));
        }
    });
}

/// 2D 5-point Laplacian on an `n x n` grid.
fn laplacian_2d(n: usize) -> SparseMatrix {
    let mut t = Vec::new();
    for i in 0..n {
        for j in 0..n {
            let row = i * n + j;
            t.push(Triplet::new(row, row, 4.0));
            if i > 0 {
                t.push(Triplet::new(row, row - n, -1.0));
            }
            if i + 1 < n {
                t.push(Triplet::new(row, row + n, -1.0));
            }
            if j > 0 {
                t.push(Triplet::new(row, row - 1, -1.0));
            }
            if j + 1 < n {
                t.push(Triplet::new(row, row + 1, -1.0));
            }
        }
    }
    SparseMatrix::from_triplets(n * n, n * n, &t).unwrap()
}

fn global_values(len: usize) -> Vec<f64> {
    (0..len).map(|i| ((i * 7919) % 113) as f64 / 17.0 - 3.0).collect()
}

#[test]
fn ghost_round_trip_matches_owner_values() {
    let matrix = laplacian_2d(6);
    let values = global_values(36);
    run_partitions(3, |comm| {
        let ctx = Context::host().unwrap();
        let a = GlobalMatrix::from_global_csr(&ctx, comm, &matrix, vec![0, 10, 25, 36]).unwrap();
        let pm = Arc::clone(a.manager());
        let x = GlobalVector::from_global_slice(&ctx, "x", &pm, &values).unwrap();

        x.update_ghost_values_async(&x).unwrap();
        assert_eq!(x.exchange_status(), ExchangeStatus::Pending);
        x.update_ghost_values_sync().unwrap();
        assert_eq!(x.exchange_status(), ExchangeStatus::Ready);

        let ghost = x.ghost_values().unwrap();
        assert!(!ghost.is_empty());
        for (slot, &g) in pm.ghost_global().iter().enumerate() {
            assert_eq!(ghost[slot], values[g], "ghost slot {} (global {})", slot, g);
        }
    });
}

#[test]
fn ghost_reflects_values_at_issue_time() {
    let matrix = laplacian_2d(4);
    run_partitions(2, |comm| {
        let ctx = Context::host().unwrap();
        let a = GlobalMatrix::from_global_csr(&ctx, comm, &matrix, vec![0, 8, 16]).unwrap();
        let mut x = a.new_vector("x").unwrap();
        x.set_values(1.0).unwrap();
        x.update_ghost_values_async(&x).unwrap();
        // Source values are captured when the exchange is issued.
        x.scale(5.0).unwrap();
        x.update_ghost_values_sync().unwrap();
        assert!(x.ghost_values().unwrap().iter().all(|&g| g == 1.0));
    });
}

#[test]
fn reductions_are_partition_invariant() {
    let values = global_values(50);
    let other: Vec<f64> = values.iter().map(|v| v * 0.5 - 1.0).collect();

    let ctx = Context::host().unwrap();
    let serial_x = LocalVector::from_slice(&ctx, "x", &values);
    let serial_y = LocalVector::from_slice(&ctx, "y", &other);
    let expected_dot = serial_x.dot(&serial_y).unwrap();
    let expected_norm = serial_x.norm().unwrap();
    let expected_amax = serial_x.amax().unwrap();

    for offsets in [vec![0, 50], vec![0, 20, 50], vec![0, 7, 7, 31, 50]] {
        let parts = offsets.len() - 1;
        run_partitions(parts, |comm| {
            let ctx = Context::host().unwrap();
            let pm = ParallelManager::from_ghost_indices(comm, offsets.clone(), Vec::new()).unwrap();
            let x = GlobalVector::from_global_slice(&ctx, "x", &pm, &values).unwrap();
            let y = GlobalVector::from_global_slice(&ctx, "y", &pm, &other).unwrap();

            let dot = x.dot(&y).unwrap();
            let norm = x.norm().unwrap();
            assert!((dot - expected_dot).abs() <= 1e-12 * expected_dot.abs().max(1.0));
            assert!((norm - expected_norm).abs() <= 1e-12 * expected_norm);
            assert_eq!(x.amax().unwrap(), expected_amax);
            assert_eq!(x.size(), 50);
        });
    }
}

#[test]
fn distributed_apply_matches_serial() {
    let matrix = laplacian_2d(5);
    let values = global_values(25);
    let ctx = Context::host().unwrap();
    let serial = LocalMatrix::new(&ctx, "A", matrix.clone());
    let x = LocalVector::from_slice(&ctx, "x", &values);
    let mut y = serial.new_vector("y").unwrap();
    serial.apply(&x, &mut y).unwrap();
    let expected = y.to_vec().unwrap();

    run_partitions(3, |comm| {
        let ctx = Context::host().unwrap();
        let a = GlobalMatrix::from_global_csr(&ctx, comm, &matrix, vec![0, 9, 16, 25]).unwrap();
        assert_eq!(a.nnz(), matrix.nnz());
        let pm = Arc::clone(a.manager());
        let x = GlobalVector::from_global_slice(&ctx, "x", &pm, &values).unwrap();
        let mut y = a.new_vector("y").unwrap();
        a.apply(&x, &mut y).unwrap();
        assert_approx_eq_vec(&y.to_global_vec().unwrap(), &expected, 1e-12);

        // y = y - A x
        a.apply_add(&x, -1.0, &mut y).unwrap();
        assert!(y.norm().unwrap() < 1e-12);
    });
}

#[test]
fn stale_ghost_is_not_readable() {
    run_partitions(2, |comm| {
        let ctx = Context::host().unwrap();
        let matrix = laplacian_2d(3);
        let a = GlobalMatrix::from_global_csr(&ctx, comm, &matrix, vec![0, 4, 9]).unwrap();
        let mut x = a.new_vector("x").unwrap();
        x.ones().unwrap();
        x.update_ghost_values_async(&x).unwrap();
        assert!(matches!(
            x.update_ghost_values_async(&x),
            Err(CoreError::ExchangeInFlight(_))
        ));
        x.update_ghost_values_sync().unwrap();
        x.add_scale(&a.new_vector("z").unwrap(), 1.0).unwrap();
        assert!(matches!(
            x.ghost_values(),
            Err(CoreError::GhostNotSynchronized(_))
        ));
    });
}
