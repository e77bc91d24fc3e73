use sparsolve_lsolver::algorithms::{
    BiCgStab, Cg, Fgmres, FixedPoint, Gmres, GmresConfig, Idr, IdrConfig,
};
use sparsolve_lsolver::direct::Inversion;
use sparsolve_lsolver::multigrid::{AmgConfig, Cycle, SmoothedAmg};
use sparsolve_lsolver::preconditioners::{
    BlockConfig, BlockPreconditioner, Ic, Ilu, IluConfig, Ilut, IlutConfig, Jacobi,
    MultiColoredIlu, MultiColoredSgs, Sgs, VariablePreconditioner,
};
use sparsolve_lsolver::{
    ConvergenceCriteria, Context, LocalMatrix, LocalVector, Operator, Result, SolveReport,
    SolveStatus, Solver, SolverError, SolverState, SparseMatrix, Triplet, Vector,
};
use std::sync::{Arc, Mutex};

type M = LocalMatrix;
type V = LocalVector;
type LocalSolver = Box<dyn Solver<M, V>>;

fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_module("wgpu", log::LevelFilter::Off)
        .try_init();
}

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

/// Convection-diffusion stencil, nonsymmetric but diagonally dominant.
fn convection_diffusion_2d(n: usize) -> SparseMatrix {
    let mut t = Vec::new();
    for i in 0..n {
        for j in 0..n {
            let row = i * n + j;
            t.push(Triplet::new(row, row, 4.0));
            if i > 0 {
                t.push(Triplet::new(row, row - n, -1.4));
            }
            if i + 1 < n {
                t.push(Triplet::new(row, row + n, -0.6));
            }
            if j > 0 {
                t.push(Triplet::new(row, row - 1, -1.2));
            }
            if j + 1 < n {
                t.push(Triplet::new(row, row + 1, -0.8));
            }
        }
    }
    SparseMatrix::from_triplets(n * n, n * n, &t).unwrap()
}

/// `||b - A x|| / ||b||` computed on the host.
fn true_relative_residual(a: &SparseMatrix, b: &[f64], x: &[f64]) -> f64 {
    let mut r = b.to_vec();
    a.spmv(-1.0, x, 1.0, &mut r).unwrap();
    let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
    norm(&r) / norm(b)
}

/// Builds `solver` on `matrix` and solves `A x = 1` from a zero guess.
fn solve_ones<S>(solver: &mut S, matrix: &SparseMatrix) -> (SolveReport, Vec<f64>)
where
    S: Solver<LocalMatrix, LocalVector> + ?Sized,
{
    let ctx = Context::host().unwrap();
    let a = Arc::new(LocalMatrix::new(&ctx, "A", matrix.clone()));
    solver.set_operator(Arc::clone(&a));
    solver.build().unwrap();
    let mut b = a.new_vector("b").unwrap();
    b.ones().unwrap();
    let mut x = a.new_vector("x").unwrap();
    let report = solver.solve(&b, &mut x).unwrap();
    (report, x.to_vec().unwrap())
}

#[test]
fn gmres_with_block_multicolored_ilu() {
    init_logger();
    let matrix = laplacian_2d(10);
    let blocks: Vec<LocalSolver> = vec![
        Box::new(MultiColoredIlu::default()),
        Box::new(MultiColoredIlu::default()),
    ];
    let config = BlockConfig {
        sizes: vec![50, 50],
        diagonal: false,
    };
    let mut precond = BlockPreconditioner::new(config, blocks).unwrap();
    precond.set_diagonal_solver().unwrap();

    let mut gmres: Gmres<M, V> = Gmres::new(
        ConvergenceCriteria::default().with_max_iter(100),
        GmresConfig { basis_size: 30 },
    );
    gmres.set_preconditioner(Box::new(precond)).unwrap();
    let (report, x) = solve_ones(&mut gmres, &matrix);

    assert!(report.converged(), "{:?}", report.status);
    assert!(report.iterations <= 100);
    assert!(report.relative_residual() < 1e-6);
    assert!(true_relative_residual(&matrix, &vec![1.0; 100], &x) < 1e-6);
}

#[test]
fn fgmres_with_variable_preconditioner() {
    init_logger();
    let matrix = laplacian_2d(10);
    let preconds: Vec<LocalSolver> = vec![
        Box::new(MultiColoredSgs::default()),
        Box::new(MultiColoredIlu::default()),
        Box::new(Ilu::default()),
    ];
    let mut fgmres: Fgmres<M, V> = Fgmres::new(
        ConvergenceCriteria::default().with_max_iter(100),
        GmresConfig { basis_size: 30 },
    );
    fgmres
        .set_preconditioner(Box::new(VariablePreconditioner::new(preconds)))
        .unwrap();
    let (report, x) = solve_ones(&mut fgmres, &matrix);

    assert!(report.converged(), "{:?}", report.status);
    assert!(report.iterations <= 100);
    assert!(report.relative_residual() < 1e-6);
    assert!(true_relative_residual(&matrix, &vec![1.0; 100], &x) < 1e-6);
}

#[test]
fn cg_with_symmetric_gauss_seidel() {
    init_logger();
    let matrix = laplacian_2d(12);
    let mut plain: Cg<M, V> = Cg::new(ConvergenceCriteria::default().with_max_iter(500));
    let (plain_report, _) = solve_ones(&mut plain, &matrix);

    let mut cg: Cg<M, V> = Cg::new(ConvergenceCriteria::default().with_max_iter(500));
    cg.set_preconditioner(Box::new(Sgs::default())).unwrap();
    let (report, x) = solve_ones(&mut cg, &matrix);

    assert!(plain_report.converged());
    assert!(report.converged());
    assert!(report.iterations < plain_report.iterations);
    assert!(true_relative_residual(&matrix, &vec![1.0; 144], &x) < 1e-5);
}

#[test]
fn cg_with_incomplete_cholesky() {
    init_logger();
    let matrix = laplacian_2d(12);
    let mut plain: Cg<M, V> = Cg::new(ConvergenceCriteria::default().with_max_iter(500));
    let (plain_report, _) = solve_ones(&mut plain, &matrix);

    let mut cg: Cg<M, V> = Cg::new(ConvergenceCriteria::default().with_max_iter(500));
    cg.set_preconditioner(Box::new(Ic::new())).unwrap();
    let (report, x) = solve_ones(&mut cg, &matrix);

    assert!(report.converged(), "{:?}", report.status);
    assert!(report.iterations < plain_report.iterations);
    assert!(true_relative_residual(&matrix, &vec![1.0; 144], &x) < 1e-5);
}

#[test]
fn gmres_with_fill_in_ilu_variants() {
    init_logger();
    let matrix = convection_diffusion_2d(12);
    let ilut = IlutConfig {
        threshold: 1e-3,
        ..IlutConfig::default()
    };
    let preconds: Vec<(&str, LocalSolver)> = vec![
        ("ILU(0)", Box::new(Ilu::default()) as LocalSolver),
        ("ILU(1)", Box::new(Ilu::new(IluConfig::default().with_fill_level(1, true)))),
        ("ILU(2) power", Box::new(Ilu::new(IluConfig::default().with_fill_level(2, false)))),
        ("ILUT", Box::new(Ilut::new(ilut))),
    ];
    let mut iterations = Vec::new();
    for (label, precond) in preconds {
        let mut gmres: Gmres<M, V> = Gmres::new(
            ConvergenceCriteria::default().with_max_iter(200),
            GmresConfig::default(),
        );
        gmres.set_preconditioner(precond).unwrap();
        let (report, x) = solve_ones(&mut gmres, &matrix);
        assert!(report.converged(), "{}: {:?}", label, report.status);
        assert!(true_relative_residual(&matrix, &vec![1.0; 144], &x) < 1e-5, "{}", label);
        iterations.push(report.iterations);
    }
    // one level of fill is the stronger preconditioner
    assert!(iterations[1] <= iterations[0], "{:?}", iterations);
}

#[test]
fn bicgstab_with_ilu_on_nonsymmetric_system() {
    init_logger();
    let matrix = convection_diffusion_2d(10);
    let mut solver: BiCgStab<M, V> = BiCgStab::new(ConvergenceCriteria::default().with_max_iter(200));
    solver.set_preconditioner(Box::new(Ilu::default())).unwrap();
    let (report, x) = solve_ones(&mut solver, &matrix);

    assert!(report.converged(), "{:?}", report.status);
    assert!(true_relative_residual(&matrix, &vec![1.0; 100], &x) < 1e-5);
}

#[test]
fn idr_with_four_shadow_vectors() {
    init_logger();
    let matrix = laplacian_2d(10);
    let config = IdrConfig {
        s: 4,
        ..IdrConfig::default()
    };
    let mut idr: Idr<M, V> = Idr::new(ConvergenceCriteria::default().with_max_iter(300), config);
    idr.set_preconditioner(Box::new(Jacobi::<M, V>::new())).unwrap();
    let (report, x) = solve_ones(&mut idr, &matrix);

    // extreme eigenvalues of the 10x10 grid Laplacian: 4 -/+ 4 cos(pi / 11)
    let c = (std::f64::consts::PI / 11.0).cos();
    let kappa = (1.0 + c) / (1.0 - c);
    assert!(report.converged(), "{:?}", report.status);
    assert!(
        (report.iterations as f64) <= 2.0 * kappa,
        "{} iterations, condition number {:.1}",
        report.iterations,
        kappa
    );
    assert!(true_relative_residual(&matrix, &vec![1.0; 100], &x) < 1e-5);
}

#[test]
fn damped_fixed_point_with_jacobi() {
    init_logger();
    let matrix = laplacian_2d(4);
    let mut solver: FixedPoint<M, V> =
        FixedPoint::new(ConvergenceCriteria::default().with_max_iter(2000), 0.8);
    solver.set_preconditioner(Box::new(Jacobi::<M, V>::new())).unwrap();
    let (report, x) = solve_ones(&mut solver, &matrix);

    assert!(report.converged(), "{:?}", report.status);
    assert!(true_relative_residual(&matrix, &vec![1.0; 16], &x) < 1e-5);
}

fn small_amg_config() -> AmgConfig {
    AmgConfig {
        coarsest_size: 10,
        ..AmgConfig::default()
    }
}

#[test]
fn amg_hierarchy_is_galerkin() {
    init_logger();
    let ctx = Context::host().unwrap();
    let a = Arc::new(LocalMatrix::new(&ctx, "A", laplacian_2d(20)));
    let mut amg = SmoothedAmg::preconditioner(small_amg_config());
    amg.set_operator(Arc::clone(&a));
    amg.build().unwrap();

    let levels = amg.levels();
    assert!(levels.len() >= 2);
    for pair in levels.windows(2) {
        let (fine, coarse) = (&pair[0], &pair[1]);
        let p = fine.prolongation().unwrap().csr();
        let r = fine.restriction().unwrap().csr();
        assert_eq!(r, &p.transpose());
        assert_eq!(p.cols(), coarse.size());

        let rap = r
            .matmul(&fine.operator().csr().matmul(p).unwrap())
            .unwrap()
            .to_dense();
        let stored = coarse.operator().csr().to_dense();
        for (expected, actual) in rap.iter().zip(&stored) {
            assert_approx_eq_vec(actual, expected, 1e-12);
        }
    }
    assert!(levels.last().unwrap().prolongation().is_none());
}

#[test]
fn amg_standalone_and_as_preconditioner() {
    init_logger();
    let matrix = laplacian_2d(20);

    let mut standalone = SmoothedAmg::new(
        small_amg_config(),
        ConvergenceCriteria::default().with_max_iter(100),
    );
    let (report, x) = solve_ones(&mut standalone, &matrix);
    assert!(report.converged(), "{:?}", report.status);
    assert!(true_relative_residual(&matrix, &vec![1.0; 400], &x) < 1e-5);

    let mut gmres: Gmres<M, V> = Gmres::new(
        ConvergenceCriteria::default().with_max_iter(100),
        GmresConfig::default(),
    );
    gmres
        .set_preconditioner(Box::new(SmoothedAmg::preconditioner(small_amg_config())))
        .unwrap();
    let (precond_report, x) = solve_ones(&mut gmres, &matrix);
    assert!(precond_report.converged(), "{:?}", precond_report.status);
    assert!(precond_report.iterations < 30);
    assert!(true_relative_residual(&matrix, &vec![1.0; 400], &x) < 1e-5);
}

#[test]
fn amg_w_cycle_converges_faster_than_v_cycle() {
    init_logger();
    let matrix = laplacian_2d(20);
    let criteria = ConvergenceCriteria::default().with_max_iter(100);

    let mut v_cycle = SmoothedAmg::new(small_amg_config(), criteria);
    let (v_report, _) = solve_ones(&mut v_cycle, &matrix);

    let w_config = AmgConfig {
        cycle: Cycle::W,
        ..small_amg_config()
    };
    let mut w_cycle = SmoothedAmg::new(w_config, criteria);
    let (w_report, x) = solve_ones(&mut w_cycle, &matrix);

    assert!(v_report.converged(), "{:?}", v_report.status);
    assert!(w_report.converged(), "{:?}", w_report.status);
    assert!(w_report.iterations <= v_report.iterations);
    assert!(true_relative_residual(&matrix, &vec![1.0; 400], &x) < 1e-5);
}

#[test]
fn amg_plain_aggregation_uses_piecewise_constant_transfer() {
    init_logger();
    let matrix = laplacian_2d(20);
    let config = AmgConfig {
        interp_relax: 0.0,
        ..small_amg_config()
    };
    let mut amg = SmoothedAmg::new(config, ConvergenceCriteria::default().with_max_iter(200));
    let (report, x) = solve_ones(&mut amg, &matrix);
    assert!(report.converged(), "{:?}", report.status);
    assert!(true_relative_residual(&matrix, &vec![1.0; 400], &x) < 1e-5);

    let levels = amg.levels();
    assert!(levels.len() >= 2);
    let p = levels[0].prolongation().unwrap().csr();
    for row in 0..p.rows() {
        let (_, values) = p.row(row);
        assert!(values.len() <= 1);
        assert!(values.iter().all(|&v| v == 1.0));
    }
}

#[test]
fn amg_rebuild_numeric_tracks_scaled_operator() {
    init_logger();
    let ctx = Context::host().unwrap();
    let matrix = laplacian_2d(12);
    let mut amg = SmoothedAmg::new(
        small_amg_config(),
        ConvergenceCriteria::default()
            .with_rel_tol(1e-10)
            .with_max_iter(200),
    );
    amg.set_operator(Arc::new(LocalMatrix::new(&ctx, "A", matrix.clone())));
    amg.build().unwrap();
    let sizes: Vec<usize> = amg.levels().iter().map(|l| l.size()).collect();

    let mut scaled = LocalMatrix::new(&ctx, "2A", matrix.clone());
    scaled.scale(2.0).unwrap();
    let scaled = Arc::new(scaled);
    amg.set_operator(Arc::clone(&scaled));
    amg.rebuild_numeric().unwrap();
    assert_eq!(amg.levels().iter().map(|l| l.size()).collect::<Vec<_>>(), sizes);

    let mut b = scaled.new_vector("b").unwrap();
    b.ones().unwrap();
    let mut x = scaled.new_vector("x").unwrap();
    assert!(amg.solve(&b, &mut x).unwrap().converged());

    // 2A x = 1 has the solution of A x = 1/2
    let mut reference = Inversion::new();
    reference.set_operator(Arc::new(LocalMatrix::new(&ctx, "A", matrix)));
    reference.build().unwrap();
    let half = LocalVector::from_slice(&ctx, "half", &[0.5; 144]);
    let mut exact = LocalVector::allocate(&ctx, "exact", 144);
    reference.solve(&half, &mut exact).unwrap();
    assert_approx_eq_vec(&x.to_vec().unwrap(), &exact.to_vec().unwrap(), 1e-6);
}

#[test]
fn block_size_mismatch_is_reported() {
    let ctx = Context::host().unwrap();
    let blocks: Vec<LocalSolver> = vec![Box::new(Ilu::default()), Box::new(Ilu::default())];
    let config = BlockConfig {
        sizes: vec![40, 40],
        diagonal: false,
    };
    let mut block = BlockPreconditioner::new(config, blocks).unwrap();
    block.set_operator(Arc::new(LocalMatrix::new(&ctx, "A", laplacian_2d(10))));
    assert_eq!(
        block.build(),
        Err(SolverError::BlockSizeMismatch {
            expected: 100,
            actual: 80
        })
    );
    assert_eq!(block.state(), SolverState::Uninitialized);
}

/// Copies `rhs` and records its id on every application.
#[derive(Debug)]
struct Probe {
    id: usize,
    calls: Arc<Mutex<Vec<usize>>>,
    state: SolverState,
}

impl Probe {
    fn boxed(id: usize, calls: &Arc<Mutex<Vec<usize>>>) -> LocalSolver {
        Box::new(Probe {
            id,
            calls: Arc::clone(calls),
            state: SolverState::Uninitialized,
        })
    }
}

impl Solver<LocalMatrix, LocalVector> for Probe {
    fn name(&self) -> &str {
        "Probe"
    }

    fn set_operator(&mut self, _op: Arc<LocalMatrix>) {}

    fn build(&mut self) -> Result<()> {
        self.state = SolverState::Built;
        Ok(())
    }

    fn rebuild_numeric(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear(&mut self) {
        self.state = SolverState::Cleared;
    }

    fn solve(&mut self, rhs: &LocalVector, x: &mut LocalVector) -> Result<SolveReport> {
        self.calls.lock().unwrap().push(self.id);
        x.copy_from(rhs)?;
        Ok(SolveReport {
            status: SolveStatus::Converged,
            iterations: 1,
            initial_residual: 0.0,
            final_residual: 0.0,
        })
    }

    fn move_to_host_local_data(&mut self) -> Result<()> {
        Ok(())
    }

    fn move_to_accelerator_local_data(&mut self) -> Result<()> {
        Ok(())
    }

    fn state(&self) -> SolverState {
        self.state
    }

    fn describe(&self) -> String {
        format!("Probe {}", self.id)
    }
}

#[test]
fn variable_preconditioner_cycles_round_robin() {
    let ctx = Context::host().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut variable: VariablePreconditioner<M, V> = VariablePreconditioner::new(vec![
        Probe::boxed(0, &calls),
        Probe::boxed(1, &calls),
        Probe::boxed(2, &calls),
    ]);
    variable.set_operator(Arc::new(LocalMatrix::new(&ctx, "A", laplacian_2d(2))));
    variable.build().unwrap();

    let rhs = LocalVector::from_slice(&ctx, "r", &[1.0, 2.0, 3.0, 4.0]);
    let mut z = LocalVector::allocate(&ctx, "z", 4);
    for _ in 0..4 {
        variable.solve(&rhs, &mut z).unwrap();
    }
    assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2, 0]);
    assert_eq!(z.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    variable.clear();
    variable.build().unwrap();
    variable.solve(&rhs, &mut z).unwrap();
    assert_eq!(calls.lock().unwrap().last(), Some(&0));
}

#[test]
fn failed_build_leaves_nothing_built() {
    let ctx = Context::host().unwrap();
    // rows 2 and 3 have no diagonal entry
    let t = vec![
        Triplet::new(0, 0, 4.0),
        Triplet::new(1, 1, 4.0),
        Triplet::new(2, 3, 1.0),
        Triplet::new(3, 2, 1.0),
    ];
    let singular = Arc::new(LocalMatrix::from_triplets(&ctx, "S", 4, 4, &t).unwrap());
    let blocks: Vec<LocalSolver> = vec![Box::new(Ilu::default()), Box::new(Ilu::default())];
    let config = BlockConfig {
        sizes: vec![2, 2],
        diagonal: true,
    };
    let mut gmres: Gmres<M, V> =
        Gmres::new(ConvergenceCriteria::default(), GmresConfig::default());
    gmres
        .set_preconditioner(Box::new(BlockPreconditioner::new(config, blocks).unwrap()))
        .unwrap();
    gmres.set_operator(singular);
    assert_eq!(
        gmres.build(),
        Err(SolverError::SingularSystem { rank: 0, size: 2 })
    );
    assert_eq!(gmres.state(), SolverState::Uninitialized);

    let matrix = laplacian_2d(2);
    let (report, x) = solve_ones(&mut gmres, &matrix);
    assert!(report.converged(), "{:?}", report.status);
    assert!(true_relative_residual(&matrix, &[1.0; 4], &x) < 1e-6);
}

#[test]
fn lifecycle_errors() {
    let ctx = Context::host().unwrap();
    let a = Arc::new(LocalMatrix::new(&ctx, "A", laplacian_2d(3)));
    let b = LocalVector::from_slice(&ctx, "b", &[1.0; 9]);
    let mut x = LocalVector::allocate(&ctx, "x", 9);

    let mut cg: Cg<M, V> = Cg::new(ConvergenceCriteria::default());
    assert!(matches!(cg.build(), Err(SolverError::MissingOperator(_))));
    assert!(matches!(cg.solve(&b, &mut x), Err(SolverError::NotBuilt(_))));

    cg.set_operator(Arc::clone(&a));
    cg.build().unwrap();
    assert_eq!(cg.state(), SolverState::Built);
    assert!(matches!(cg.build(), Err(SolverError::AlreadyBuilt(_))));
    assert!(matches!(
        cg.set_preconditioner(Box::new(Jacobi::<M, V>::new())),
        Err(SolverError::AlreadyBuilt(_))
    ));

    cg.clear();
    assert_eq!(cg.state(), SolverState::Cleared);
    assert!(matches!(cg.solve(&b, &mut x), Err(SolverError::NotBuilt(_))));
    assert!(matches!(cg.rebuild_numeric(), Err(SolverError::NotBuilt(_))));

    cg.build().unwrap();
    assert!(cg.solve(&b, &mut x).unwrap().converged());
}

#[test]
fn singular_coarse_system_is_rejected() {
    let ctx = Context::host().unwrap();
    // rank 1: every row is a multiple of the first
    let dense = vec![vec![1.0, 1.0], vec![2.0, 2.0]];
    let mut inversion = Inversion::new();
    inversion.set_operator(Arc::new(LocalMatrix::from_dense(&ctx, "S", &dense).unwrap()));
    assert_eq!(
        inversion.build(),
        Err(SolverError::SingularSystem { rank: 1, size: 2 })
    );
}
