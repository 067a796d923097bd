use ies::{
    AnalysisModule, ENKF_TRUNCATION_KEY, IES_INVERSION_KEY, IesError, Mask,
};
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn residuals(d_obs: &Array1<f64>, e: &Array2<f64>, y: &Array2<f64>) -> Array2<f64> {
    let mut d = e - y;
    for (mut row, &obs) in d.rows_mut().into_iter().zip(d_obs.iter()) {
        row += obs;
    }
    d
}

fn exact_module() -> AnalysisModule {
    let mut module = AnalysisModule::alloc();
    module.set_int(IES_INVERSION_KEY, 0).unwrap();
    module.set_double(ENKF_TRUNCATION_KEY, 1.0).unwrap();
    module
}

#[test]
fn dropped_realizations_cannot_return() {
    let mut module = AnalysisModule::alloc();
    let mut rng = StdRng::seed_from_u64(1);
    let y = array![[1.0, 1.0, 1.0]];
    let r = Array2::<f64>::eye(1);
    let d_obs = array![2.0];
    let e = array![[0.1, -0.1, 0.0]];
    let d = residuals(&d_obs, &e, &y);
    let obs_mask = Mask::new_active(1);

    module
        .init_update(
            &Mask::from([true, true, true]),
            &obs_mask,
            &y,
            &r,
            &d_obs,
            &e,
            &d,
            &mut rng,
        )
        .unwrap();
    module
        .init_update(
            &Mask::from([true, false, true]),
            &obs_mask,
            &y,
            &r,
            &d_obs,
            &e,
            &d,
            &mut rng,
        )
        .unwrap();
    let err = module
        .init_update(
            &Mask::from([true, true, true]),
            &obs_mask,
            &y,
            &r,
            &d_obs,
            &e,
            &d,
            &mut rng,
        )
        .unwrap_err();
    assert!(matches!(err, IesError::Mask(_)));
}

/// Two degenerate iterations with three realizations, then a third iteration
/// after dropping the middle one. The surviving coefficients must match a
/// parallel run that never had the middle realization at all, and the dropped
/// realization's row and column must be pinned to zero.
#[test]
fn shrunk_ensemble_matches_fresh_two_member_run() {
    let d_obs = array![2.0];
    let r = Array2::<f64>::eye(1);
    let obs_mask = Mask::new_active(1);

    // Full run: three realizations for two iterations, then two.
    let mut full = exact_module();
    let mut rng = StdRng::seed_from_u64(2);
    let mut a_full = array![[1.0, 2.0, 3.0]];
    let y3 = array![[1.0, 1.0, 1.0]];
    let e3 = array![[0.1, -0.1, 0.0]];
    let d3 = residuals(&d_obs, &e3, &y3);
    let mask3 = Mask::new_active(3);
    for _ in 0..2 {
        full.init_update(&mask3, &obs_mask, &y3, &r, &d_obs, &e3, &d3, &mut rng)
            .unwrap();
        full.update_a(&mut a_full, &y3, &r, &d_obs, &e3, &d3, &mut rng)
            .unwrap();
    }

    // Third iteration: realization 1 dropped, informative measurements.
    let y_shrunk = array![[1.0, 2.0]];
    let e_shrunk = array![[0.1, 0.0]];
    let d_shrunk = residuals(&d_obs, &e_shrunk, &y_shrunk);
    let mask_shrunk = Mask::from([true, false, true]);
    let mut a_shrunk = array![[a_full[[0, 0]], a_full[[0, 2]]]];
    full.init_update(
        &mask_shrunk,
        &obs_mask,
        &y_shrunk,
        &r,
        &d_obs,
        &e_shrunk,
        &d_shrunk,
        &mut rng,
    )
    .unwrap();
    full.update_a(
        &mut a_shrunk,
        &y_shrunk,
        &r,
        &d_obs,
        &e_shrunk,
        &d_shrunk,
        &mut rng,
    )
    .unwrap();

    // Parallel run: the same two realizations from the start.
    let mut fresh = exact_module();
    let mut rng = StdRng::seed_from_u64(3);
    let mut a_fresh = array![[1.0, 3.0]];
    let y2 = array![[1.0, 1.0]];
    let e2 = array![[0.1, 0.0]];
    let d2 = residuals(&d_obs, &e2, &y2);
    let mask2 = Mask::new_active(2);
    for _ in 0..2 {
        fresh
            .init_update(&mask2, &obs_mask, &y2, &r, &d_obs, &e2, &d2, &mut rng)
            .unwrap();
        fresh
            .update_a(&mut a_fresh, &y2, &r, &d_obs, &e2, &d2, &mut rng)
            .unwrap();
    }
    fresh
        .init_update(&mask2, &obs_mask, &y_shrunk, &r, &d_obs, &e_shrunk, &d_shrunk, &mut rng)
        .unwrap();
    fresh
        .update_a(
            &mut a_fresh,
            &y_shrunk,
            &r,
            &d_obs,
            &e_shrunk,
            &d_shrunk,
            &mut rng,
        )
        .unwrap();

    let w_full = full.data().w().expect("full-run coefficients");
    let w_fresh = fresh.data().w().expect("fresh-run coefficients");

    // Dropped realization: exact zeros.
    for k in 0..3 {
        assert_eq!(w_full[[1, k]], 0.0, "row 1 should be zeroed at {k}");
        assert_eq!(w_full[[k, 1]], 0.0, "column 1 should be zeroed at {k}");
    }

    // Surviving entries agree with the run that never saw realization 1.
    for (i_full, i_fresh) in [(0usize, 0usize), (2, 1)] {
        for (j_full, j_fresh) in [(0usize, 0usize), (2, 1)] {
            let diff = (w_full[[i_full, j_full]] - w_fresh[[i_fresh, j_fresh]]).abs();
            assert!(
                diff < 1e-12,
                "W[{i_full},{j_full}] differs from fresh W[{i_fresh},{j_fresh}] by {diff:e}"
            );
        }
    }

    for j in 0..2 {
        assert!(
            (a_shrunk[[0, j]] - a_fresh[[0, j]]).abs() < 1e-12,
            "updated ensembles diverge at column {j}"
        );
    }
}

/// An observation activated after the first iteration gets its perturbation
/// row appended, while the rows recorded earlier stay bit-identical.
#[test]
fn newly_active_observations_append_perturbation_rows() {
    let mut module = AnalysisModule::alloc();
    let mut rng = StdRng::seed_from_u64(4);
    let ens_mask = Mask::new_active(3);

    // Iteration 1: only the first observation is active.
    let y1 = array![[1.0, 2.0, 3.0]];
    let r1 = Array2::<f64>::eye(1);
    let d_obs1 = array![2.0];
    let e1 = array![[0.1, -0.1, 0.0]];
    let d1 = residuals(&d_obs1, &e1, &y1);
    let mut a = array![[1.0, 2.0, 3.0]];
    let a_initial = a.clone();

    module
        .init_update(
            &ens_mask,
            &Mask::from([true, false, false]),
            &y1,
            &r1,
            &d_obs1,
            &e1,
            &d1,
            &mut rng,
        )
        .unwrap();
    module
        .update_a(&mut a, &y1, &r1, &d_obs1, &e1, &d1, &mut rng)
        .unwrap();
    assert_eq!(module.data().e().unwrap().nrows(), 1);

    // Iteration 2: the second observation joins. Its perturbations are
    // recorded; the first observation's row is not rewritten even though the
    // driver supplies fresh values for it.
    let y2 = array![[1.0, 2.0, 3.0], [0.5, 1.0, 1.5]];
    let r2 = Array2::<f64>::eye(2);
    let d_obs2 = array![2.0, 1.0];
    let e2 = array![[9.0, 9.0, 9.0], [0.2, 0.0, -0.2]];
    let d2 = residuals(&d_obs2, &e2, &y2);

    module
        .init_update(
            &ens_mask,
            &Mask::from([true, true, false]),
            &y2,
            &r2,
            &d_obs2,
            &e2,
            &d2,
            &mut rng,
        )
        .unwrap();
    module
        .update_a(&mut a, &y2, &r2, &d_obs2, &e2, &d2, &mut rng)
        .unwrap();

    let e_state = module.data().e().unwrap();
    assert_eq!(e_state.nrows(), 2);
    assert_eq!(e_state.row(0).to_vec(), vec![0.1, -0.1, 0.0]);
    assert_eq!(e_state.row(1).to_vec(), vec![0.2, 0.0, -0.2]);

    // The initial parameter ensemble is preserved bit-for-bit even though
    // the working ensemble has moved.
    assert_eq!(module.data().a0().unwrap(), &a_initial);
    assert_ne!(&a, &a_initial);
}

/// The stored perturbation matrix never loses rows, whatever the
/// per-iteration observation mask does.
#[test]
fn perturbation_rows_grow_monotonically() {
    let mut module = AnalysisModule::alloc();
    let mut rng = StdRng::seed_from_u64(5);
    let ens_mask = Mask::new_active(2);
    let mut a = array![[0.5, 1.5]];

    let masks: [&[bool]; 4] = [
        &[true, false, false],
        &[true, true, false],
        &[false, true, false],
        &[true, true, true],
    ];
    let mut previous_rows = 0;
    for (step, bits) in masks.iter().enumerate() {
        let obs_mask = Mask::from_bits(bits);
        let m = obs_mask.active_count();
        let y = Array2::<f64>::from_shape_fn((m, 2), |(i, j)| (i + j) as f64 * 0.5 + 1.0);
        let r = Array2::<f64>::eye(m);
        let d_obs = Array1::<f64>::from_elem(m, 1.0);
        let e = Array2::<f64>::from_shape_fn((m, 2), |(i, j)| {
            0.05 * (step + i + 1) as f64 * if j == 0 { 1.0 } else { -1.0 }
        });
        let d = residuals(&d_obs, &e, &y);

        module
            .init_update(&ens_mask, &obs_mask, &y, &r, &d_obs, &e, &d, &mut rng)
            .unwrap();
        module
            .update_a(&mut a, &y, &r, &d_obs, &e, &d, &mut rng)
            .unwrap();

        let rows = module.data().e().unwrap().nrows();
        assert!(rows >= previous_rows, "perturbation rows shrank at step {step}");
        assert!(rows >= m);
        previous_rows = rows;
    }
    // All three observations have been seen by the end.
    assert_eq!(previous_rows, 3);
}
