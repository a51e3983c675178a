mod common;

use common::{ChannelProjector, Counted, CountingExact, diagonal_bands};
use cylps::{
    DirectTraceFisher, EstimatorConfig, ExactFisher, FisherEstimator, FisherMethod,
    MonteCarloFisher, SkyModel, SyntheticTelescope, SyntheticTelescopeConfig, TransferArray, c64,
    fisher_from_cache,
};
use ndarray::Array2;

fn small_telescope() -> SyntheticTelescope {
    SyntheticTelescope::new(SyntheticTelescopeConfig {
        nfreq: 3,
        lmax: 4,
        mmax: 2,
        modes_per_order: 6,
        band_edges: vec![0.0, 2.0, 3.0, 5.0],
        ..Default::default()
    })
    .expect("synthetic telescope")
}

fn assert_hermitian(fab: &Array2<c64>) {
    let n = fab.nrows();
    for a in 0..n {
        assert_eq!(fab[[a, a]].im, 0.0, "diagonal {a} is not real");
        for b in 0..n {
            assert_eq!(fab[[a, b]], fab[[b, a]].conj(), "entry ({a}, {b})");
        }
    }
}

#[test]
fn monte_carlo_total_is_hermitian_in_both_accumulation_paths() {
    let telescope = small_telescope();
    // Six modes per order: eight samples accumulate in mode space, four in sample space.
    for nsamples in [8, 4] {
        let config = EstimatorConfig {
            nsamples,
            nswitch: 0,
            seed: 17,
            ..Default::default()
        };
        let monte_carlo =
            MonteCarloFisher::from_sky_model(&telescope, &telescope, config).expect("estimator");
        let exact = DirectTraceFisher::from_sky_model(&telescope, &telescope, 0.0).expect("exact");
        let estimator = FisherEstimator::new(monte_carlo, exact);

        for order in telescope.orders() {
            assert_eq!(
                estimator.method_for(order).expect("method"),
                FisherMethod::MonteCarlo
            );
            assert_hermitian(&estimator.fisher_m(order).expect("fisher_m"));
        }
        let total = estimator
            .fisher_total(&telescope.orders())
            .expect("fisher_total");
        assert_eq!(total.dim(), (3, 3));
        assert_hermitian(&total);
    }
}

#[test]
fn orders_without_modes_skip_sampling() {
    let telescope = Counted::new(small_telescope());
    let config = EstimatorConfig {
        nsamples: 10,
        nswitch: 0,
        threshold: telescope.inner.config().eigenvalue_scale * 2.0,
        ..Default::default()
    };
    let monte_carlo =
        MonteCarloFisher::from_sky_model(&telescope, &telescope.inner, config).expect("estimator");

    for order in [0, 1, 7] {
        let fab = monte_carlo.fisher_m_mc(order).expect("fisher_m_mc");
        assert_eq!(fab.dim(), (3, 3));
        assert!(fab.iter().all(|z| *z == c64::new(0.0, 0.0)));
    }
    assert_eq!(telescope.projections(), 0);
}

#[test]
fn dispatch_switches_exactly_at_nswitch() {
    let telescope = small_telescope();
    let nevals = 6;
    let direct = DirectTraceFisher::from_sky_model(&telescope, &telescope, 0.0).expect("exact");
    let reference = direct.fisher_m(0).expect("direct");

    for (nswitch, expected) in [
        (nevals + 1, FisherMethod::Exact),
        (nevals, FisherMethod::MonteCarlo),
        (nevals - 1, FisherMethod::MonteCarlo),
    ] {
        let config = EstimatorConfig {
            nsamples: 12,
            nswitch,
            ..Default::default()
        };
        let monte_carlo =
            MonteCarloFisher::from_sky_model(&telescope, &telescope, config).expect("estimator");
        let exact = CountingExact::new(&direct);
        let estimator = FisherEstimator::new(monte_carlo, &exact);

        assert_eq!(estimator.method_for(0).expect("method"), expected);
        let fab = estimator.fisher_m(0).expect("fisher_m");
        match expected {
            FisherMethod::Exact => {
                assert_eq!(exact.calls(), 1);
                assert_eq!(fab, reference);
            }
            FisherMethod::MonteCarlo => {
                assert_eq!(exact.calls(), 0);
                assert_ne!(fab, reference);
            }
        }
    }
}

#[test]
fn diagonal_correction_removes_self_pair_bias() {
    let nev = 10;
    let nsamples = 20;
    let projector = ChannelProjector::new(vec![0.0; nev], nev, 1);
    let transfers =
        TransferArray::from_bands(&diagonal_bands(&[vec![1.0; nev]])).expect("transfers");

    let trials = 200;
    let mut corrected = 0.0;
    let mut uncorrected = 0.0;
    for seed in 0..trials {
        let config = EstimatorConfig {
            nsamples,
            seed,
            ..Default::default()
        };
        let monte_carlo =
            MonteCarloFisher::new(&projector, transfers.clone(), config).expect("estimator");
        let cache = monte_carlo.gen_vecs(0).expect("samples");
        corrected += fisher_from_cache(&cache)[[0, 0]].re;

        let vecs = cache.band(0).expect("band 0");
        let overlaps = vecs.dot(&vecs.t().mapv(|z| z.conj()));
        uncorrected += overlaps.iter().map(|z| z.norm_sqr()).sum::<f64>()
            / (nsamples * nsamples) as f64;
    }
    let corrected = corrected / trials as f64;
    let uncorrected = uncorrected / trials as f64;

    // Tr(I_10 I_10) = 10; the naive estimator converges to 10 + 100 / nsamples = 15.
    assert!(
        (corrected - 10.0).abs() < 1.0,
        "corrected mean {corrected:.3}"
    );
    assert!(uncorrected > 13.5, "uncorrected mean {uncorrected:.3}");
    assert!((corrected - 10.0).abs() < (uncorrected - 10.0).abs());
}

#[test]
fn diagonal_converges_for_many_samples() {
    let nev = 10;
    let projector = ChannelProjector::new(vec![0.0; nev], nev, 1);
    let transfers =
        TransferArray::from_bands(&diagonal_bands(&[vec![1.0; nev]])).expect("transfers");
    let config = EstimatorConfig {
        nsamples: 4000,
        seed: 99,
        ..Default::default()
    };
    let monte_carlo = MonteCarloFisher::new(&projector, transfers, config).expect("estimator");
    let fab = monte_carlo.fisher_m_mc(3).expect("fisher_m_mc");
    let relative = (fab[[0, 0]].re - 10.0).abs() / 10.0;
    assert!(relative < 0.05, "relative error {relative:.4}");
}

#[test]
fn monte_carlo_agrees_with_direct_trace() {
    let projector = ChannelProjector::new(vec![1.0, 2.0, 3.0], 3, 1);
    let bands = diagonal_bands(&[vec![1.0, 2.0, 0.5], vec![0.5, 1.0, 2.0]]);

    let direct = DirectTraceFisher::new(&projector, bands.clone(), 0.0).expect("exact");
    let expected = direct.fisher_m(0).expect("direct");

    let config = EstimatorConfig {
        nsamples: 5000,
        seed: 4242,
        ..Default::default()
    };
    let transfers = TransferArray::from_bands(&bands).expect("transfers");
    let monte_carlo = MonteCarloFisher::new(&projector, transfers, config).expect("estimator");
    let estimate = monte_carlo.fisher_m_mc(0).expect("fisher_m_mc");

    // Whitened covariances are diag(c / (1 + lambda)), so F_ab = sum_k c_ak c_bk / (1 + lambda_k)^2.
    let analytic = [
        [0.25 + 4.0 / 9.0 + 0.25 / 16.0, 0.125 + 2.0 / 9.0 + 1.0 / 16.0],
        [0.125 + 2.0 / 9.0 + 1.0 / 16.0, 0.0625 + 1.0 / 9.0 + 4.0 / 16.0],
    ];
    for a in 0..2 {
        for b in 0..2 {
            let exact = expected[[a, b]].re;
            assert!((exact - analytic[a][b]).abs() < 1e-12);
            let relative = (estimate[[a, b]].re - exact).abs() / exact;
            assert!(relative < 0.1, "F[{a},{b}]: relative error {relative:.4}");
        }
    }
}

#[test]
fn synthetic_totals_agree_between_methods() {
    let telescope = small_telescope();
    let orders = telescope.orders();
    let exact = DirectTraceFisher::from_sky_model(&telescope, &telescope, 0.0).expect("exact");

    let total_with = |method: FisherMethod| {
        let config = EstimatorConfig {
            nsamples: 4000,
            seed: 5,
            ..Default::default()
        };
        let monte_carlo =
            MonteCarloFisher::from_sky_model(&telescope, &telescope, config).expect("estimator");
        FisherEstimator::new(monte_carlo, &exact)
            .with_forced_method(Some(method))
            .fisher_total(&orders)
            .expect("fisher_total")
    };
    let direct = total_with(FisherMethod::Exact);
    let sampled = total_with(FisherMethod::MonteCarlo);

    for a in 0..3 {
        assert!(direct[[a, a]].re > 0.0);
        let relative = (sampled[[a, a]].re - direct[[a, a]].re).abs() / direct[[a, a]].re;
        assert!(relative < 0.1, "band {a}: relative error {relative:.4}");
    }
}

#[test]
fn shared_band_covariances_match_per_estimator_generation() {
    let telescope = small_telescope();
    let config = EstimatorConfig {
        nsamples: 16,
        nswitch: 5,
        seed: 23,
        ..Default::default()
    };

    for method in [FisherMethod::Exact, FisherMethod::MonteCarlo] {
        let clarray = telescope.generate_bands().expect("bands");
        let transfers = TransferArray::from_bands(&clarray).expect("transfers");
        let shared = FisherEstimator::new(
            MonteCarloFisher::new(&telescope, transfers, config.clone()).expect("estimator"),
            DirectTraceFisher::new(&telescope, clarray, config.threshold).expect("exact"),
        )
        .with_forced_method(Some(method));
        let separate = FisherEstimator::new(
            MonteCarloFisher::from_sky_model(&telescope, &telescope, config.clone())
                .expect("estimator"),
            DirectTraceFisher::from_sky_model(&telescope, &telescope, config.threshold)
                .expect("exact"),
        )
        .with_forced_method(Some(method));

        assert_eq!(shared.nbands(), 3);
        for order in telescope.orders() {
            let lhs = shared.fisher_m(order).expect("shared");
            let rhs = separate.fisher_m(order).expect("separate");
            let scale = rhs.iter().map(|z| z.norm()).fold(1.0, f64::max);
            for (x, y) in lhs.iter().zip(rhs.iter()) {
                assert!(
                    (x - y).norm() <= 1e-12 * scale,
                    "{method:?} at m={order}: {x} vs {y}"
                );
            }
        }
    }
}
