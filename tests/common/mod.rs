use cylps::{ExactFisher, FisherError, KlModes, KlProjector, c64};
use ndarray::{Array1, Array2, Array3, ArrayView2};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Eigenmode `k` reads frequency channel `k` at `l = 0`, identically for every order up to
/// `mmax`.
pub struct ChannelProjector {
    pub evals: Vec<f64>,
    pub nfreq: usize,
    pub nell: usize,
    pub mmax: i32,
}

impl ChannelProjector {
    pub fn new(evals: Vec<f64>, nfreq: usize, nell: usize) -> Self {
        assert!(evals.len() <= nfreq);
        Self {
            evals,
            nfreq,
            nell,
            mmax: i32::MAX,
        }
    }

    fn kept(&self, order: i32, threshold: f64) -> usize {
        if order.abs() > self.mmax {
            return 0;
        }
        self.evals.iter().take_while(|&&v| v >= threshold).count()
    }
}

impl KlProjector for ChannelProjector {
    fn modes_m(&self, order: i32, threshold: f64) -> Result<KlModes, FisherError> {
        let n = self.kept(order, threshold);
        let mut evecs = Array2::zeros((n, self.nfreq * self.nell));
        for k in 0..n {
            evecs[[k, k * self.nell]] = c64::new(1.0, 0.0);
        }
        Ok(KlModes {
            evals: Array1::from(self.evals[..n].to_vec()),
            evecs,
        })
    }

    fn project_sky_vector_forward(
        &self,
        order: i32,
        sky: ArrayView2<'_, c64>,
        threshold: f64,
    ) -> Result<Array1<c64>, FisherError> {
        let n = self.kept(order, threshold);
        Ok(sky.column(0).iter().take(n).copied().collect())
    }
}

/// Counts forward projections made through the wrapped projector.
pub struct Counted<P> {
    pub inner: P,
    pub projections: AtomicUsize,
}

impl<P> Counted<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            projections: AtomicUsize::new(0),
        }
    }

    pub fn projections(&self) -> usize {
        self.projections.load(Ordering::SeqCst)
    }
}

impl<P: KlProjector> KlProjector for Counted<P> {
    fn modes_m(&self, order: i32, threshold: f64) -> Result<KlModes, FisherError> {
        self.inner.modes_m(order, threshold)
    }

    fn num_evals(&self, order: i32, threshold: f64) -> Result<usize, FisherError> {
        self.inner.num_evals(order, threshold)
    }

    fn project_sky_vector_forward(
        &self,
        order: i32,
        sky: ArrayView2<'_, c64>,
        threshold: f64,
    ) -> Result<Array1<c64>, FisherError> {
        self.projections.fetch_add(1, Ordering::SeqCst);
        self.inner.project_sky_vector_forward(order, sky, threshold)
    }
}

/// Counts calls into the wrapped exact estimator.
pub struct CountingExact<E> {
    pub inner: E,
    pub calls: AtomicUsize,
}

impl<E> CountingExact<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<E: ExactFisher> ExactFisher for CountingExact<E> {
    fn fisher_m(&self, order: i32) -> Result<Array2<c64>, FisherError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fisher_m(order)
    }
}

/// Single-multipole band covariances with the given frequency diagonals.
pub fn diagonal_bands(diagonals: &[Vec<f64>]) -> Vec<Array3<c64>> {
    diagonals
        .iter()
        .map(|diag| {
            let mut clzz = Array3::zeros((1, diag.len(), diag.len()));
            for (f, &power) in diag.iter().enumerate() {
                clzz[[0, f, f]] = c64::new(power, 0.0);
            }
            clzz
        })
        .collect()
}
