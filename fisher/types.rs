//! Shared types and the collaborator seams of the estimator.
//!
//! The telescope, its beam transfer matrices and the KL eigensystem live outside this crate.
//! They are consumed through the three traits below so that the Monte-Carlo engine can be
//! driven by a production eigensystem or by the in-memory [`crate::synthetic`] model alike.

use ndarray::{Array1, Array2, Array3, ArrayView2};
use thiserror::Error;

pub use ndarray_linalg::c64;

/// Errors raised while building transfer matrices, drawing samples or accumulating Fisher
/// matrices.
#[derive(Error, Debug)]
pub enum FisherError {
    #[error("Invalid estimator configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Covariance block at l={ell} is not positive semi-definite (smallest eigenvalue {min_eigenvalue:.6e}, largest {max_eigenvalue:.6e})."
    )]
    NotPositiveSemidefinite {
        ell: usize,
        min_eigenvalue: f64,
        max_eigenvalue: f64,
    },

    #[error("Eigendecomposition failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Transfer matrix generation failed for band {band}: {source}")]
    Transfer {
        band: usize,
        #[source]
        source: Box<FisherError>,
    },

    #[error("Fisher estimation failed for m={order}, band {band}: {source}")]
    Band {
        order: i32,
        band: usize,
        #[source]
        source: Box<FisherError>,
    },
}

impl FisherError {
    /// Attaches the azimuthal order and band at which a failure occurred.
    pub fn in_band(self, order: i32, band: usize) -> Self {
        match self {
            already @ FisherError::Band { .. } => already,
            other => FisherError::Band {
                order,
                band,
                source: Box::new(other),
            },
        }
    }
}

/// KL eigenmodes of one azimuthal order above a significance threshold.
#[derive(Debug, Clone)]
pub struct KlModes {
    /// Signal-to-noise eigenvalues, one per retained mode.
    pub evals: Array1<f64>,
    /// Eigenvectors as rows, `[n_modes, n_visibility_modes]`.
    pub evecs: Array2<c64>,
}

impl KlModes {
    pub fn empty(width: usize) -> Self {
        Self {
            evals: Array1::zeros(0),
            evecs: Array2::zeros((0, width)),
        }
    }

    pub fn len(&self) -> usize {
        self.evals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evals.is_empty()
    }
}

/// Source of the per-band angular covariance `C_l(nu, nu')`.
pub trait SkyModel {
    /// Band edges in the power-spectrum parameter; `nbands = band_edges().len() - 1`.
    fn band_edges(&self) -> &[f64];

    /// One `[n_ell, n_freq, n_freq]` covariance tensor per band.
    fn generate_bands(&self) -> Result<Vec<Array3<c64>>, FisherError>;
}

/// The KL transform of a telescope, seen from the estimator.
pub trait KlProjector: Sync {
    fn modes_m(&self, order: i32, threshold: f64) -> Result<KlModes, FisherError>;

    fn num_evals(&self, order: i32, threshold: f64) -> Result<usize, FisherError> {
        Ok(self.modes_m(order, threshold)?.len())
    }

    /// Projects a `[n_freq, n_ell]` sky vector into the eigenmodes of `order`.
    ///
    /// Rows with `l < |m|` are ignored by the projection.
    fn project_sky_vector_forward(
        &self,
        order: i32,
        sky: ArrayView2<'_, c64>,
        threshold: f64,
    ) -> Result<Array1<c64>, FisherError>;
}

/// An exact (non-sampled) Fisher matrix for one azimuthal order.
pub trait ExactFisher: Sync {
    fn fisher_m(&self, order: i32) -> Result<Array2<c64>, FisherError>;
}

impl<T: ExactFisher + ?Sized> ExactFisher for &T {
    fn fisher_m(&self, order: i32) -> Result<Array2<c64>, FisherError> {
        (**self).fisher_m(order)
    }
}

/// Conjugate transpose of a complex matrix.
pub(crate) fn conj_t(matrix: &Array2<c64>) -> Array2<c64> {
    matrix.t().mapv(|z| z.conj())
}
