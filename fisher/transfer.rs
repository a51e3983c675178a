//! Square roots of the per-multipole frequency covariance blocks.
//!
//! A transfer matrix `R_l` satisfies `R_l R_l^H = C_l`, so that `R_l n` with unit complex white
//! noise `n` has exactly the covariance of the sky at that multipole. We use the Hermitian
//! root `U sqrt(Lambda) U^H`, which also gives `R_l^H R_l = C_l` and maps every null direction
//! of `C_l` to zero.

use crate::types::{FisherError, c64, conj_t};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use ndarray_linalg::{Eigh, UPLO};
use rayon::prelude::*;

/// Eigenvalues below this fraction of the largest one are treated as exactly null.
pub const NULL_EIGENVALUE_RATIO: f64 = 1.0e-16;

/// Negative eigenvalues larger in magnitude than this fraction of the spectral radius mean the
/// block is not a covariance.
pub const NEGATIVE_EIGENVALUE_TOLERANCE: f64 = 1.0e-10;

/// Hermitian square root of a positive semi-definite matrix, keeping every direction.
pub fn hermitian_root(matrix: ArrayView2<'_, c64>) -> Result<Array2<c64>, FisherError> {
    root_of_block(matrix, 0)
}

fn root_of_block(block: ArrayView2<'_, c64>, ell: usize) -> Result<Array2<c64>, FisherError> {
    let (rows, cols) = block.dim();
    if rows != cols {
        return Err(FisherError::ShapeMismatch(format!(
            "covariance block at l={ell} is {rows}x{cols}, expected a square matrix"
        )));
    }
    if rows == 0 {
        return Ok(Array2::zeros((0, 0)));
    }

    let (evals, evecs) = block.eigh(UPLO::Lower)?;

    let max_eval = evals.iter().fold(0.0_f64, |acc, &v| acc.max(v));
    let min_eval = evals.iter().fold(f64::INFINITY, |acc, &v| acc.min(v));
    let spectral_radius = evals.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()));
    if min_eval < -NEGATIVE_EIGENVALUE_TOLERANCE * spectral_radius {
        return Err(FisherError::NotPositiveSemidefinite {
            ell,
            min_eigenvalue: min_eval,
            max_eigenvalue: max_eval,
        });
    }

    let cutoff = max_eval * NULL_EIGENVALUE_RATIO;
    let root_evals = evals.mapv(|v| {
        if v > cutoff {
            c64::new(v.sqrt(), 0.0)
        } else {
            c64::new(0.0, 0.0)
        }
    });

    let scaled = &evecs * &root_evals.insert_axis(Axis(0));
    Ok(scaled.dot(&conj_t(&evecs)))
}

/// Replaces every `l` slice of a `[n_ell, n_freq, n_freq]` covariance by its square root.
pub fn block_root(clzz: ArrayView3<'_, c64>) -> Result<Array3<c64>, FisherError> {
    let (nell, nfreq, nfreq_other) = clzz.dim();
    if nfreq != nfreq_other {
        return Err(FisherError::ShapeMismatch(format!(
            "covariance tensor has frequency axes {nfreq} and {nfreq_other}"
        )));
    }

    let mut trans = Array3::zeros((nell, nfreq, nfreq));
    for (ell, (block, mut out)) in clzz
        .outer_iter()
        .zip(trans.outer_iter_mut())
        .enumerate()
    {
        out.assign(&root_of_block(block, ell)?);
    }
    Ok(trans)
}

/// The per-band transfer matrices, generated once and then only read.
#[derive(Debug, Clone)]
pub struct TransferArray {
    bands: Vec<Array3<c64>>,
}

impl TransferArray {
    pub fn from_bands(clarray: &[Array3<c64>]) -> Result<Self, FisherError> {
        log::info!("Generating transforms for {} bands...", clarray.len());

        if let Some(first) = clarray.first() {
            let shape = first.dim();
            if let Some((band, other)) = clarray
                .iter()
                .enumerate()
                .find(|(_, clzz)| clzz.dim() != shape)
            {
                return Err(FisherError::ShapeMismatch(format!(
                    "band {band} covariance has shape {:?}, band 0 has {shape:?}",
                    other.dim()
                )));
            }
        }

        let bands = clarray
            .par_iter()
            .enumerate()
            .map(|(band, clzz)| {
                block_root(clzz.view()).map_err(|source| FisherError::Transfer {
                    band,
                    source: Box::new(source),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { bands })
    }

    pub fn nbands(&self) -> usize {
        self.bands.len()
    }

    /// The `[nell, nfreq, nfreq]` transfer blocks of one band, if it exists.
    pub fn band(&self, index: usize) -> Option<&Array3<c64>> {
        self.bands.get(index)
    }
}
