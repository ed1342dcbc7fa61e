//! Closed-form multilateration solvers
//!
//! Two interchangeable algorithms map (receiver positions, relative time
//! delays) to an estimated source position:
//!
//! - [`Algorithm::Gillette`]: the linear closed form of Gillette and
//!   Silverman (2008), solved by least squares. Requires one delay to be
//!   zero (the reference receiver).
//! - [`Algorithm::SoundFinder`]: the GPS pseudorange formulation used by
//!   Sound Finder (Wilson et al. 2014), a quadratic closed form.
//!
//! Localization is 2-d or 3-d according to the shape of the receiver
//! positions. Delays are in seconds, positions and results in meters.

use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use snafu::{ensure, ResultExt, Snafu};
use tracing::warn;

use crate::geometry::{self, DimensionError};

/// Delays this close to zero (seconds) identify the reference receiver
const REFERENCE_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Snafu)]
pub enum SolverError {
    #[snafu(display(
        "unsupported localization algorithm '{name}' (expected 'gillette' or 'soundfinder')"
    ))]
    UnsupportedAlgorithm { name: String },

    #[snafu(display(
        "arrival times must be relative to a reference receiver with tdoa 0; \
         smallest |tdoa| was {min_abs}"
    ))]
    ReferenceRequired { min_abs: f64 },

    #[snafu(display("localization requires 2- or 3-dimensional positions, got {dim}"))]
    BadDimension { dim: usize },

    #[snafu(display("receiver positions have mixed dimensionality ({first} vs {other})"))]
    MixedDimensions { first: usize, other: usize },

    #[snafu(display("got {positions} receiver positions but {tdoas} tdoas"))]
    LengthMismatch { positions: usize, tdoas: usize },

    #[snafu(display("least-squares solve failed: {message}"))]
    SolveFailed { message: String },

    #[snafu(display("{source}"))]
    Geometry { source: DimensionError },
}

/// The closed set of localization algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Gillette,
    SoundFinder,
}

impl FromStr for Algorithm {
    type Err = SolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gillette" => Ok(Algorithm::Gillette),
            "soundfinder" => Ok(Algorithm::SoundFinder),
            other => UnsupportedAlgorithmSnafu { name: other }.fail(),
        }
    }
}

/// Estimate a source position from receiver positions and relative delays
pub fn localize(
    receiver_positions: &[Vec<f64>],
    tdoas: &[f64],
    algorithm: Algorithm,
    speed_of_sound: f64,
) -> Result<Vec<f64>, SolverError> {
    match algorithm {
        Algorithm::Gillette => gillette_localize(receiver_positions, tdoas, speed_of_sound),
        Algorithm::SoundFinder => {
            soundfinder_localize(receiver_positions, tdoas, speed_of_sound, true, true)
        }
    }
}

/// Validate shapes and return the shared dimensionality (2 or 3)
fn validate(receiver_positions: &[Vec<f64>], tdoas: &[f64]) -> Result<usize, SolverError> {
    ensure!(
        receiver_positions.len() == tdoas.len(),
        LengthMismatchSnafu {
            positions: receiver_positions.len(),
            tdoas: tdoas.len()
        }
    );
    let dim = receiver_positions.first().map_or(0, |p| p.len());
    ensure!(dim == 2 || dim == 3, BadDimensionSnafu { dim });
    for position in receiver_positions {
        ensure!(
            position.len() == dim,
            MixedDimensionsSnafu {
                first: dim,
                other: position.len()
            }
        );
    }
    Ok(dim)
}

/// Gillette–Silverman linear closed-form localization
///
/// Builds the linear system `A·x = w` with one row per non-reference
/// receiver and solves it by SVD least squares, which also covers the
/// over-determined case. A rank-deficient system silently yields the
/// minimum-norm solution rather than an error.
pub fn gillette_localize(
    receiver_positions: &[Vec<f64>],
    tdoas: &[f64],
    speed_of_sound: f64,
) -> Result<Vec<f64>, SolverError> {
    let dim = validate(receiver_positions, tdoas)?;
    let n = receiver_positions.len();

    // delays must be relative to one of the receivers
    let (reference, min_abs) = tdoas
        .iter()
        .map(|t| t.abs())
        .enumerate()
        .fold((0, f64::INFINITY), |(bi, bv), (i, v)| {
            if v < bv {
                (i, v)
            } else {
                (bi, bv)
            }
        });
    ensure!(min_abs <= REFERENCE_TOLERANCE, ReferenceRequiredSnafu { min_abs });

    // roll so the reference receiver is first
    let ordered: Vec<usize> = (0..n).map(|i| (i + reference) % n).collect();
    let position_0 = &receiver_positions[ordered[0]];
    let norm_sq_0: f64 = position_0.iter().map(|x| x * x).sum();

    let mut a = DMatrix::<f64>::zeros(n - 1, dim + 1);
    let mut w = DVector::<f64>::zeros(n - 1);
    for (row, &idx) in ordered[1..].iter().enumerate() {
        let position_m = &receiver_positions[idx];
        let range_diff = tdoas[idx] * speed_of_sound;
        for d in 0..dim {
            a[(row, d)] = position_0[d] - position_m[d];
        }
        a[(row, dim)] = range_diff;
        let norm_sq_m: f64 = position_m.iter().map(|x| x * x).sum();
        w[row] = 0.5 * (range_diff * range_diff + norm_sq_0 - norm_sq_m);
    }

    let solution = a
        .svd(true, true)
        .solve(&w, 1e-12)
        .map_err(|message| SolverError::SolveFailed {
            message: message.to_string(),
        })?;

    // the last component is the pseudorange; only the position is returned
    Ok((0..dim).map(|d| solution[d]).collect())
}

/// Sound Finder GPS-pseudorange localization
///
/// `center` recenters the receivers at their centroid before solving
/// (numerical conditioning; the shift is re-added to the answer). `pseudo`
/// selects between the two quadratic roots by the smaller pseudorange-error
/// magnitude; `false` uses the original Sound Finder sum-of-squares
/// discrepancy, which performs worse in practice.
///
/// Degenerate receiver configurations (colinear or coplanar) make the
/// normal matrix singular; the solver then warns and returns a NaN-filled
/// position instead of failing, so callers must check `is_nan()` before
/// trusting the estimate. A negative discriminant is clamped to zero with a
/// warning, yielding an inaccurate-but-present answer.
pub fn soundfinder_localize(
    receiver_positions: &[Vec<f64>],
    tdoas: &[f64],
    speed_of_sound: f64,
    center: bool,
    pseudo: bool,
) -> Result<Vec<f64>, SolverError> {
    let dim = validate(receiver_positions, tdoas)?;
    let n = receiver_positions.len();

    let mut positions: Vec<Vec<f64>> = receiver_positions.to_vec();
    let mut centroid = vec![0.0; dim];
    if center {
        for position in &positions {
            for d in 0..dim {
                centroid[d] += position[d] / n as f64;
            }
        }
        for position in positions.iter_mut() {
            for d in 0..dim {
                position[d] -= centroid[d];
            }
        }
    }

    // B: position coordinates with the pseudorange column appended
    let mut b = DMatrix::<f64>::zeros(n, dim + 1);
    for (i, position) in positions.iter().enumerate() {
        for d in 0..dim {
            b[(i, d)] = position[d];
        }
        b[(i, dim)] = -tdoas[i] * speed_of_sound;
    }

    // a: half the squared Lorentz norm of each row; e: ones
    let mut a = DVector::<f64>::zeros(n);
    for i in 0..n {
        let row: Vec<f64> = (0..=dim).map(|j| b[(i, j)]).collect();
        a[i] = 0.5 * geometry::lorentz_norm(&row).context(GeometrySnafu)?;
    }
    let e = DVector::<f64>::from_element(n, 1.0);

    // B+ = (BᵀB)⁻¹Bᵀ
    let bt = b.transpose();
    let Some(inverted) = (&bt * &b).try_inverse() else {
        warn!("singular matrix; were receivers colinear or coplanar? returning NaN position");
        return Ok(vec![f64::NAN; dim]);
    };
    let bplus = inverted * bt;
    let bplus_a = &bplus * &a;
    let bplus_e = &bplus * &e;

    // quadratic in lambda
    let ca = geometry::lorentz_norm(bplus_e.as_slice()).context(GeometrySnafu)?;
    let cb =
        2.0 * (geometry::lorentz_ip(bplus_e.as_slice(), bplus_a.as_slice()).context(GeometrySnafu)? - 1.0);
    let cc = geometry::lorentz_norm(bplus_a.as_slice()).context(GeometrySnafu)?;

    let mut discriminant = cb * cb - 4.0 * ca * cc;
    if discriminant < 0.0 {
        warn!(
            discriminant,
            "negative discriminant clamped to zero; solution may be inaccurate"
        );
        discriminant = 0.0;
    }

    let lambdas = [
        (-cb - discriminant.sqrt()) / (2.0 * ca),
        (-cb + discriminant.sqrt()) / (2.0 * ca),
    ];
    let mut u0 = &bplus * &(&a + &e * lambdas[0]);
    let mut u1 = &bplus * &(&a + &e * lambdas[1]);

    if center {
        for d in 0..dim {
            u0[d] += centroid[d];
            u1[d] += centroid[d];
        }
    }

    let chosen = if pseudo {
        // prefer the root with the smaller pseudorange-error component
        if u0[dim].abs() <= u1[dim].abs() {
            u0
        } else {
            u1
        }
    } else {
        // original Sound Finder: smaller sum-of-squares discrepancy
        let s0 = (&b * &u0 - (&a + &e * lambdas[0])).norm_squared();
        let s1 = (&b * &u1 - (&a + &e * lambdas[1])).norm_squared();
        if s0 < s1 {
            u0
        } else {
            u1
        }
    };

    Ok((0..dim).map(|d| chosen[d]).collect())
}
