//! Distance, travel-time, and residual math for TDOA localization
//!
//! All positions are cartesian coordinates in meters, either [x,y] or
//! [x,y,z]. Every function that depends on the speed of sound takes it as an
//! explicit parameter; [`DEFAULT_SPEED_OF_SOUND`] is the conventional value
//! for air at ~20 °C.

use snafu::{ensure, Snafu};

/// Default speed of sound in air, meters per second
pub const DEFAULT_SPEED_OF_SOUND: f64 = 343.0;

/// Errors for vectors whose lengths don't fit the requested operation
#[derive(Debug, Snafu)]
pub enum DimensionError {
    /// Lorentz inner product is only defined here for 3- and 4-vectors
    #[snafu(display("Lorentz inner product requires 3- or 4-vectors, got lengths {left} and {right}"))]
    LorentzLength { left: usize, right: usize },

    /// Two vectors that must share a dimension don't
    #[snafu(display("mismatched vector lengths: {left} vs {right}"))]
    Mismatch { left: usize, right: usize },
}

/// Speed of sound in air for a given temperature in Celsius, in m/s
///
/// Humidity has a negligible effect and is not modeled.
pub fn speed_of_sound(temperature_c: f64) -> f64 {
    331.3 * (1.0 + temperature_c / 273.15).sqrt()
}

/// Euclidean distance between two points of the same dimensionality
pub fn distance(a: &[f64], b: &[f64]) -> Result<f64, DimensionError> {
    ensure!(
        a.len() == b.len(),
        MismatchSnafu {
            left: a.len(),
            right: b.len()
        }
    );
    let sum_sq: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    Ok(sum_sq.sqrt())
}

/// Time in seconds for sound to travel from `source` to `receiver`
pub fn travel_time(source: &[f64], receiver: &[f64], speed_of_sound: f64) -> Result<f64, DimensionError> {
    Ok(distance(source, receiver)? / speed_of_sound)
}

/// Lorentz inner product of two 3- or 4-vectors
///
/// For 3-vectors: `u0*v0 + u1*v1 - u2*v2`. For 4-vectors:
/// `u0*v0 + u1*v1 + u2*v2 - u3*v3`. Any other length is a
/// [`DimensionError`].
pub fn lorentz_ip(u: &[f64], v: &[f64]) -> Result<f64, DimensionError> {
    ensure!(
        u.len() == v.len() && (u.len() == 3 || u.len() == 4),
        LorentzLengthSnafu {
            left: u.len(),
            right: v.len()
        }
    );
    let positive: f64 = u[..u.len() - 1]
        .iter()
        .zip(v)
        .map(|(x, y)| x * y)
        .sum();
    Ok(positive - u[u.len() - 1] * v[v.len() - 1])
}

/// Lorentz inner product of a vector with itself
pub fn lorentz_norm(u: &[f64]) -> Result<f64, DimensionError> {
    lorentz_ip(u, u)
}

/// Distance residuals between observed tdoas and a position estimate
///
/// For each receiver, the expected relative delay is the difference in
/// travel time from the estimate to that receiver vs the reference
/// (receiver 0). The residual is `(expected - observed) * speed_of_sound`,
/// in meters. `residuals[0]` is 0 by construction.
pub fn tdoa_residuals(
    receiver_positions: &[Vec<f64>],
    tdoas: &[f64],
    position_estimate: &[f64],
    speed_of_sound: f64,
) -> Result<Vec<f64>, DimensionError> {
    ensure!(
        receiver_positions.len() == tdoas.len(),
        MismatchSnafu {
            left: receiver_positions.len(),
            right: tdoas.len()
        }
    );

    let travel_times = receiver_positions
        .iter()
        .map(|r| travel_time(position_estimate, r, speed_of_sound))
        .collect::<Result<Vec<f64>, _>>()?;

    let reference = travel_times[0];
    Ok(travel_times
        .iter()
        .zip(tdoas)
        .map(|(t, observed)| ((t - reference) - observed) * speed_of_sound)
        .collect())
}

/// Root mean square of a residual vector, in the residuals' units
pub fn residual_rms(residuals: &[f64]) -> f64 {
    let mean_sq: f64 = residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64;
    mean_sq.sqrt()
}
