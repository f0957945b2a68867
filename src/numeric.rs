//! Small numeric helpers for the calibration loops.
//!
//! Least-squares parabola fitting, sample statistics and scan grids. The fit
//! solves the 3x3 normal equations with Cramer's rule; abscissae are shifted
//! to their mean first so setpoints of several thousand degrees do not lose
//! precision in the fourth-power sums.

use serde::{Deserialize, Serialize};

/// Determinant below which the normal equations are treated as singular.
const SINGULAR_EPS: f64 = 1e-12;

/// Fitted parabola `y = a*x^2 + b*x + c`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parabola {
    /// Quadratic coefficient (curvature)
    pub a: f64,
    /// Linear coefficient
    pub b: f64,
    /// Constant term
    pub c: f64,
}

impl Parabola {
    /// Evaluate at `x`.
    pub fn eval(&self, x: f64) -> f64 {
        (self.a * x + self.b) * x + self.c
    }

    /// Abscissa of the extremum, `-b / 2a`.
    ///
    /// Returns `None` when the curvature is zero (no extremum).
    pub fn vertex(&self) -> Option<f64> {
        if self.a == 0.0 {
            return None;
        }
        let v = -self.b / (2.0 * self.a);
        v.is_finite().then_some(v)
    }

    /// Coefficient of determination of this fit against the samples.
    pub fn r_squared(&self, xs: &[f64], ys: &[f64]) -> f64 {
        let mean_y = mean(ys);
        let mut ss_tot = 0.0;
        let mut ss_res = 0.0;
        for (&x, &y) in xs.iter().zip(ys) {
            ss_tot += (y - mean_y).powi(2);
            ss_res += (y - self.eval(x)).powi(2);
        }
        if ss_tot > 0.0 {
            (1.0 - ss_res / ss_tot).max(0.0)
        } else {
            0.0
        }
    }
}

/// Least-squares fit of a degree-2 polynomial.
///
/// Returns `None` for fewer than three points, mismatched lengths, or a
/// singular system (e.g. all abscissae equal).
pub fn fit_parabola(xs: &[f64], ys: &[f64]) -> Option<Parabola> {
    if xs.len() < 3 || xs.len() != ys.len() {
        return None;
    }

    let n = xs.len() as f64;
    let x0 = mean(xs);

    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_x2 = 0.0;
    let mut sum_x3 = 0.0;
    let mut sum_x4 = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_x2y = 0.0;

    for (&x, &y) in xs.iter().zip(ys) {
        let u = x - x0;
        let u2 = u * u;
        sum_x += u;
        sum_y += y;
        sum_x2 += u2;
        sum_x3 += u2 * u;
        sum_x4 += u2 * u2;
        sum_xy += u * y;
        sum_x2y += u2 * y;
    }

    let det = n * (sum_x2 * sum_x4 - sum_x3 * sum_x3)
        - sum_x * (sum_x * sum_x4 - sum_x2 * sum_x3)
        + sum_x2 * (sum_x * sum_x3 - sum_x2 * sum_x2);

    // Scale-aware singularity test: compare against the magnitude of the sums.
    let scale = (n * sum_x2 * sum_x4).abs().max(1.0);
    if det.abs() <= SINGULAR_EPS * scale {
        return None;
    }

    let det_c = sum_y * (sum_x2 * sum_x4 - sum_x3 * sum_x3)
        - sum_x * (sum_xy * sum_x4 - sum_x2y * sum_x3)
        + sum_x2 * (sum_xy * sum_x3 - sum_x2y * sum_x2);

    let det_b = n * (sum_xy * sum_x4 - sum_x2y * sum_x3)
        - sum_y * (sum_x * sum_x4 - sum_x2 * sum_x3)
        + sum_x2 * (sum_x * sum_x2y - sum_xy * sum_x2);

    let det_a = n * (sum_x2 * sum_x2y - sum_x3 * sum_xy)
        - sum_x * (sum_x * sum_x2y - sum_x2 * sum_xy)
        + sum_y * (sum_x * sum_x3 - sum_x2 * sum_x2);

    // Coefficients in the shifted variable u = x - x0.
    let a = det_a / det;
    let bu = det_b / det;
    let cu = det_c / det;

    // Expand back to x.
    let fit = Parabola {
        a,
        b: bu - 2.0 * a * x0,
        c: a * x0 * x0 - bu * x0 + cu,
    };

    (fit.a.is_finite() && fit.b.is_finite() && fit.c.is_finite()).then_some(fit)
}

/// Arithmetic mean; zero for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation; zero for fewer than two values.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// `n` evenly spaced values centered on `center`, `step` apart.
pub fn centered_grid(center: f64, step: f64, n: usize) -> Vec<f64> {
    let half = (n as f64 - 1.0) / 2.0;
    (0..n).map(|i| center + (i as f64 - half) * step).collect()
}
