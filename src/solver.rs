//! Active-set solver for the mean-variance program
//!
//! ```text
//! minimize   wᵀ Σ w
//! subject to μᵀw = r,  Σwᵢ = 1,  wᵢ ≥ 0 (long-only)
//! ```
//!
//! Equality-constrained subproblems go through the KKT system with an SVD
//! least-squares solve, so a singular covariance (duplicated or riskless
//! assets) still yields a minimizer.

use crate::error::SkipReason;
use nalgebra::{DMatrix, DVector};
use std::time::Instant;

/// Targets this close (in scaled return units) to an extreme mean are treated as the extreme.
const BOUNDARY_TOL: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolverSettings {
    pub max_iterations: usize,
    /// Step-size threshold for convergence and multiplier sign tolerance.
    pub tolerance: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-10,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QpSolution {
    pub weights: Vec<f64>,
    pub iterations: usize,
}

/// One problem instance per frontier; immutable, shared across grid points.
#[derive(Clone, Debug)]
pub struct MeanVarianceQp {
    n: usize,
    /// Hessian of the rescaled objective, `2Σ / s`.
    hessian: DMatrix<f64>,
    /// Mean returns centered on their average and divided by `ret_scale`.
    scaled_mean: Vec<f64>,
    mean_center: f64,
    /// Zero when every asset has the same mean; the return row is then implied by the budget row.
    ret_scale: f64,
    allow_short: bool,
    settings: SolverSettings,
}

impl MeanVarianceQp {
    pub fn new(
        mean: &[f64],
        covariance: &[Vec<f64>],
        allow_short: bool,
        settings: SolverSettings,
    ) -> Self {
        let n = mean.len();

        let sigma_scale = (0..n)
            .map(|i| covariance[i][i].abs())
            .fold(0.0_f64, f64::max);
        let sigma_scale = if sigma_scale > 0.0 { sigma_scale } else { 1.0 };
        let hessian = DMatrix::from_fn(n, n, |i, j| 2.0 * covariance[i][j] / sigma_scale);

        let mean_center = mean.iter().sum::<f64>() / n as f64;
        let spread = mean
            .iter()
            .map(|m| (m - mean_center).abs())
            .fold(0.0_f64, f64::max);
        let ret_scale = if spread > 0.0 && spread > BOUNDARY_TOL * mean_center.abs() {
            spread
        } else {
            0.0
        };
        let scaled_mean = mean
            .iter()
            .map(|m| if ret_scale > 0.0 { (m - mean_center) / ret_scale } else { 0.0 })
            .collect();

        Self {
            n,
            hessian,
            scaled_mean,
            mean_center,
            ret_scale,
            allow_short,
            settings,
        }
    }

    /// Solves for the minimum-variance weights achieving `target` return.
    pub fn solve(&self, target: f64, deadline: Option<Instant>) -> Result<QpSolution, SkipReason> {
        if self.n == 0 {
            return Err(SkipReason::NumericalFailure("no assets".into()));
        }
        if !target.is_finite() {
            return Err(SkipReason::NumericalFailure("non-finite target".into()));
        }

        let a = &self.scaled_mean;
        let a_max = a.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let a_min = a.iter().copied().fold(f64::INFINITY, f64::min);

        let mut rhs = if self.ret_scale > 0.0 {
            (target - self.mean_center) / self.ret_scale
        } else {
            0.0
        };
        if self.ret_scale == 0.0 && !self.attains_flat_target(target) {
            return Err(SkipReason::Infeasible);
        }

        // Indices of the reduced problem, and whether the return row survives.
        let mut vars: Vec<usize> = (0..self.n).collect();
        let mut keep_return_row = self.ret_scale > 0.0;

        if !self.allow_short && keep_return_row {
            if rhs > a_max + BOUNDARY_TOL || rhs < a_min - BOUNDARY_TOL {
                return Err(SkipReason::Infeasible);
            }
            // At an extreme mean only the assets sharing it can hold weight.
            let extreme = if rhs >= a_max - BOUNDARY_TOL {
                Some(a_max)
            } else if rhs <= a_min + BOUNDARY_TOL {
                Some(a_min)
            } else {
                None
            };
            if let Some(level) = extreme {
                vars.retain(|&i| (a[i] - level).abs() <= BOUNDARY_TOL);
                keep_return_row = false;
            }
            rhs = rhs.clamp(a_min, a_max);
        }

        let reduced_mean: Vec<f64> = vars.iter().map(|&i| a[i]).collect();
        let w0 = initial_point(&reduced_mean, rhs, keep_return_row);

        let m = vars.len();
        let hessian = DMatrix::from_fn(m, m, |i, j| self.hessian[(vars[i], vars[j])]);
        let mut constraints = vec![vec![1.0; m]];
        if keep_return_row {
            constraints.push(reduced_mean);
        }

        let (reduced, iterations) = self.active_set(&hessian, &constraints, w0, deadline)?;

        let mut weights = vec![0.0; self.n];
        for (k, &i) in vars.iter().enumerate() {
            weights[i] = reduced[k];
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(SkipReason::NumericalFailure("non-finite weights".into()));
        }

        Ok(QpSolution { weights, iterations })
    }

    /// With identical means, only that common mean is attainable.
    fn attains_flat_target(&self, target: f64) -> bool {
        let scale = self.mean_center.abs().max(1e-12);
        (target - self.mean_center).abs() <= BOUNDARY_TOL * scale
    }

    /// Primal active-set iterations from a feasible start.
    fn active_set(
        &self,
        hessian: &DMatrix<f64>,
        constraints: &[Vec<f64>],
        mut w: Vec<f64>,
        deadline: Option<Instant>,
    ) -> Result<(Vec<f64>, usize), SkipReason> {
        let m = w.len();
        let bounded = !self.allow_short;
        let tol = self.settings.tolerance;
        let started = Instant::now();
        let mut working = vec![false; m];

        for iteration in 1..=self.settings.max_iterations {
            if let Some(limit) = deadline {
                if Instant::now() >= limit {
                    return Err(SkipReason::DeadlineExceeded {
                        elapsed_ms: started.elapsed().as_millis(),
                    });
                }
            }

            let free: Vec<usize> = (0..m).filter(|&i| !working[i]).collect();
            let gradient = hessian * DVector::from_column_slice(&w);
            let (step, multipliers) = solve_kkt(hessian, constraints, &free, &gradient)?;

            let step_norm = step.iter().fold(0.0_f64, |acc, p| acc.max(p.abs()));
            if step_norm <= tol {
                if !bounded {
                    return Ok((w, iteration));
                }
                // Bound multiplier κᵢ = gᵢ + Σₖ yₖ Aₖᵢ must be non-negative at the optimum.
                let released = (0..m)
                    .filter(|&i| working[i])
                    .map(|i| {
                        let kappa = gradient[i]
                            + constraints
                                .iter()
                                .zip(multipliers.iter())
                                .map(|(row, y)| row[i] * y)
                                .sum::<f64>();
                        (i, kappa)
                    })
                    .min_by(|a, b| a.1.total_cmp(&b.1));

                match released {
                    Some((i, kappa)) if kappa < -tol => working[i] = false,
                    _ => return Ok((clamp_nonnegative(w), iteration)),
                }
                continue;
            }

            let mut alpha = 1.0;
            let mut blocking = None;
            if bounded {
                for (k, &i) in free.iter().enumerate() {
                    if step[k] < 0.0 {
                        let ratio = -w[i] / step[k];
                        if ratio < alpha {
                            alpha = ratio.max(0.0);
                            blocking = Some(i);
                        }
                    }
                }
            }

            for (k, &i) in free.iter().enumerate() {
                w[i] += alpha * step[k];
            }
            if let Some(i) = blocking {
                w[i] = 0.0;
                working[i] = true;
            }
        }

        Err(SkipReason::IterationLimit {
            iterations: self.settings.max_iterations,
        })
    }
}

/// Equal weights moved along the segment toward the extreme-mean asset until
/// the return row holds. Strictly positive whenever the target is interior.
fn initial_point(scaled_mean: &[f64], rhs: f64, with_return_row: bool) -> Vec<f64> {
    let m = scaled_mean.len();
    let mut w = vec![1.0 / m as f64; m];
    if !with_return_row {
        return w;
    }

    let current = scaled_mean.iter().sum::<f64>() / m as f64;
    let pick = |better: fn(f64, f64) -> bool| {
        (0..m).fold(0, |best, i| if better(scaled_mean[i], scaled_mean[best]) { i } else { best })
    };
    let k = if rhs >= current {
        pick(|a, b| a > b)
    } else {
        pick(|a, b| a < b)
    };

    let span = scaled_mean[k] - current;
    if span.abs() <= f64::EPSILON {
        return w;
    }
    let t = (rhs - current) / span;
    for (i, wi) in w.iter_mut().enumerate() {
        *wi *= 1.0 - t;
        if i == k {
            *wi += t;
        }
    }
    w
}

/// Solves the equality-constrained step on the free variables:
///
/// ```text
/// [ H_FF  A_Fᵀ ] [ p ]   [ -g_F ]
/// [ A_F    0   ] [ y ] = [  0   ]
/// ```
fn solve_kkt(
    hessian: &DMatrix<f64>,
    constraints: &[Vec<f64>],
    free: &[usize],
    gradient: &DVector<f64>,
) -> Result<(Vec<f64>, Vec<f64>), SkipReason> {
    let nf = free.len();
    let nc = constraints.len();
    let size = nf + nc;

    let mut kkt = DMatrix::<f64>::zeros(size, size);
    let mut rhs = DVector::<f64>::zeros(size);

    for (r, &i) in free.iter().enumerate() {
        for (c, &j) in free.iter().enumerate() {
            kkt[(r, c)] = hessian[(i, j)];
        }
        for (k, row) in constraints.iter().enumerate() {
            kkt[(r, nf + k)] = row[i];
            kkt[(nf + k, r)] = row[i];
        }
        rhs[r] = -gradient[i];
    }

    let svd = kkt
        .try_svd(true, true, f64::EPSILON, 0)
        .ok_or_else(|| SkipReason::NumericalFailure("SVD did not converge".into()))?;
    let eps = svd.singular_values.max() * 1e-12;
    let solution = svd
        .solve(&rhs, eps)
        .map_err(|e| SkipReason::NumericalFailure(e.to_string()))?;

    if solution.iter().any(|v| !v.is_finite()) {
        return Err(SkipReason::NumericalFailure("non-finite KKT solution".into()));
    }

    let step = solution.rows(0, nf).iter().copied().collect();
    let multipliers = solution.rows(nf, nc).iter().copied().collect();
    Ok((step, multipliers))
}

fn clamp_nonnegative(mut w: Vec<f64>) -> Vec<f64> {
    for wi in w.iter_mut() {
        if *wi < 0.0 {
            *wi = 0.0;
        }
    }
    w
}
