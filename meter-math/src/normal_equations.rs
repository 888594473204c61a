//! Weighted linear least squares via the normal equations.
//!
//! Residual terms are linearised around the current parameters,
//! `r(p + δ) ≈ r(p) + J·δ`, and accumulated into
//!
//! ```text
//! (Jᵀ W J) δ = -Jᵀ W r
//! ```
//!
//! which is solved with a Cholesky factorisation. A system that is not
//! positive definite (degenerate parameter set, unconstrained parameter) is
//! reported as an error instead of producing a garbage step.

use nalgebra::{DMatrix, DVector, Matrix2, Vector2};
use thiserror::Error;

/// Errors produced when solving the accumulated system
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinearSolveError {
    #[error("normal equations have no free parameters")]
    Empty,

    #[error("normal matrix ({0}x{0}) is not positive definite")]
    NotPositiveDefinite(usize),

    #[error("solution contains non-finite values")]
    NonFinite,
}

/// Accumulator for the normal equations of a weighted least-squares problem.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    hessian: DMatrix<f64>,
    rhs: DVector<f64>,
}

impl NormalEquations {
    /// Create an empty system over `num_params` parameters.
    pub fn new(num_params: usize) -> Self {
        Self {
            hessian: DMatrix::zeros(num_params, num_params),
            rhs: DVector::zeros(num_params),
        }
    }

    pub fn num_params(&self) -> usize {
        self.rhs.len()
    }

    /// Accumulate a scalar residual.
    ///
    /// `jacobian[k]` is ∂r/∂p for parameter `indices[k]`.
    pub fn add_residual(&mut self, indices: &[usize], jacobian: &[f64], residual: f64, weight: f64) {
        debug_assert_eq!(indices.len(), jacobian.len());
        for (a, &ia) in indices.iter().enumerate() {
            let wa = weight * jacobian[a];
            for (b, &ib) in indices.iter().enumerate() {
                self.hessian[(ia, ib)] += wa * jacobian[b];
            }
            self.rhs[ia] -= wa * residual;
        }
    }

    /// Accumulate a two-component residual with a full 2x2 weight matrix.
    ///
    /// `jac_x[k]` and `jac_y[k]` are the derivatives of the two residual
    /// components with respect to parameter `indices[k]`.
    pub fn add_residual2(
        &mut self,
        indices: &[usize],
        jac_x: &[f64],
        jac_y: &[f64],
        residual: &Vector2<f64>,
        weight: &Matrix2<f64>,
    ) {
        debug_assert_eq!(indices.len(), jac_x.len());
        debug_assert_eq!(indices.len(), jac_y.len());

        let w_r = weight * residual;
        // W·J, column by column
        let wj: Vec<(f64, f64)> = jac_x
            .iter()
            .zip(jac_y)
            .map(|(&jx, &jy)| {
                (
                    weight[(0, 0)] * jx + weight[(0, 1)] * jy,
                    weight[(1, 0)] * jx + weight[(1, 1)] * jy,
                )
            })
            .collect();

        for (a, &ia) in indices.iter().enumerate() {
            for (b, &ib) in indices.iter().enumerate() {
                self.hessian[(ia, ib)] += jac_x[a] * wj[b].0 + jac_y[a] * wj[b].1;
            }
            self.rhs[ia] -= jac_x[a] * w_r.x + jac_y[a] * w_r.y;
        }
    }

    /// Solve for the parameter step δ.
    pub fn solve(&self) -> Result<DVector<f64>, LinearSolveError> {
        let n = self.num_params();
        if n == 0 {
            return Err(LinearSolveError::Empty);
        }

        let cholesky = self
            .hessian
            .clone()
            .cholesky()
            .ok_or(LinearSolveError::NotPositiveDefinite(n))?;
        let delta = cholesky.solve(&self.rhs);

        if delta.iter().any(|d| !d.is_finite()) {
            return Err(LinearSolveError::NonFinite);
        }
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_straight_line_fit() {
        // y = 2 + 3x, parameters [a, b], residual r = a + b x - y starting from zero
        let mut ne = NormalEquations::new(2);
        for i in 0..10 {
            let x = i as f64;
            let y = 2.0 + 3.0 * x;
            ne.add_residual(&[0, 1], &[1.0, x], -y, 1.0);
        }

        let delta = ne.solve().unwrap();
        assert_relative_eq!(delta[0], 2.0, epsilon = 1e-10);
        assert_relative_eq!(delta[1], 3.0, epsilon = 1e-10);
    }

    #[test]
    fn test_two_component_residual_recovers_offset() {
        // Single 2D point parameterised directly, observed 5 times around (1.5, -0.5)
        let mut ne = NormalEquations::new(2);
        let observations = [(1.4, -0.6), (1.6, -0.4), (1.5, -0.5), (1.45, -0.55), (1.55, -0.45)];
        let weight = Matrix2::new(4.0, 0.0, 0.0, 4.0);
        for (x, y) in observations {
            let residual = Vector2::new(-x, -y);
            ne.add_residual2(&[0, 1], &[1.0, 0.0], &[0.0, 1.0], &residual, &weight);
        }

        let delta = ne.solve().unwrap();
        assert_relative_eq!(delta[0], 1.5, epsilon = 1e-10);
        assert_relative_eq!(delta[1], -0.5, epsilon = 1e-10);
    }

    #[test]
    fn test_unconstrained_parameter_is_reported() {
        let mut ne = NormalEquations::new(2);
        ne.add_residual(&[0], &[1.0], 1.0, 1.0);

        assert_eq!(ne.solve(), Err(LinearSolveError::NotPositiveDefinite(2)));
    }

    #[test]
    fn test_empty_system() {
        assert_eq!(NormalEquations::new(0).solve(), Err(LinearSolveError::Empty));
    }
}
