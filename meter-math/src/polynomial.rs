//! Full two-dimensional polynomial basis.
//!
//! A polynomial of degree `d` in (u, v) is expanded over every monomial
//! `u^p · v^q` with `p + q ≤ d`:
//!
//! ```text
//! f(u, v) = Σ c_k · u^p_k · v^q_k
//! ```
//!
//! Terms are enumerated by increasing total degree, then by decreasing power of `u`:
//!
//! ```text
//! degree 0: 1
//! degree 1: u, v
//! degree 2: u², uv, v²
//! degree 3: u³, u²v, uv², v³
//! ```
//!
//! Callers are expected to normalise their inputs to roughly [-1, 1] so that
//! high-order coefficients stay well conditioned.

/// Monomial basis of a full 2D polynomial of fixed degree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolyBasis2d {
    degree: usize,
}

impl PolyBasis2d {
    pub fn new(degree: usize) -> Self {
        Self { degree }
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Number of monomials: (d + 1)(d + 2) / 2.
    pub fn num_terms(&self) -> usize {
        (self.degree + 1) * (self.degree + 2) / 2
    }

    /// Flat index of the monomial `u^p · v^q`.
    ///
    /// # Panics
    /// Panics if `p + q` exceeds the basis degree.
    pub fn term_index(&self, p: usize, q: usize) -> usize {
        let s = p + q;
        assert!(
            s <= self.degree,
            "monomial degree {s} exceeds basis degree {}",
            self.degree
        );
        // All terms of lower total degree come first, then p decreases from s.
        s * (s + 1) / 2 + (s - p)
    }

    /// Exponent pairs `(p, q)` in basis order.
    pub fn exponents(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.num_terms());
        for s in 0..=self.degree {
            for p in (0..=s).rev() {
                out.push((p, s - p));
            }
        }
        out
    }

    /// Evaluate every monomial at (u, v).
    pub fn terms(&self, u: f64, v: f64) -> Vec<f64> {
        let u_pow = powers(u, self.degree);
        let v_pow = powers(v, self.degree);
        self.exponents()
            .into_iter()
            .map(|(p, q)| u_pow[p] * v_pow[q])
            .collect()
    }

    /// Partial derivatives of every monomial with respect to u and v.
    pub fn derivative_terms(&self, u: f64, v: f64) -> (Vec<f64>, Vec<f64>) {
        let u_pow = powers(u, self.degree);
        let v_pow = powers(v, self.degree);
        let mut du = Vec::with_capacity(self.num_terms());
        let mut dv = Vec::with_capacity(self.num_terms());
        for (p, q) in self.exponents() {
            du.push(if p == 0 {
                0.0
            } else {
                p as f64 * u_pow[p - 1] * v_pow[q]
            });
            dv.push(if q == 0 {
                0.0
            } else {
                q as f64 * u_pow[p] * v_pow[q - 1]
            });
        }
        (du, dv)
    }

    /// Evaluate the polynomial with the given coefficients at (u, v).
    ///
    /// # Panics
    /// Panics if `coeffs` does not hold exactly [`Self::num_terms`] values.
    pub fn evaluate(&self, coeffs: &[f64], u: f64, v: f64) -> f64 {
        assert_eq!(coeffs.len(), self.num_terms(), "coefficient count mismatch");
        self.terms(u, v)
            .iter()
            .zip(coeffs)
            .map(|(t, c)| t * c)
            .sum()
    }

    /// Gradient (∂f/∂u, ∂f/∂v) of the polynomial at (u, v).
    pub fn gradient(&self, coeffs: &[f64], u: f64, v: f64) -> (f64, f64) {
        assert_eq!(coeffs.len(), self.num_terms(), "coefficient count mismatch");
        let (du, dv) = self.derivative_terms(u, v);
        let gu = du.iter().zip(coeffs).map(|(t, c)| t * c).sum();
        let gv = dv.iter().zip(coeffs).map(|(t, c)| t * c).sum();
        (gu, gv)
    }
}

fn powers(x: f64, degree: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(degree + 1);
    let mut acc = 1.0;
    for _ in 0..=degree {
        out.push(acc);
        acc *= x;
    }
    out
}
