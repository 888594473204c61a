//! Numeric building blocks shared by the astrometric calibration crates.
//!
//! - [`polynomial`]: full 2D polynomial basis used by per-exposure distortion mappings
//! - [`normal_equations`]: weighted least-squares accumulation and Cholesky solve
//! - [`stats`]: summary statistics used for sigma clipping
//! - [`correspondence`]: nearest-neighbour matching of planar point sets

pub mod correspondence;
pub mod normal_equations;
pub mod polynomial;
pub mod stats;

pub use correspondence::{match_within_radius, nearest_within};
pub use normal_equations::{LinearSolveError, NormalEquations};
pub use polynomial::PolyBasis2d;
pub use stats::{mean_and_std, SigmaClip};
