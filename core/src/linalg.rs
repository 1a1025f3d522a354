//! Linear algebra helpers for the Kalman update.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn chol_solve_spd(a, b, opt) -> Option<DMatrix<f64>>
//!     pub fn robust_spd_solve(a, b) -> Option<DMatrix<f64>>
//!
//! Strategy for solving S X = B with an innovation covariance S:
//! 1) Symmetrize S ← 0.5 (S + Sᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
//! 4) Explicit inverse
//!
//! Every path rejects a non-finite solution, so a caller sees `None` instead of NaNs leaking
//! into the state.

use nalgebra::DMatrix;
use nalgebra::linalg::Cholesky;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Reduces the round-off asymmetry that accumulates in covariance products.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub initial_jitter: f64, // e.g., 1e-12
    pub max_jitter: f64,     // e.g., 1e-6
    pub max_tries: usize,    // e.g., 6
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 6,
        }
    }
}

fn all_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}

/// Solve A X = B for SPD-ish A via Cholesky, with jitter retries.
/// Returns None if all attempts fail or A / B are not finite.
pub fn chol_solve_spd(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    opt: SolveOptions,
) -> Option<DMatrix<f64>> {
    if !a.is_square() || a.nrows() != b.nrows() || !all_finite(a) || !all_finite(b) {
        return None;
    }
    let a_sym = symmetrize(a);

    if let Some(ch) = Cholesky::new(a_sym.clone()) {
        let x = ch.solve(b);
        if all_finite(&x) {
            return Some(x);
        }
    }

    // Jitter ramp
    let n = a_sym.nrows();
    let mut jitter = opt.initial_jitter;
    for _ in 0..opt.max_tries {
        let mut a_j = a_sym.clone();
        for i in 0..n {
            a_j[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(a_j) {
            let x = ch.solve(b);
            if all_finite(&x) {
                return Some(x);
            }
        }
        jitter *= 10.0;
        if jitter > opt.max_jitter {
            break;
        }
    }
    None
}

/// Robust SPD solve with sane defaults:
/// - Cholesky + jitter (preferred)
/// - Last resort: explicit inverse
///
/// Returns None when A can not be inverted at all.
pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if let Some(x) = chol_solve_spd(a, b, SolveOptions::default()) {
        return Some(x);
    }
    if !all_finite(a) || !all_finite(b) || a.nrows() != b.nrows() {
        return None;
    }
    let inv = symmetrize(a).try_inverse()?;
    let x = &inv * b;
    all_finite(&x).then_some(x)
}

/* =============================== Tests ==================================== */

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        if a.shape() != b.shape() {
            return false;
        }
        let mut max_abs = 0.0f64;
        for i in 0..a.nrows() {
            for j in 0..a.ncols() {
                max_abs = max_abs.max((a[(i, j)] - b[(i, j)]).abs());
            }
        }
        max_abs <= tol
    }

    #[test]
    fn t_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s = symmetrize(&m);
        let s_expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]);
        assert!(approx_eq(&s, &s_expected, 1e-15));
    }

    #[test]
    fn t_chol_solve_spd() {
        // A = L Lᵀ is SPD
        let l = DMatrix::from_row_slice(3, 3, &[2.0, 0.0, 0.0, 0.5, 1.0, 0.0, -0.3, 0.2, 0.7]);
        let a = &l * l.transpose();
        let x_true = DMatrix::from_row_slice(3, 2, &[1.0, -1.0, 0.5, 2.0, -0.25, 0.0]);
        let b = &a * &x_true;
        let x = chol_solve_spd(&a, &b, SolveOptions::default()).expect("SPD solve");
        assert!(approx_eq(&x, &x_true, 1e-10));
    }

    #[test]
    fn t_chol_solve_psd_needs_jitter() {
        // PSD but not PD: jitter rescues the factorization
        let mut a = DMatrix::<f64>::identity(3, 3);
        a[(1, 1)] = 0.0;
        let b = DMatrix::from_row_slice(3, 1, &[1.0, 0.0, 2.0]);
        let x = chol_solve_spd(&a, &b, SolveOptions::default()).expect("jittered solve");
        assert!((x[(0, 0)] - 1.0).abs() < 1e-6);
        assert!((x[(2, 0)] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn t_robust_falls_back_to_inverse() {
        // Symmetric indefinite: Cholesky fails, inverse works
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let b = DMatrix::<f64>::identity(2, 2);
        let x = robust_spd_solve(&a, &b).expect("inverse fallback");
        assert!(approx_eq(&(&a * &x), &b, 1e-12));
    }

    #[test]
    fn t_robust_rejects_non_finite() {
        let mut a = DMatrix::<f64>::identity(2, 2);
        a[(0, 0)] = f64::INFINITY;
        let b = DMatrix::<f64>::identity(2, 2);
        assert!(robust_spd_solve(&a, &b).is_none());

        a[(0, 0)] = f64::NAN;
        assert!(robust_spd_solve(&a, &b).is_none());
    }

    #[test]
    fn t_robust_rejects_singular() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, -1.0, -1.0, 1.0 - 1e-3]);
        // indefinite and beyond the jitter budget, but invertible
        assert!(robust_spd_solve(&a, &DMatrix::identity(2, 2)).is_some());

        let zero = DMatrix::from_row_slice(2, 2, &[-1.0, 0.0, 0.0, 0.0]);
        assert!(robust_spd_solve(&zero, &DMatrix::identity(2, 2)).is_none());
    }

    #[test]
    fn t_shape_mismatch_is_none() {
        let a = DMatrix::<f64>::identity(3, 3);
        let b = DMatrix::<f64>::zeros(2, 1);
        assert!(robust_spd_solve(&a, &b).is_none());
    }
}
