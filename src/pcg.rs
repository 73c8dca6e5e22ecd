//! Sparse matrix storage and the preconditioned conjugate gradient
//! solver shared by the pressure and viscosity solves.
//!
//! Accumulation runs in `f64` regardless of the callers' grid scalar
//! type; tolerances are measured as the infinity-norm of the residual
//! relative to the right-hand side.

/// Row-major sparse matrix. Rows keep their entries in insertion order;
/// `set`/`add` on an existing column update it in place.
pub struct SparseMatrix {
    pub size: usize,
    rows: Vec<Vec<(u32, f64)>>,
}

impl SparseMatrix {
    /// `expected_row_entries` only sizes the per-row allocations.
    pub fn new(size: usize, expected_row_entries: usize) -> Self {
        Self {
            size,
            rows: (0..size)
                .map(|_| Vec::with_capacity(expected_row_entries))
                .collect(),
        }
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        let entries = &mut self.rows[row];
        for e in entries.iter_mut() {
            if e.0 == col as u32 {
                e.1 = value;
                return;
            }
        }
        entries.push((col as u32, value));
    }

    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        let entries = &mut self.rows[row];
        for e in entries.iter_mut() {
            if e.0 == col as u32 {
                e.1 += value;
                return;
            }
        }
        entries.push((col as u32, value));
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.rows[row]
            .iter()
            .find(|e| e.0 == col as u32)
            .map(|e| e.1)
            .unwrap_or(0.0)
    }

    /// y = A x
    pub fn multiply(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.size);
        for (row, out) in self.rows.iter().zip(y.iter_mut()) {
            let mut sum = 0.0;
            for &(col, value) in row {
                sum += value * x[col as usize];
            }
            *out = sum;
        }
    }

    fn diagonal(&self) -> Vec<f64> {
        (0..self.size).map(|i| self.get(i, i)).collect()
    }
}

/// Outcome of a PCG solve.
#[derive(Clone, Copy, Debug, Default)]
pub struct SolveResult {
    pub converged: bool,
    pub iterations: usize,
    /// Relative infinity-norm residual at exit.
    pub error: f64,
}

/// Reported status of a grid solver pass. Never raised as an error;
/// callers fold it into the frame statistics.
#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct SolverStatus {
    /// Residual fell below the tolerance.
    pub success: bool,
    /// Hit the iteration cap but landed under the acceptable tolerance.
    pub partial_success: bool,
    pub iterations: usize,
    pub error: f64,
}

impl SolverStatus {
    pub fn acceptable(&self) -> bool {
        self.success || self.partial_success
    }

    pub fn from_result(result: SolveResult, max_iterations: usize, acceptable_tolerance: f64) -> Self {
        Self {
            success: result.converged,
            partial_success: !result.converged
                && result.iterations == max_iterations
                && result.error < acceptable_tolerance,
            iterations: result.iterations,
            error: result.error,
        }
    }
}

fn norm_inf(v: &[f64]) -> f64 {
    v.iter().fold(0.0f64, |m, &x| m.max(x.abs()))
}

/// Jacobi-preconditioned conjugate gradient. `x` carries the initial
/// guess in and the solution out.
pub fn solve_pcg(
    matrix: &SparseMatrix,
    rhs: &[f64],
    x: &mut [f64],
    tolerance: f64,
    max_iterations: usize,
) -> SolveResult {
    let n = matrix.size;
    debug_assert_eq!(rhs.len(), n);
    debug_assert_eq!(x.len(), n);

    if n == 0 {
        return SolveResult {
            converged: true,
            iterations: 0,
            error: 0.0,
        };
    }

    let rhs_norm = norm_inf(rhs);
    if rhs_norm == 0.0 {
        x.fill(0.0);
        return SolveResult {
            converged: true,
            iterations: 0,
            error: 0.0,
        };
    }

    let diag = matrix.diagonal();
    let precondition = |r: &[f64], z: &mut [f64]| {
        for i in 0..n {
            z[i] = if diag[i].abs() > 1e-30 { r[i] / diag[i] } else { r[i] };
        }
    };

    // r = b - A x
    let mut r = vec![0.0; n];
    matrix.multiply(x, &mut r);
    for i in 0..n {
        r[i] = rhs[i] - r[i];
    }

    let mut error = norm_inf(&r) / rhs_norm;
    if error < tolerance {
        return SolveResult {
            converged: true,
            iterations: 0,
            error,
        };
    }

    let mut z = vec![0.0; n];
    precondition(&r, &mut z);
    let mut s = z.clone();
    let mut sigma: f64 = z.iter().zip(&r).map(|(a, b)| a * b).sum();
    let mut t = vec![0.0; n];

    for iteration in 1..=max_iterations {
        matrix.multiply(&s, &mut t);
        let st: f64 = s.iter().zip(&t).map(|(a, b)| a * b).sum();
        if st.abs() < 1e-300 {
            return SolveResult {
                converged: false,
                iterations: iteration,
                error,
            };
        }

        let alpha = sigma / st;
        for i in 0..n {
            x[i] += alpha * s[i];
            r[i] -= alpha * t[i];
        }

        error = norm_inf(&r) / rhs_norm;
        if error < tolerance {
            return SolveResult {
                converged: true,
                iterations: iteration,
                error,
            };
        }

        precondition(&r, &mut z);
        let sigma_new: f64 = z.iter().zip(&r).map(|(a, b)| a * b).sum();
        let beta = sigma_new / sigma;
        for i in 0..n {
            s[i] = z[i] + beta * s[i];
        }
        sigma = sigma_new;
    }

    SolveResult {
        converged: false,
        iterations: max_iterations,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_set_and_add() {
        let mut m = SparseMatrix::new(3, 4);
        m.set(0, 0, 2.0);
        m.add(0, 0, 1.0);
        m.add(0, 2, -1.0);
        assert_eq!(m.get(0, 0), 3.0);
        assert_eq!(m.get(0, 2), -1.0);
        assert_eq!(m.get(0, 1), 0.0);
    }

    #[test]
    fn test_multiply() {
        let mut m = SparseMatrix::new(2, 2);
        m.set(0, 0, 2.0);
        m.set(0, 1, 1.0);
        m.set(1, 1, 3.0);
        let mut y = vec![0.0; 2];
        m.multiply(&[1.0, 2.0], &mut y);
        assert_eq!(y, vec![4.0, 6.0]);
    }

    #[test]
    fn test_pcg_solves_spd_system() {
        // 1D Laplacian with Dirichlet ends: tridiag(-1, 2, -1)
        let n = 16;
        let mut m = SparseMatrix::new(n, 3);
        for i in 0..n {
            m.set(i, i, 2.0);
            if i > 0 {
                m.set(i, i - 1, -1.0);
            }
            if i + 1 < n {
                m.set(i, i + 1, -1.0);
            }
        }
        let rhs = vec![1.0; n];
        let mut x = vec![0.0; n];

        let result = solve_pcg(&m, &rhs, &mut x, 1e-10, 200);
        assert!(result.converged, "error = {}", result.error);

        let mut check = vec![0.0; n];
        m.multiply(&x, &mut check);
        for (a, b) in check.iter().zip(&rhs) {
            assert!((a - b).abs() < 1e-8);
        }
    }

    #[test]
    fn test_pcg_zero_rhs_short_circuits() {
        let mut m = SparseMatrix::new(2, 2);
        m.set(0, 0, 1.0);
        m.set(1, 1, 1.0);
        let mut x = vec![5.0, 5.0];
        let result = solve_pcg(&m, &[0.0, 0.0], &mut x, 1e-9, 10);
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(x, vec![0.0, 0.0]);
    }

    #[test]
    fn test_pcg_reports_non_convergence() {
        let n = 64;
        let mut m = SparseMatrix::new(n, 3);
        for i in 0..n {
            m.set(i, i, 2.0);
            if i > 0 {
                m.set(i, i - 1, -1.0);
            }
            if i + 1 < n {
                m.set(i, i + 1, -1.0);
            }
        }
        let rhs = vec![1.0; n];
        let mut x = vec![0.0; n];
        let result = solve_pcg(&m, &rhs, &mut x, 1e-14, 1);
        assert!(!result.converged);
        assert_eq!(result.iterations, 1);
    }
}
