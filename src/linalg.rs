//! Small dense least-squares helpers used by the forecaster.

const PIVOT_EPS: f64 = 1e-12;

/// Solves `(XᵀX + diag(penalties)) β = Xᵀy` by Gaussian elimination with
/// partial pivoting. Rows of `x` are observations.
///
/// Returns `None` when the system is singular or produces non-finite
/// coefficients.
pub fn solve_penalized_least_squares(
    x: &[Vec<f64>],
    y: &[f64],
    penalties: &[f64],
) -> Option<Vec<f64>> {
    let p = penalties.len();
    if p == 0 || x.len() != y.len() || x.iter().any(|row| row.len() != p) {
        return None;
    }

    let mut xtx = vec![vec![0.0; p]; p];
    let mut xty = vec![0.0; p];
    for (row, &target) in x.iter().zip(y) {
        for a in 0..p {
            let xa = row[a];
            if xa == 0.0 {
                continue;
            }
            xty[a] += xa * target;
            for b in 0..p {
                xtx[a][b] += xa * row[b];
            }
        }
    }
    for (d, penalty) in penalties.iter().enumerate() {
        xtx[d][d] += penalty;
    }

    solve_in_place(xtx, xty)
}

fn solve_in_place(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let p = b.len();
    for col in 0..p {
        let pivot_row = (col..p).max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))?;
        if a[pivot_row][col].abs() < PIVOT_EPS {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        let inv = 1.0 / a[col][col];
        for j in col..p {
            a[col][j] *= inv;
        }
        b[col] *= inv;

        for r in 0..p {
            if r == col {
                continue;
            }
            let factor = a[r][col];
            if factor == 0.0 {
                continue;
            }
            for j in col..p {
                a[r][j] -= factor * a[col][j];
            }
            b[r] -= factor * b[col];
        }
    }

    if b.iter().all(|v| v.is_finite()) {
        Some(b)
    } else {
        None
    }
}
