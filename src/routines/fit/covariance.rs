use anyhow::{bail, Result};
use faer::prelude::*;
use faer::Mat;
use ndarray::Array2;

/// Central finite-difference Hessian of `f` at `x`
///
/// `steps[i]` is the step along the i-th coordinate. Evaluates `f` `2n² + 1` times at most.
pub(crate) fn hessian<F>(mut f: F, x: &[f64], steps: &[f64]) -> Result<Array2<f64>>
where
    F: FnMut(&[f64]) -> Result<f64>,
{
    let n = x.len();
    let mut point = x.to_vec();
    let f0 = f(&point)?;
    let mut hess = Array2::zeros((n, n));

    let mut eval = |point: &mut Vec<f64>, shifts: &[(usize, f64)]| -> Result<f64> {
        for &(i, d) in shifts {
            point[i] += d;
        }
        let value = f(point.as_slice());
        for &(i, _) in shifts {
            point[i] = x[i];
        }
        value
    };

    for i in 0..n {
        let hi = steps[i];
        let fp = eval(&mut point, &[(i, hi)])?;
        let fm = eval(&mut point, &[(i, -hi)])?;
        hess[[i, i]] = (fp - 2.0 * f0 + fm) / (hi * hi);

        for j in 0..i {
            let hj = steps[j];
            let fpp = eval(&mut point, &[(i, hi), (j, hj)])?;
            let fpm = eval(&mut point, &[(i, hi), (j, -hj)])?;
            let fmp = eval(&mut point, &[(i, -hi), (j, hj)])?;
            let fmm = eval(&mut point, &[(i, -hi), (j, -hj)])?;
            let value = (fpp - fpm - fmp + fmm) / (4.0 * hi * hj);
            hess[[i, j]] = value;
            hess[[j, i]] = value;
        }
    }

    if hess.iter().any(|v| !v.is_finite()) {
        bail!("The Hessian of the statistic is not finite");
    }
    Ok(hess)
}

/// Inverse of a symmetric positive definite matrix, through its Cholesky decomposition
pub(crate) fn invert_spd(matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let (n, m) = matrix.dim();
    if n != m {
        bail!("Cannot invert a non-square matrix of shape ({}, {})", n, m);
    }
    let mat = Mat::<f64>::from_fn(n, n, |i, j| matrix[[i, j]]);
    let cholesky = match mat.cholesky(faer::Side::Lower) {
        Ok(cholesky) => cholesky,
        Err(e) => bail!("Matrix is not positive definite: {:?}", e),
    };
    let inverse = cholesky.inverse();
    Ok(Array2::from_shape_fn((n, n), |(i, j)| inverse.read(i, j)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_hessian_of_quadratic() {
        // f = 2x² + 3xy + 5y², H = [[4, 3], [3, 10]]
        let f = |p: &[f64]| -> Result<f64> {
            Ok(2.0 * p[0] * p[0] + 3.0 * p[0] * p[1] + 5.0 * p[1] * p[1])
        };
        let hess = hessian(f, &[1.0, -2.0], &[1e-3, 1e-3]).unwrap();
        let expected = array![[4.0, 3.0], [3.0, 10.0]];
        for (a, b) in hess.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5, "{} != {}", a, b);
        }
    }

    #[test]
    fn test_invert_spd() {
        let matrix = array![[4.0, 2.0], [2.0, 3.0]];
        let inverse = invert_spd(&matrix).unwrap();
        let product = matrix.dot(&inverse);
        for ((i, j), v) in product.indexed_iter() {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert!((v - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn test_invert_rejects_indefinite() {
        let matrix = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(invert_spd(&matrix).is_err());
    }
}
