//! Rational function interpolation and set reconciliation.
//!
//! A node's sample values are `prod(point - e)` over its elements.  Dividing
//! the remote samples by the local ones cancels the shared elements and
//! leaves the ratio of two characteristic polynomials, one per side of the
//! symmetric difference.  [`interpolate`] recovers that ratio from `mbar`
//! samples, [`reconcile`] validates it against a held-out sample and factors
//! both halves into their roots.

use std::sync::Arc;

use num_bigint::BigUint;
use num_traits::One;
use rand::Rng;

use crate::error::ReconError;
use crate::field::Zp;
use crate::matrix::Matrix;
use crate::poly::Poly;
use crate::zset::ZSet;

/// Quotient of two polynomials recovered by interpolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RationalFn {
    /// Numerator, monic.
    pub num: Poly,
    /// Denominator, monic.
    pub denom: Poly,
}

impl RationalFn {
    /// Evaluates `num(z) / denom(z)`.
    pub fn eval(&self, z: &Zp) -> Result<Zp, ReconError> {
        self.num.eval(z).div(&self.denom.eval(z))
    }
}

/// Reconstructs `num / denom` from sampled ratios.
///
/// `deg_diff` is `deg(num) - deg(denom)`, i.e. the difference between the
/// two set sizes.  Fails with [`ReconError::Interpolate`] when it exceeds the
/// number of samples.
pub fn interpolate(values: &[Zp], points: &[Zp], deg_diff: i64) -> Result<RationalFn, ReconError> {
    if deg_diff.unsigned_abs() as usize > values.len() || values.is_empty() {
        return Err(ReconError::Interpolate {
            deg_diff,
            samples: values.len(),
        });
    }
    if points.len() < values.len() {
        return Err(ReconError::SampleMismatch {
            values: values.len(),
            points: points.len(),
        });
    }
    let p = values[0].modulus().clone();
    let mut mbar = values.len() as i64;
    if (mbar + deg_diff) % 2 != 0 {
        mbar -= 1;
    }
    let ma = ((mbar + deg_diff) / 2) as usize;
    let mb = ((mbar - deg_diff) / 2) as usize;
    let mbar = mbar as usize;

    let mut matrix = Matrix::new(mbar + 1, mbar, Zp::zero(&p));
    for j in 0..mbar {
        let k = &points[j];
        let f = &values[j];
        let mut accum = Zp::one(&p);
        for i in 0..ma {
            matrix.set(i, j, accum.clone());
            accum = &accum * k;
        }
        let k_ma = accum;
        let mut accum = -f;
        for i in ma..mbar {
            matrix.set(i, j, accum.clone());
            accum = &accum * k;
        }
        let f_k_mb = -accum;
        matrix.set(mbar, j, &f_k_mb - &k_ma);
    }
    matrix.reduce()?;

    let mut a = (0..ma).map(|j| matrix.get(mbar, j).clone()).collect::<Vec<_>>();
    a.push(Zp::one(&p));
    let mut b = (0..mb)
        .map(|j| matrix.get(mbar, j + ma).clone())
        .collect::<Vec<_>>();
    b.push(Zp::one(&p));
    let a = Poly::new(&p, a);
    let b = Poly::new(&p, b);

    let g = Poly::gcd(&a, &b)?;
    Ok(RationalFn {
        num: a.div(&g)?,
        denom: b.div(&g)?,
    })
}

/// Recovers the symmetric difference behind a set of sample ratios.
///
/// `values[i]` is `remote(points[i]) / local(points[i])` and `deg_diff` is
/// `remote size - local size`.  Returns `(remote_only, local_only)`, or
/// [`ReconError::LowMBar`] when the difference is too large for the samples
/// supplied.
pub fn reconcile(values: &[Zp], points: &[Zp], deg_diff: i64) -> Result<(ZSet, ZSet), ReconError> {
    if values.len() != points.len() {
        return Err(ReconError::SampleMismatch {
            values: values.len(),
            points: points.len(),
        });
    }
    let Some(last) = values.len().checked_sub(1).filter(|n| *n > 0) else {
        return Err(ReconError::Interpolate {
            deg_diff,
            samples: values.len(),
        });
    };
    let rfn = interpolate(&values[..last], &points[..last], deg_diff)?;
    let check = match rfn.eval(&points[last]) {
        Ok(v) => v,
        Err(ReconError::DivisionByZero) => return Err(ReconError::LowMBar),
        Err(err) => return Err(err),
    };
    if check != values[last] || !factor_check(&rfn.num)? || !factor_check(&rfn.denom)? {
        return Err(ReconError::LowMBar);
    }
    Ok((factor(&rfn.num)?, factor(&rfn.denom)?))
}

/// `z^p mod f` for the field of `f`.
fn frobenius(f: &Poly) -> Result<Poly, ReconError> {
    let p = f.modulus();
    let z = Poly::from_i64s(p, &[0, 1]);
    z.pow_mod(p, f)
}

/// Tests whether `f` splits into distinct linear factors over the field,
/// i.e. whether `z^p = z (mod f)`.
pub fn factor_check(f: &Poly) -> Result<bool, ReconError> {
    if f.degree() <= 1 {
        return Ok(true);
    }
    let z = Poly::from_i64s(f.modulus(), &[0, 1]);
    let diff = &frobenius(f)? - &z;
    Ok(diff.rem(f)?.is_zero())
}

/// Returns the set of roots of `f`.
///
/// Fails with [`ReconError::InvalidFactor`] when `f` has an irreducible
/// factor of degree greater than one.
pub fn factor(f: &Poly) -> Result<ZSet, ReconError> {
    factor_with(f, &mut rand::thread_rng())
}

/// [`factor`] with a caller supplied random source.
pub fn factor_with<R: Rng + ?Sized>(f: &Poly, rng: &mut R) -> Result<ZSet, ReconError> {
    let mut roots = ZSet::new();
    if f.degree() == 0 {
        return Ok(roots);
    }
    let f = f.monic()?;
    if f.degree() == 1 {
        roots.add(-&f.coeffs()[0]);
        return Ok(roots);
    }
    let z = Poly::from_i64s(f.modulus(), &[0, 1]);
    // product of the distinct linear factors of f
    let linear = Poly::gcd(&f, &(&frobenius(&f)? - &z))?;
    let mut residual = f.clone();
    for factor in equal_degree_split(&linear, rng)? {
        if factor.degree() != 1 {
            return Err(ReconError::InvalidFactor(factor.degree()));
        }
        roots.add(-&factor.coeffs()[0]);
        loop {
            let (q, r) = residual.divmod(&factor)?;
            if !r.is_zero() {
                break;
            }
            residual = q;
        }
    }
    if residual.degree() > 0 {
        return Err(ReconError::InvalidFactor(residual.degree()));
    }
    Ok(roots)
}

/// Cantor-Zassenhaus splitting of a squarefree product of linear factors.
fn equal_degree_split<R: Rng + ?Sized>(f: &Poly, rng: &mut R) -> Result<Vec<Poly>, ReconError> {
    let p: &Arc<BigUint> = f.modulus();
    let half = (p.as_ref() - BigUint::one()) >> 1;
    let one = Poly::constant(Zp::one(p));
    let mut out = Vec::new();
    let mut work = vec![f.clone()];
    while let Some(g) = work.pop() {
        if g.degree() <= 1 {
            if g.degree() == 1 {
                out.push(g);
            }
            continue;
        }
        loop {
            let r = Poly::random(p, 2 * g.degree() - 1, rng);
            let h = r.pow_mod(&half, &g)?;
            let d = Poly::gcd(&g, &(&h - &one))?;
            if d.degree() > 0 && d.degree() < g.degree() {
                work.push(g.div(&d)?);
                work.push(d);
                break;
            }
        }
    }
    Ok(out)
}
