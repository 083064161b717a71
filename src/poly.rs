//! Dense univariate polynomials over [`Zp`].
//!
//! Coefficients are stored in ascending order of degree and trimmed so the
//! leading coefficient is non-zero.  The zero polynomial keeps a single zero
//! coefficient and reports degree 0; interpolation relies on that convention
//! when it reads back degrees after division.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};
use std::sync::Arc;

use num_bigint::BigUint;
use rand::Rng;

use crate::error::ReconError;
use crate::field::Zp;

/// A polynomial with coefficients in a prime field.
#[derive(Clone, PartialEq, Eq)]
pub struct Poly {
    coeffs: Vec<Zp>,
    p: Arc<BigUint>,
}

impl Poly {
    /// Builds a polynomial from ascending coefficients.
    ///
    /// An empty coefficient list yields the zero polynomial.
    pub fn new(p: &Arc<BigUint>, coeffs: Vec<Zp>) -> Self {
        let mut poly = Poly {
            coeffs,
            p: p.clone(),
        };
        if poly.coeffs.is_empty() {
            poly.coeffs.push(Zp::zero(p));
        }
        poly.trim();
        poly
    }

    /// Builds a polynomial from small signed coefficients.
    pub fn from_i64s(p: &Arc<BigUint>, coeffs: &[i64]) -> Self {
        Poly::new(p, coeffs.iter().map(|c| Zp::from_i64(p, *c)).collect())
    }

    /// The zero polynomial.
    pub fn zero(p: &Arc<BigUint>) -> Self {
        Poly::new(p, Vec::new())
    }

    /// A constant polynomial.
    pub fn constant(c: Zp) -> Self {
        let p = c.modulus().clone();
        Poly::new(&p, vec![c])
    }

    /// The monomial `c * z^degree`.
    pub fn term(degree: usize, c: Zp) -> Self {
        let p = c.modulus().clone();
        let mut coeffs = vec![Zp::zero(&p); degree];
        coeffs.push(c);
        Poly::new(&p, coeffs)
    }

    /// A random monic polynomial of the given degree.
    pub fn random<R: Rng + ?Sized>(p: &Arc<BigUint>, degree: usize, rng: &mut R) -> Self {
        let mut coeffs: Vec<Zp> = (0..degree).map(|_| Zp::random(p, rng)).collect();
        coeffs.push(Zp::one(p));
        Poly::new(p, coeffs)
    }

    fn trim(&mut self) {
        while self.coeffs.len() > 1 && self.coeffs.last().is_some_and(Zp::is_zero) {
            self.coeffs.pop();
        }
    }

    /// Index of the highest non-zero coefficient; 0 for the zero polynomial.
    pub fn degree(&self) -> usize {
        self.coeffs.len() - 1
    }

    /// Ascending coefficients.
    pub fn coeffs(&self) -> &[Zp] {
        &self.coeffs
    }

    /// The field modulus of the coefficients.
    pub fn modulus(&self) -> &Arc<BigUint> {
        &self.p
    }

    /// The highest-degree coefficient.
    pub fn leading(&self) -> &Zp {
        &self.coeffs[self.coeffs.len() - 1]
    }

    /// Whether every coefficient is zero.
    pub fn is_zero(&self) -> bool {
        self.degree() == 0 && self.coeffs[0].is_zero()
    }

    /// Whether this is the constant polynomial `c`.
    pub fn is_constant(&self, c: &Zp) -> bool {
        self.degree() == 0 && self.coeffs[0] == *c
    }

    /// Evaluates at `z` by Horner's rule.
    pub fn eval(&self, z: &Zp) -> Zp {
        self.coeffs
            .iter()
            .rev()
            .fold(Zp::zero(&self.p), |acc, c| &(&acc * z) + c)
    }

    /// Scales the polynomial so the leading coefficient is one.
    pub fn monic(&self) -> Result<Poly, ReconError> {
        let inv = self.leading().inv()?;
        Ok(Poly::new(
            &self.p,
            self.coeffs.iter().map(|c| c * &inv).collect(),
        ))
    }

    /// Polynomial long division, returning `(quotient, remainder)`.
    ///
    /// Fails with [`ReconError::DivisionByZero`] when `divisor` is zero.
    pub fn divmod(&self, divisor: &Poly) -> Result<(Poly, Poly), ReconError> {
        if divisor.is_zero() {
            return Err(ReconError::DivisionByZero);
        }
        if self.is_zero() {
            return Ok((Poly::zero(&self.p), Poly::zero(&self.p)));
        }
        if divisor.degree() > self.degree() {
            return Ok((Poly::zero(&self.p), self.clone()));
        }
        let lead_inv = divisor.leading().inv()?;
        let dd = divisor.degree();
        let mut rem = self.coeffs.clone();
        let mut quot = vec![Zp::zero(&self.p); self.degree() - dd + 1];
        for shift in (0..quot.len()).rev() {
            let c = &rem[shift + dd] * &lead_inv;
            if c.is_zero() {
                continue;
            }
            for (i, d) in divisor.coeffs.iter().enumerate() {
                rem[shift + i] = &rem[shift + i] - &(&c * d);
            }
            quot[shift] = c;
        }
        Ok((Poly::new(&self.p, quot), Poly::new(&self.p, rem)))
    }

    /// Quotient of polynomial division.
    pub fn div(&self, divisor: &Poly) -> Result<Poly, ReconError> {
        Ok(self.divmod(divisor)?.0)
    }

    /// Remainder of polynomial division.
    pub fn rem(&self, divisor: &Poly) -> Result<Poly, ReconError> {
        Ok(self.divmod(divisor)?.1)
    }

    /// Monic greatest common divisor by the Euclidean algorithm.
    pub fn gcd(x: &Poly, y: &Poly) -> Result<Poly, ReconError> {
        let (mut a, mut b) = (x.clone(), y.clone());
        while !b.is_zero() {
            let r = a.rem(&b)?;
            a = b;
            b = r;
        }
        a.monic()
    }

    /// Computes `self^n mod m` by square and multiply.
    ///
    /// Exponents below 4 are rejected with [`ReconError::PowModSmallN`];
    /// reconciliation never needs them.
    pub fn pow_mod(&self, n: &BigUint, m: &Poly) -> Result<Poly, ReconError> {
        if n.bits() < 3 {
            return Err(ReconError::PowModSmallN);
        }
        let mut base = self.rem(m)?;
        let mut acc = Poly::constant(Zp::one(&self.p));
        let bits = n.bits();
        for i in 0..bits {
            if n.bit(i) {
                acc = (&acc * &base).rem(m)?;
            }
            if i + 1 < bits {
                base = (&base * &base).rem(m)?;
            }
        }
        Ok(acc)
    }

    /// Formal derivative.
    pub fn derivative(&self) -> Poly {
        let coeffs = self
            .coeffs
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, c)| c * &Zp::from_i64(&self.p, i as i64))
            .collect();
        Poly::new(&self.p, coeffs)
    }

    fn check_modulus(&self, other: &Poly) {
        assert!(
            Arc::ptr_eq(&self.p, &other.p) || self.p == other.p,
            "mismatched polynomial fields: {} vs {}",
            self.p,
            other.p
        );
    }
}

impl<'a> Add<&'a Poly> for &'a Poly {
    type Output = Poly;

    fn add(self, rhs: &'a Poly) -> Poly {
        self.check_modulus(rhs);
        let n = self.coeffs.len().max(rhs.coeffs.len());
        let zero = Zp::zero(&self.p);
        let coeffs = (0..n)
            .map(|i| {
                let a = self.coeffs.get(i).unwrap_or(&zero);
                let b = rhs.coeffs.get(i).unwrap_or(&zero);
                a + b
            })
            .collect();
        Poly::new(&self.p, coeffs)
    }
}

impl<'a> Sub<&'a Poly> for &'a Poly {
    type Output = Poly;

    fn sub(self, rhs: &'a Poly) -> Poly {
        self + &(-rhs)
    }
}

impl<'a> Mul<&'a Poly> for &'a Poly {
    type Output = Poly;

    fn mul(self, rhs: &'a Poly) -> Poly {
        self.check_modulus(rhs);
        let mut coeffs = vec![Zp::zero(&self.p); self.coeffs.len() + rhs.coeffs.len() - 1];
        for (i, a) in self.coeffs.iter().enumerate() {
            if a.is_zero() {
                continue;
            }
            for (j, b) in rhs.coeffs.iter().enumerate() {
                coeffs[i + j] = &coeffs[i + j] + &(a * b);
            }
        }
        Poly::new(&self.p, coeffs)
    }
}

impl Neg for &Poly {
    type Output = Poly;

    fn neg(self) -> Poly {
        Poly::new(&self.p, self.coeffs.iter().map(|c| -c).collect())
    }
}

impl fmt::Display for Poly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (i, c) in self.coeffs.iter().enumerate().rev() {
            if c.is_zero() {
                continue;
            }
            if !first {
                f.write_str(" + ")?;
            }
            first = false;
            write!(f, "{c}")?;
            if i > 0 {
                write!(f, "z^{i}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Poly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Poly({self})")
    }
}
