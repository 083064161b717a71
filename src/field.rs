//! Prime field arithmetic.
//!
//! This module provides arithmetic in the prime field used by the
//! reconciliation engine.  The [`Zp`](struct.Zp.html) type pairs an integer
//! with a shared modulus and exposes addition, subtraction, multiplication,
//! exponentiation and inversion.  All operations reduce their results modulo
//! the field modulus.  Element identifiers and prefix tree aggregates all
//! live in this field; SKS peers use [`p_sks`].

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Mul, Neg, Sub};
use std::sync::{Arc, OnceLock};

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::Rng;

use crate::error::ReconError;

/// Decimal form of the SKS reconciliation prime.
pub const P_SKS_DECIMAL: &str = "530512889551602322505127520352579437339";

/// Little-endian 32-bit digits of [`P_SKS_DECIMAL`].
const P_SKS_DIGITS: [u32; 5] = [0x30a5_431b, 0xc91f_85d9, 0x878b_1fdf, 0x8f1d_10e4, 0x1];

/// Returns the shared SKS prime (129 bits, 17 bytes encoded).
pub fn p_sks() -> Arc<BigUint> {
    static P: OnceLock<Arc<BigUint>> = OnceLock::new();
    P.get_or_init(|| Arc::new(BigUint::from_slice(&P_SKS_DIGITS)))
        .clone()
}

/// Number of bytes needed to encode any element modulo `p`.
pub fn byte_len(p: &BigUint) -> usize {
    ((p.bits() + 7) / 8) as usize
}

/// An element of the prime field defined by its modulus.
///
/// Arithmetic between elements of different moduli is a programming error
/// and panics immediately rather than producing a meaningless value.
#[derive(Clone)]
pub struct Zp {
    n: BigUint,
    p: Arc<BigUint>,
}

impl Zp {
    /// Creates an element, reducing `n` modulo `p`.
    pub fn new(p: &Arc<BigUint>, n: BigUint) -> Self {
        let n = if n < **p { n } else { n % p.as_ref() };
        Zp { n, p: p.clone() }
    }

    /// Creates an element from a signed machine integer.
    pub fn from_i64(p: &Arc<BigUint>, v: i64) -> Self {
        let mag = BigUint::from(v.unsigned_abs()) % p.as_ref();
        let n = if v < 0 && !mag.is_zero() {
            p.as_ref() - mag
        } else {
            mag
        };
        Zp { n, p: p.clone() }
    }

    /// Parses a decimal string, accepting a leading `-`.
    pub fn parse(p: &Arc<BigUint>, s: &str) -> Option<Self> {
        let (neg, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let n = BigUint::parse_bytes(digits.as_bytes(), 10)?;
        let z = Zp::new(p, n);
        Some(if neg { -&z } else { z })
    }

    /// The additive identity.
    pub fn zero(p: &Arc<BigUint>) -> Self {
        Zp {
            n: BigUint::zero(),
            p: p.clone(),
        }
    }

    /// The multiplicative identity.
    pub fn one(p: &Arc<BigUint>) -> Self {
        Zp {
            n: BigUint::one(),
            p: p.clone(),
        }
    }

    /// Draws an element uniformly from `[0, p)`.
    pub fn random<R: Rng + ?Sized>(p: &Arc<BigUint>, rng: &mut R) -> Self {
        Zp {
            n: rng.gen_biguint_below(p),
            p: p.clone(),
        }
    }

    /// Decodes a little-endian byte string, reducing modulo `p`.
    pub fn from_bytes(p: &Arc<BigUint>, bytes: &[u8]) -> Self {
        Zp::new(p, BigUint::from_bytes_le(bytes))
    }

    /// Encodes the element as little-endian bytes padded to [`byte_len`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.n.to_bytes_le();
        out.resize(byte_len(&self.p), 0);
        out
    }

    /// Returns the canonical representative in `[0, p)`.
    #[inline]
    pub fn value(&self) -> &BigUint {
        &self.n
    }

    /// Returns the modulus of the field.
    #[inline]
    pub fn modulus(&self) -> &Arc<BigUint> {
        &self.p
    }

    /// Whether this is the additive identity.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.n.is_zero()
    }

    /// Whether this is the multiplicative identity.
    #[inline]
    pub fn is_one(&self) -> bool {
        self.n.is_one()
    }

    /// Exponentiates by `e` modulo `p`.
    pub fn pow(&self, e: &BigUint) -> Zp {
        Zp {
            n: self.n.modpow(e, &self.p),
            p: self.p.clone(),
        }
    }

    /// Computes the multiplicative inverse.
    ///
    /// Returns [`ReconError::DivisionByZero`] for the zero element.
    pub fn inv(&self) -> Result<Zp, ReconError> {
        if self.n.is_zero() {
            return Err(ReconError::DivisionByZero);
        }
        // Fermat: a^(p-2) mod p
        let e = self.p.as_ref() - BigUint::from(2u32);
        Ok(self.pow(&e))
    }

    /// Divides `self` by `rhs`.
    pub fn div(&self, rhs: &Zp) -> Result<Zp, ReconError> {
        self.check_modulus(rhs);
        Ok(self * &rhs.inv()?)
    }

    /// Panics unless both operands share a modulus.
    #[inline]
    fn check_modulus(&self, other: &Zp) {
        assert!(
            Arc::ptr_eq(&self.p, &other.p) || self.p == other.p,
            "mismatched field moduli: {} vs {}",
            self.p,
            other.p
        );
    }
}

impl<'a> Add<&'a Zp> for &'a Zp {
    type Output = Zp;

    fn add(self, rhs: &'a Zp) -> Zp {
        self.check_modulus(rhs);
        let mut n = &self.n + &rhs.n;
        if n >= *self.p {
            n -= self.p.as_ref();
        }
        Zp {
            n,
            p: self.p.clone(),
        }
    }
}

impl<'a> Sub<&'a Zp> for &'a Zp {
    type Output = Zp;

    fn sub(self, rhs: &'a Zp) -> Zp {
        self.check_modulus(rhs);
        let n = if self.n >= rhs.n {
            &self.n - &rhs.n
        } else {
            self.p.as_ref() - (&rhs.n - &self.n)
        };
        Zp {
            n,
            p: self.p.clone(),
        }
    }
}

impl<'a> Mul<&'a Zp> for &'a Zp {
    type Output = Zp;

    fn mul(self, rhs: &'a Zp) -> Zp {
        self.check_modulus(rhs);
        Zp {
            n: (&self.n * &rhs.n) % self.p.as_ref(),
            p: self.p.clone(),
        }
    }
}

impl Neg for &Zp {
    type Output = Zp;

    fn neg(self) -> Zp {
        let n = if self.n.is_zero() {
            BigUint::zero()
        } else {
            self.p.as_ref() - &self.n
        };
        Zp {
            n,
            p: self.p.clone(),
        }
    }
}

impl Neg for Zp {
    type Output = Zp;

    fn neg(self) -> Zp {
        -&self
    }
}

macro_rules! forward_owned_binop {
    ($($tr:ident :: $method:ident),*) => {
        $(impl $tr<Zp> for Zp {
            type Output = Zp;

            fn $method(self, rhs: Zp) -> Zp {
                (&self).$method(&rhs)
            }
        })*
    };
}

forward_owned_binop!(Add::add, Sub::sub, Mul::mul);

impl PartialEq for Zp {
    fn eq(&self, other: &Self) -> bool {
        self.n == other.n && (Arc::ptr_eq(&self.p, &other.p) || self.p == other.p)
    }
}

impl Eq for Zp {}

impl Hash for Zp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.n.hash(state);
    }
}

impl PartialOrd for Zp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Zp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.n.cmp(&other.n)
    }
}

impl fmt::Display for Zp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.n)
    }
}

impl fmt::Debug for Zp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Zp({})", self.n)
    }
}

/// Returns the first `n` evaluation points `0, -1, 1, -2, 2, ...`.
pub fn zpoints(p: &Arc<BigUint>, n: usize) -> Vec<Zp> {
    (0..n)
        .map(|i| {
            let k = ((i + 1) / 2) as i64;
            if i % 2 == 0 {
                Zp::from_i64(p, k)
            } else {
                Zp::from_i64(p, -k)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small() -> Arc<BigUint> {
        Arc::new(BigUint::from(97u32))
    }

    #[test]
    fn test_p_sks_matches_decimal() {
        let p = p_sks();
        assert_eq!(p.to_string(), P_SKS_DECIMAL);
        assert_eq!(p.bits(), 129);
        assert_eq!(byte_len(&p), 17);
    }

    #[test]
    fn test_small_field_arithmetic() {
        let p = small();
        let a = Zp::from_i64(&p, 50);
        let b = Zp::from_i64(&p, 60);
        assert_eq!(&a + &b, Zp::from_i64(&p, 13));
        assert_eq!(&a - &b, Zp::from_i64(&p, 87));
        assert_eq!(&a * &b, Zp::from_i64(&p, 3000 % 97));
        assert_eq!(-&a, Zp::from_i64(&p, 47));
        assert_eq!(Zp::from_i64(&p, -1), Zp::from_i64(&p, 96));
    }

    #[test]
    fn test_inverse_and_division() {
        let p = small();
        let a = Zp::from_i64(&p, 13);
        let inv = a.inv().unwrap();
        assert!((&a * &inv).is_one());
        let q = Zp::from_i64(&p, 26).div(&a).unwrap();
        assert_eq!(q, Zp::from_i64(&p, 2));
        assert_eq!(Zp::zero(&p).inv(), Err(ReconError::DivisionByZero));
        assert_eq!(a.div(&Zp::zero(&p)), Err(ReconError::DivisionByZero));
    }

    #[test]
    #[should_panic(expected = "mismatched field moduli")]
    fn test_mismatched_moduli_panics() {
        let a = Zp::from_i64(&small(), 3);
        let b = Zp::from_i64(&p_sks(), 3);
        let _ = &a + &b;
    }

    #[test]
    fn test_bytes_are_little_endian_fixed_width() {
        let p = p_sks();
        let z = Zp::from_i64(&p, 0x0102);
        let bytes = z.to_bytes();
        assert_eq!(bytes.len(), 17);
        assert_eq!(&bytes[..3], &[0x02, 0x01, 0x00]);
        assert_eq!(Zp::from_bytes(&p, &bytes), z);
    }

    #[test]
    fn test_zpoints_alternate() {
        let p = small();
        let pts: Vec<String> = zpoints(&p, 5).iter().map(|z| z.to_string()).collect();
        assert_eq!(pts, vec!["0", "96", "1", "95", "2"]);
    }

    #[test]
    fn test_parse_negative() {
        let p = p_sks();
        let z = Zp::parse(&p, "-1").unwrap();
        assert_eq!(z.to_string(), "530512889551602322505127520352579437338");
        assert!(Zp::parse(&p, "12x").is_none());
    }

    proptest! {
        #[test]
        fn prop_inverse_roundtrip(v in 1u64..u64::MAX) {
            let p = p_sks();
            let z = Zp::new(&p, BigUint::from(v));
            let inv = z.inv().unwrap();
            prop_assert!((&z * &inv).is_one());
        }

        #[test]
        fn prop_sub_then_add(a in any::<u64>(), b in any::<u64>()) {
            let p = p_sks();
            let za = Zp::new(&p, BigUint::from(a));
            let zb = Zp::new(&p, BigUint::from(b));
            prop_assert_eq!(&(&za - &zb) + &zb, za);
        }
    }
}
