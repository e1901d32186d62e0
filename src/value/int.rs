//! 256-bit unsigned integer with wrapping arithmetic.

use super::TAG_INT;
use crate::transcript::{Hash256, Transcript};
use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use once_cell::sync::{Lazy, OnceCell};
use std::cmp::Ordering;
use std::fmt;

static MODULUS: Lazy<BigUint> = Lazy::new(|| BigUint::one() << 256u32);
static MAX: Lazy<BigUint> = Lazy::new(|| &*MODULUS - BigUint::one());

/// Unsigned integer reduced modulo 2^256 after every operation.
#[derive(Clone, Default)]
pub struct Uint256 {
    value: BigUint,
    hash: OnceCell<Hash256>,
}

impl Uint256 {
    fn wrap(value: BigUint) -> Self {
        Self {
            value,
            hash: OnceCell::new(),
        }
    }

    /// `H(0 ‖ be32)`, computed once per integer.
    pub fn value_hash(&self) -> Hash256 {
        *self
            .hash
            .get_or_init(|| Transcript::new(TAG_INT).absorb(&self.to_be_bytes()).finalize())
    }

    pub fn zero() -> Self {
        Self::wrap(BigUint::zero())
    }

    pub fn one() -> Self {
        Self::wrap(BigUint::one())
    }

    pub fn max_value() -> Self {
        Self::wrap(MAX.clone())
    }

    pub fn from_u64(value: u64) -> Self {
        Self::wrap(BigUint::from(value))
    }

    fn reduce(value: BigUint) -> Self {
        if value < *MODULUS {
            Self::wrap(value)
        } else {
            Self::wrap(value % &*MODULUS)
        }
    }

    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        Self::wrap(BigUint::from_bytes_be(bytes))
    }

    /// Interprets up to 32 big-endian bytes; longer input keeps the low 32.
    pub fn from_be_slice(bytes: &[u8]) -> Self {
        Self::reduce(BigUint::from_bytes_be(bytes))
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let raw = self.value.to_bytes_be();
        let mut out = [0u8; 32];
        out[32 - raw.len()..].copy_from_slice(&raw);
        out
    }

    pub fn to_u64(&self) -> Option<u64> {
        self.value.to_u64()
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    pub fn wrapping_add(&self, other: &Self) -> Self {
        Self::reduce(&self.value + &other.value)
    }

    pub fn wrapping_sub(&self, other: &Self) -> Self {
        if self.value >= other.value {
            Self::wrap(&self.value - &other.value)
        } else {
            Self::wrap(&*MODULUS - &other.value + &self.value)
        }
    }

    pub fn wrapping_mul(&self, other: &Self) -> Self {
        Self::reduce(&self.value * &other.value)
    }

    pub fn wrapping_pow(&self, exponent: &Self) -> Self {
        Self::wrap(self.value.modpow(&exponent.value, &MODULUS))
    }

    pub fn checked_div(&self, other: &Self) -> Option<Self> {
        if other.is_zero() {
            None
        } else {
            Some(Self::wrap(&self.value / &other.value))
        }
    }

    pub fn checked_rem(&self, other: &Self) -> Option<Self> {
        if other.is_zero() {
            None
        } else {
            Some(Self::wrap(&self.value % &other.value))
        }
    }

    pub fn bitand(&self, other: &Self) -> Self {
        Self::wrap(&self.value & &other.value)
    }

    pub fn bitor(&self, other: &Self) -> Self {
        Self::wrap(&self.value | &other.value)
    }

    pub fn bitxor(&self, other: &Self) -> Self {
        Self::wrap(&self.value ^ &other.value)
    }

    pub fn not(&self) -> Self {
        Self::wrap(&*MAX ^ &self.value)
    }

    /// Shift left, dropping bits above 2^256. Shifts of 256 or more yield zero.
    pub fn shl(&self, shift: &Self) -> Self {
        match shift.to_u64() {
            Some(s) if s < 256 => Self::reduce(&self.value << s),
            _ => Self::zero(),
        }
    }

    pub fn shr(&self, shift: &Self) -> Self {
        match shift.to_u64() {
            Some(s) if s < 256 => Self::wrap(&self.value >> s),
            _ => Self::zero(),
        }
    }

    /// Byte `index` counted from the most significant end; zero past 31.
    pub fn byte(&self, index: &Self) -> Self {
        match index.to_u64() {
            Some(i) if i < 32 => Self::from_u64(self.to_be_bytes()[i as usize] as u64),
            _ => Self::zero(),
        }
    }
}

impl PartialEq for Uint256 {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Uint256 {}

impl PartialOrd for Uint256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Uint256 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl std::hash::Hash for Uint256 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl From<u64> for Uint256 {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl fmt::Debug for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl fmt::Display for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_wraps_at_modulus() {
        let max = Uint256::max_value();
        assert_eq!(max.wrapping_add(&Uint256::one()), Uint256::zero());
        assert_eq!(
            max.wrapping_add(&Uint256::from_u64(5)),
            Uint256::from_u64(4)
        );
    }

    #[test]
    fn sub_wraps_below_zero() {
        let r = Uint256::from_u64(3).wrapping_sub(&Uint256::from_u64(5));
        assert_eq!(r, Uint256::max_value().wrapping_sub(&Uint256::one()));
    }

    #[test]
    fn mul_and_pow_wrap() {
        let two = Uint256::from_u64(2);
        assert_eq!(two.wrapping_pow(&Uint256::from_u64(256)), Uint256::zero());
        assert_eq!(
            two.wrapping_pow(&Uint256::from_u64(255)).wrapping_mul(&two),
            Uint256::zero()
        );
    }

    #[test]
    fn division_by_zero_is_none() {
        assert_eq!(Uint256::from_u64(7).checked_div(&Uint256::zero()), None);
        assert_eq!(Uint256::from_u64(7).checked_rem(&Uint256::zero()), None);
        assert_eq!(
            Uint256::from_u64(7).checked_rem(&Uint256::from_u64(4)),
            Some(Uint256::from_u64(3))
        );
    }

    #[test]
    fn bytes_round_trip_and_byte_extraction() {
        let n = Uint256::from_u64(0x0102);
        let bytes = n.to_be_bytes();
        assert_eq!(bytes[30], 0x01);
        assert_eq!(bytes[31], 0x02);
        assert_eq!(Uint256::from_be_bytes(&bytes), n);
        assert_eq!(n.byte(&Uint256::from_u64(30)), Uint256::from_u64(1));
        assert_eq!(n.byte(&Uint256::from_u64(32)), Uint256::zero());
    }

    #[test]
    fn value_hash_is_cached_and_survives_clone() {
        let n = Uint256::from_u64(42);
        assert!(n.hash.get().is_none());
        let h = n.value_hash();
        assert_eq!(n.hash.get(), Some(&h));
        let copy = n.clone();
        assert_eq!(copy.hash.get(), Some(&h));
        // The cache takes no part in comparisons.
        assert_eq!(copy, Uint256::from_u64(42));
        assert_eq!(h, crate::value::Value::int(42).hash());
    }

    #[test]
    fn shifts_and_not() {
        let one = Uint256::one();
        assert_eq!(one.shl(&Uint256::from_u64(255)).shr(&Uint256::from_u64(255)), one);
        assert_eq!(one.shl(&Uint256::from_u64(256)), Uint256::zero());
        assert_eq!(Uint256::zero().not(), Uint256::max_value());
    }
}
