use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;

use ethnum::U256;

use crate::error::NumberError;

/// Canonical unsigned 256-bit integer.
///
/// All arithmetic wraps modulo `2^256`; division and modulo by zero are not
/// representable here and surface as `None` so the caller can raise the
/// precise runtime error. `Display` renders the canonical shortest decimal
/// form, which is also what [`FromStr`] accepts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct Uint256(U256);

impl Uint256 {
    /// The additive identity.
    pub const ZERO: Self = Self(U256::ZERO);
    /// The multiplicative identity.
    pub const ONE: Self = Self(U256::ONE);
    /// `2^256 - 1`, the all-ones word.
    pub const MAX: Self = Self(U256::MAX);

    /// Width of the type in bits.
    pub const BITS: u32 = 256;

    /// Construct from a native word.
    pub const fn from_u64(value: u64) -> Self {
        Self(U256::new(value as u128))
    }

    /// Parse a literal in the given base, `2..=36`.
    ///
    /// Rejects empty input, signs, fractional parts, exponents, and values
    /// greater than `2^256 - 1`. Digits beyond `9` are accepted in either
    /// case.
    pub fn from_str_radix(src: &str, radix: u32) -> Result<Self, NumberError> {
        if !(2..=36).contains(&radix) {
            return Err(NumberError::BadRadix(radix));
        }
        if src.is_empty() {
            return Err(NumberError::Empty);
        }
        if src.starts_with('-') {
            return Err(NumberError::Negative);
        }
        // A '.' can never be a digit, so it is reported as a float marker
        // rather than a generic bad digit.
        if src.contains('.') {
            return Err(NumberError::Float);
        }
        let mut value = U256::ZERO;
        let base = U256::new(radix as u128);
        for ch in src.chars() {
            let digit = ch
                .to_digit(radix)
                .ok_or(NumberError::InvalidDigit(ch, radix))?;
            value = value
                .checked_mul(base)
                .and_then(|v| v.checked_add(U256::new(digit as u128)))
                .ok_or(NumberError::Overflow)?;
        }
        Ok(Self(value))
    }

    /// Parse a decimal literal, rejecting the float forms of the surface
    /// language with a dedicated error.
    pub fn from_decimal(src: &str) -> Result<Self, NumberError> {
        if src.contains(['.', 'e', 'E']) {
            return Err(NumberError::Float);
        }
        Self::from_str_radix(src, 10)
    }

    /// Parse a `0x`-prefixed hexadecimal literal.
    pub fn from_hex(src: &str) -> Result<Self, NumberError> {
        let digits = src
            .strip_prefix("0x")
            .or_else(|| src.strip_prefix("0X"))
            .unwrap_or(src);
        Self::from_str_radix(digits, 16)
    }

    /// Parse a source literal: `0x` selects hexadecimal, anything else is
    /// decimal.
    pub fn from_literal(src: &str) -> Result<Self, NumberError> {
        if src.starts_with("0x") || src.starts_with("0X") {
            Self::from_hex(src)
        } else {
            Self::from_decimal(src)
        }
    }

    /// Whether the value is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == U256::ZERO
    }

    /// Truncate to a native word, if the value fits.
    pub fn to_u64(&self) -> Option<u64> {
        if self.0 > U256::new(u64::MAX as u128) {
            None
        } else {
            Some(self.0.as_u64())
        }
    }

    /// Big-endian byte representation.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    /// Construct from big-endian bytes.
    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(U256::from_be_bytes(bytes))
    }

    /// Addition modulo `2^256`.
    pub fn wrapping_add(self, rhs: Self) -> Self {
        Self(self.0.wrapping_add(rhs.0))
    }

    /// Subtraction modulo `2^256`.
    pub fn wrapping_sub(self, rhs: Self) -> Self {
        Self(self.0.wrapping_sub(rhs.0))
    }

    /// Multiplication modulo `2^256`.
    pub fn wrapping_mul(self, rhs: Self) -> Self {
        Self(self.0.wrapping_mul(rhs.0))
    }

    /// Truncating division; `None` when the divisor is zero.
    ///
    /// Operands are unsigned, so truncation toward zero and flooring
    /// coincide and this also implements floor-division.
    pub fn checked_div(self, rhs: Self) -> Option<Self> {
        self.0.checked_div(rhs.0).map(Self)
    }

    /// Remainder; `None` when the divisor is zero.
    pub fn checked_rem(self, rhs: Self) -> Option<Self> {
        self.0.checked_rem(rhs.0).map(Self)
    }

    /// Exponentiation modulo `2^256` by square-and-multiply.
    pub fn wrapping_pow(self, exp: Self) -> Self {
        let mut result = U256::ONE;
        let mut base = self.0;
        let mut exp = exp.0;
        while exp != U256::ZERO {
            if exp & U256::ONE == U256::ONE {
                result = result.wrapping_mul(base);
            }
            base = base.wrapping_mul(base);
            exp >>= 1;
        }
        Self(result)
    }

    /// Bitwise conjunction.
    pub fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }

    /// Bitwise disjunction.
    pub fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }

    /// Bitwise exclusive or.
    pub fn bitxor(self, rhs: Self) -> Self {
        Self(self.0 ^ rhs.0)
    }

    /// 256-bit complement.
    pub fn bitnot(self) -> Self {
        Self(!self.0)
    }

    /// Logical left shift; amounts of 256 or more produce zero.
    pub fn shl(self, amount: Self) -> Self {
        match amount.to_u64() {
            Some(n) if n < 256 => Self(self.0 << n as u32),
            _ => Self::ZERO,
        }
    }

    /// Logical right shift, zero-filling; amounts of 256 or more produce
    /// zero.
    pub fn shr(self, amount: Self) -> Self {
        match amount.to_u64() {
            Some(n) if n < 256 => Self(self.0 >> n as u32),
            _ => Self::ZERO,
        }
    }

    /// Numeric ordering, explicit form for operator dispatch sites.
    pub fn compare(&self, rhs: &Self) -> Ordering {
        self.0.cmp(&rhs.0)
    }
}

impl fmt::Display for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ethnum renders the shortest decimal form with no leading zeros,
        // which is exactly the canonical form.
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uint256 {
    type Err = NumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_decimal(s)
    }
}

impl From<u64> for Uint256 {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl From<bool> for Uint256 {
    fn from(value: bool) -> Self {
        if value {
            Self::ONE
        } else {
            Self::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn n(s: &str) -> Uint256 {
        Uint256::from_decimal(s).expect("literal")
    }

    #[test]
    fn parse_canonical_round_trip() {
        for s in ["0", "1", "514", "1000000000000000000000000000000000000000"] {
            assert_eq!(n(s).to_string(), s);
        }
    }

    #[test]
    fn parse_rejects_noncanonical_inputs() {
        assert_eq!(Uint256::from_decimal(""), Err(NumberError::Empty));
        assert_eq!(Uint256::from_decimal("1.5"), Err(NumberError::Float));
        assert_eq!(Uint256::from_decimal("1e5"), Err(NumberError::Float));
        assert_eq!(Uint256::from_decimal("-1"), Err(NumberError::Negative));
        assert_eq!(
            Uint256::from_decimal("x"),
            Err(NumberError::InvalidDigit('x', 10))
        );
        // 2^256 exactly is one past MAX
        let too_big =
            "115792089237316195423570985008687907853269984665640564039457584007913129639936";
        assert_eq!(Uint256::from_decimal(too_big), Err(NumberError::Overflow));
    }

    #[test]
    fn parse_max_value() {
        let max =
            "115792089237316195423570985008687907853269984665640564039457584007913129639935";
        assert_eq!(n(max), Uint256::MAX);
        assert_eq!(n(max).to_string(), max);
    }

    #[test]
    fn hex_and_radix_parsing() {
        assert_eq!(Uint256::from_hex("0xff").unwrap(), n("255"));
        assert_eq!(Uint256::from_literal("0xF0").unwrap(), n("240"));
        assert_eq!(Uint256::from_str_radix("101", 2).unwrap(), n("5"));
        assert_eq!(Uint256::from_str_radix("zz", 36).unwrap(), n("1295"));
        assert_eq!(
            Uint256::from_str_radix("1", 37),
            Err(NumberError::BadRadix(37))
        );
    }

    #[test]
    fn wrapping_boundaries() {
        assert_eq!(Uint256::MAX.wrapping_add(Uint256::ONE), Uint256::ZERO);
        assert_eq!(Uint256::ZERO.wrapping_sub(Uint256::ONE), Uint256::MAX);
        assert_eq!(
            Uint256::MAX.wrapping_mul(Uint256::from_u64(2)),
            Uint256::MAX.wrapping_sub(Uint256::ONE)
        );
    }

    #[test]
    fn division_by_zero_is_none() {
        assert_eq!(Uint256::ONE.checked_div(Uint256::ZERO), None);
        assert_eq!(Uint256::ONE.checked_rem(Uint256::ZERO), None);
    }

    #[test]
    fn pow_wraps() {
        assert_eq!(
            Uint256::from_u64(2).wrapping_pow(Uint256::from_u64(8)),
            n("256")
        );
        assert_eq!(
            Uint256::from_u64(2).wrapping_pow(Uint256::from_u64(256)),
            Uint256::ZERO
        );
        assert_eq!(Uint256::ZERO.wrapping_pow(Uint256::ZERO), Uint256::ONE);
    }

    #[test]
    fn shifts_saturate_at_width() {
        assert_eq!(Uint256::ONE.shl(Uint256::from_u64(8)), n("256"));
        assert_eq!(Uint256::MAX.shl(Uint256::from_u64(256)), Uint256::ZERO);
        assert_eq!(Uint256::MAX.shr(Uint256::from_u64(256)), Uint256::ZERO);
        assert_eq!(Uint256::MAX.shr(Uint256::MAX), Uint256::ZERO);
        assert_eq!(n("256").shr(Uint256::from_u64(8)), Uint256::ONE);
    }

    #[quickcheck]
    fn add_commutes(a: u64, b: u64) -> bool {
        let (a, b) = (Uint256::from_u64(a), Uint256::from_u64(b));
        a.wrapping_add(b) == b.wrapping_add(a)
    }

    #[quickcheck]
    fn mul_commutes(a: u64, b: u64) -> bool {
        let (a, b) = (Uint256::from_u64(a), Uint256::from_u64(b));
        a.wrapping_mul(b) == b.wrapping_mul(a)
    }

    #[quickcheck]
    fn sub_self_is_zero(a: u64) -> bool {
        let a = Uint256::from_u64(a);
        a.wrapping_sub(a) == Uint256::ZERO
    }

    #[quickcheck]
    fn div_by_one_is_identity(a: u64) -> bool {
        let a = Uint256::from_u64(a);
        a.checked_div(Uint256::ONE) == Some(a)
    }

    #[quickcheck]
    fn and_with_all_ones_is_identity(a: u64) -> bool {
        let a = Uint256::from_u64(a);
        a.bitand(Uint256::ZERO.bitnot()) == a
    }

    #[quickcheck]
    fn parse_of_display_round_trips(a: u64) -> bool {
        let a = Uint256::from_u64(a).wrapping_mul(Uint256::from_u64(a));
        Uint256::from_decimal(&a.to_string()) == Ok(a)
    }
}
