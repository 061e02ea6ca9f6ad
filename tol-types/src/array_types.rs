use core::borrow::Borrow;
use core::convert::TryFrom;
use core::fmt;
use core::ops::Deref;
use core::str;

use crate::error::AddressError;

macro_rules! key {
    ($i:ident) => {
        #[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        /// TOL engine atomic array type.
        #[repr(transparent)]
        pub struct $i([u8; 32]);

        impl $i {
            /// Memory length of the type.
            pub const LEN: usize = 32;

            /// Bytes constructor.
            pub const fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Zeroes bytes constructor.
            pub const fn zeroed() -> $i {
                $i([0; 32])
            }

            /// Right-align up to 32 bytes into a fresh value; `None` when
            /// the slice is longer than 32 bytes.
            pub fn right_aligned(bytes: &[u8]) -> Option<Self> {
                if bytes.len() > Self::LEN {
                    return None;
                }
                let mut out = [0u8; 32];
                out[Self::LEN - bytes.len()..].copy_from_slice(bytes);
                Some(Self(out))
            }

            /// The memory size of the type by the method.
            pub const fn size(&self) -> usize {
                Self::LEN
            }
        }

        impl Deref for $i {
            type Target = [u8; 32];

            fn deref(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl Borrow<[u8; 32]> for $i {
            fn borrow(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl AsRef<[u8]> for $i {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $i {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl From<$i> for [u8; 32] {
            fn from(value: $i) -> [u8; 32] {
                value.0
            }
        }

        impl TryFrom<&[u8]> for $i {
            type Error = core::array::TryFromSliceError;

            fn try_from(bytes: &[u8]) -> Result<$i, Self::Error> {
                <[u8; 32]>::try_from(bytes).map(|b| b.into())
            }
        }

        impl fmt::LowerHex for $i {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if f.alternate() {
                    write!(f, "0x")?
                }
                self.0.iter().try_for_each(|b| write!(f, "{:02x}", b))
            }
        }

        impl fmt::Debug for $i {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($i), "({:#x})"), self)
            }
        }

        impl fmt::Display for $i {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self)
            }
        }
    };
}

key!(Bytes32);
key!(Address);

impl Bytes32 {
    /// Hex rendering with the `0x` prefix, always 64 nibbles.
    pub fn to_hex(&self) -> String {
        format!("{:#x}", self)
    }
}

impl Address {
    /// Parse a `0x`-prefixed hex literal of at most 64 nibbles,
    /// normalizing to the 32-byte right-aligned form. Both nibble cases are
    /// accepted; the canonical rendering is lowercase.
    pub fn parse(src: &str) -> Result<Self, AddressError> {
        let digits = src
            .strip_prefix("0x")
            .or_else(|| src.strip_prefix("0X"))
            .ok_or(AddressError::MissingPrefix)?;
        if digits.len() > 64 {
            return Err(AddressError::TooLong);
        }
        if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(AddressError::InvalidHex(bad));
        }
        // Odd-length literals get an implicit leading zero nibble.
        let padded = if digits.len() % 2 == 1 {
            format!("0{digits}")
        } else {
            digits.to_string()
        };
        let bytes = hex::decode(padded).expect("validated hex");
        Ok(Self::right_aligned(&bytes).expect("length checked"))
    }

    /// Canonical textual form: `0x` plus 64 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        format!("{:#x}", self)
    }
}

impl str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_normalizes_to_lowercase_right_aligned() {
        let a = Address::parse("0xAB").unwrap();
        assert_eq!(
            a.to_hex(),
            "0x00000000000000000000000000000000000000000000000000000000000000ab"
        );
        assert_eq!(a.to_hex().len(), 66);
    }

    #[test]
    fn address_accepts_odd_nibble_counts() {
        let a = Address::parse("0xabc").unwrap();
        assert!(a.to_hex().ends_with("0abc"));
    }

    #[test]
    fn address_rejects_bad_literals() {
        assert_eq!(Address::parse("ab"), Err(AddressError::MissingPrefix));
        assert_eq!(Address::parse("0xzz"), Err(AddressError::InvalidHex('z')));
        let long = format!("0x{}", "0".repeat(65));
        assert_eq!(Address::parse(&long), Err(AddressError::TooLong));
    }

    #[test]
    fn bytes32_right_alignment() {
        let b = Bytes32::right_aligned(&[1, 2]).unwrap();
        assert_eq!(b[30], 1);
        assert_eq!(b[31], 2);
        assert!(Bytes32::right_aligned(&[0; 33]).is_none());
    }
}
