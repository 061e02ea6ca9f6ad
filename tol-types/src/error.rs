use thiserror::Error;

/// Rejection reasons for numeric literals and conversions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NumberError {
    /// The literal is empty.
    #[error("empty numeric literal")]
    Empty,
    /// The literal contains a fractional part or an exponent.
    #[error("float literals are not supported")]
    Float,
    /// The literal is negative.
    #[error("negative numeric literal")]
    Negative,
    /// A digit is not valid for the requested base.
    #[error("invalid digit '{0}' for base {1}")]
    InvalidDigit(char, u32),
    /// The value exceeds `2^256 - 1`.
    #[error("numeric literal exceeds 2^256 - 1")]
    Overflow,
    /// The requested base is outside `[2, 36]`.
    #[error("numeric base {0} is outside [2, 36]")]
    BadRadix(u32),
}

/// Rejection reasons for address literals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The literal does not start with `0x`.
    #[error("address literal must start with 0x")]
    MissingPrefix,
    /// The literal contains a non-hex character.
    #[error("invalid hex character '{0}' in address literal")]
    InvalidHex(char),
    /// The literal encodes more than 32 bytes.
    #[error("address literal exceeds 32 bytes")]
    TooLong,
}
