use sha2::Sha256;
use sha3::{Digest, Keccak256};
use tol_types::Bytes32;

/// SHA-256 digest of the provided data; guards the integrity of a
/// bytecode container payload.
pub fn sha256<B>(data: B) -> Bytes32
where
    B: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    hasher.update(data);
    <[u8; Bytes32::LEN]>::from(hasher.finalize()).into()
}

/// Keccak-256 digest of the provided data; the derivation primitive for
/// storage slots and dispatch selectors.
pub fn keccak256<B>(data: B) -> Bytes32
where
    B: AsRef<[u8]>,
{
    let mut hasher = Keccak256::new();
    hasher.update(data);
    <[u8; Bytes32::LEN]>::from(hasher.finalize()).into()
}

/// Keccak-256 digest rendered as `0x` plus 64 lowercase hex characters,
/// the canonical slot-hash form the contract lowering emits.
pub fn keccak256_hex<B>(data: B) -> String
where
    B: AsRef<[u8]>,
{
    keccak256(data).to_hex()
}

/// Dispatch selector of a canonical signature: the first four bytes of its
/// Keccak-256 digest, rendered as the 10-character `0x` hex form.
pub fn selector_hex(signature: &str) -> String {
    let digest = keccak256(signature.as_bytes());
    format!("0x{}", hex::encode(&digest[..4]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // sha256("abc")
        assert_eq!(
            sha256(b"abc").to_hex(),
            "0xba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn keccak_known_vector() {
        // keccak256("") is the well-known empty digest
        assert_eq!(
            keccak256_hex(b""),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn the_two_digests_disagree_on_purpose() {
        assert_ne!(sha256(b"tol"), keccak256(b"tol"));
    }

    #[test]
    fn selector_shape() {
        let sel = selector_hex("transfer(address,uint256)");
        assert_eq!(sel.len(), 10);
        assert!(sel.starts_with("0x"));
        assert!(sel[2..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // well-known ERC-20 transfer selector
        assert_eq!(sel, "0xa9059cbb");
    }

    #[test]
    fn slot_hash_form_is_deterministic() {
        let a = keccak256_hex(b"tol.slot.Token.balances");
        let b = keccak256_hex(b"tol.slot.Token.balances");
        assert_eq!(a, b);
        assert_eq!(a.len(), 66);
    }
}
