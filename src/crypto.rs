//
// Random values
//
use data_encoding::{Encoding, BASE64URL_NOPAD, HEXLOWER};
use ring::digest;

pub fn get_random_bytes<const N: usize>() -> [u8; N] {
    use ring::rand::{SecureRandom, SystemRandom};

    let mut array = [0; N];
    SystemRandom::new().fill(&mut array).expect("Error generating random values");

    array
}

/// Encodes random bytes using the provided function.
pub fn encode_random_bytes<const N: usize>(e: Encoding) -> String {
    e.encode(&get_random_bytes::<N>())
}

/// Opaque 256-bit value as transmitted for authorization codes and refresh
/// tokens, base64url without padding.
pub fn random_opaque() -> String {
    encode_random_bytes::<32>(BASE64URL_NOPAD)
}

pub fn get_random_string(alphabet: &[u8], num_chars: usize) -> String {
    // Ref: https://rust-lang-nursery.github.io/rust-cookbook/algorithms/randomness.html
    use rand::RngExt;
    let mut rng = rand::rng();

    (0..num_chars)
        .map(|_| {
            let i = rng.random_range(0..alphabet.len());
            alphabet[i] as char
        })
        .collect()
}

pub fn get_random_string_alphanum(num_chars: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                              abcdefghijklmnopqrstuvwxyz\
                              0123456789";
    get_random_string(ALPHABET, num_chars)
}

//
// Digests
//

/// Hex-encoded SHA-1, used for the responsibility-domain cookie suffix. The
/// value is public (it names the cookie), not a security boundary.
pub fn sha1_hex(data: &str) -> String {
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data.as_bytes());
    HEXLOWER.encode(hash.as_ref())
}

pub fn sha256_hex(data: &str) -> String {
    let hash = digest::digest(&digest::SHA256, data.as_bytes());
    HEXLOWER.encode(hash.as_ref())
}

/// RFC 7636 S256 transform: base64url(SHA256(verifier)), no padding.
pub fn pkce_s256_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    BASE64URL_NOPAD.encode(hash.as_ref())
}

//
// Constant time compare
//
pub fn ct_eq<T: AsRef<[u8]>, U: AsRef<[u8]>>(a: T, b: U) -> bool {
    use subtle::ConstantTimeEq;

    a.as_ref().ct_eq(b.as_ref()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_opaque_is_unpadded_base64url() {
        let value = random_opaque();
        assert_eq!(BASE64URL_NOPAD.decode(value.as_bytes()).unwrap().len(), 32);
        assert!(!value.contains('='));
        assert!(!value.contains('+'));
        assert!(!value.contains('/'));
    }

    #[test]
    fn random_opaque_is_unique() {
        assert_ne!(random_opaque(), random_opaque());
    }

    #[test]
    fn sha1_matches_known_vector() {
        // SHA1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
        assert_eq!(sha1_hex("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn pkce_s256_matches_rfc7636_appendix_b() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(pkce_s256_challenge(verifier), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn ct_eq_handles_length_mismatch() {
        assert!(ct_eq("same", "same"));
        assert!(!ct_eq("same", "other"));
        assert!(!ct_eq("short", "longer-value"));
    }
}
