use rand::Rng;
use rand::rngs::OsRng;

/// Digits of the radix-32 encoding used for generated secrets.
const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Default entropy for one-shot secrets (file names, key passwords).
pub const DEFAULT_SECRET_BITS: u32 = 130;

/// Generates a random secret with at least `bits` bits of entropy,
/// encoded in radix 32 so it stays file-name and URL safe.
///
/// `bits` is rounded up to a whole number of 5-bit digits. Randomness
/// comes from the operating system; callable from any thread.
pub fn random_secret(bits: u32) -> String {
    let digits = bits.div_ceil(5).max(1);
    let mut rng = OsRng;
    (0..digits)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Default-strength secret ([`DEFAULT_SECRET_BITS`] bits).
pub fn random_secret_default() -> String {
    random_secret(DEFAULT_SECRET_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_differ_between_calls() {
        let a = random_secret_default();
        let b = random_secret_default();
        assert_ne!(a, b);
    }

    #[test]
    fn secrets_use_the_radix32_alphabet_only() {
        let secret = random_secret(260);
        assert!(!secret.is_empty());
        assert!(
            secret
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='v').contains(&c)),
            "unexpected digit in {secret}"
        );
    }

    #[test]
    fn bit_count_rounds_up_to_whole_digits() {
        assert_eq!(random_secret(1).len(), 1);
        assert_eq!(random_secret(5).len(), 1);
        assert_eq!(random_secret(6).len(), 2);
        assert_eq!(random_secret(130).len(), 26);
    }

    #[test]
    fn zero_bits_still_yields_a_digit() {
        assert_eq!(random_secret(0).len(), 1);
    }
}
