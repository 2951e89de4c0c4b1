//! Order-independent fingerprint of a URL set.
//!
//! The URL set is de-duplicated, sorted, joined with a newline (a byte no
//! parsed URL can contain), hashed with 32-bit FNV-1a and rendered in
//! base-36.

use std::collections::BTreeSet;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Separator placed between sorted URLs before hashing.
const SEPARATOR: &str = "\n";

/// Compute the fingerprint of a set of URLs.
///
/// Input order and duplicate count do not affect the result.
pub fn compute_fingerprint<I, S>(urls: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let owned: Vec<S> = urls.into_iter().collect();
    let unique: BTreeSet<&str> = owned.iter().map(AsRef::as_ref).collect();
    let joined = unique.into_iter().collect::<Vec<_>>().join(SEPARATOR);
    to_base36(fnv1a_32(joined.as_bytes()))
}

/// 32-bit FNV-1a over raw bytes.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Render an unsigned integer in lowercase base-36.
fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".into();
    }
    let mut out = Vec::with_capacity(7);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(u32::MAX), "1z141z3");
    }

    #[test]
    fn permutation_invariant() {
        let a = compute_fingerprint(["https://a.com/1", "https://a.com/2"]);
        let b = compute_fingerprint(["https://a.com/2", "https://a.com/1"]);
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_invariant() {
        let a = compute_fingerprint(["https://a.com/1", "https://a.com/2"]);
        let b = compute_fingerprint([
            "https://a.com/2",
            "https://a.com/1",
            "https://a.com/2",
            "https://a.com/1",
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_sets_differ() {
        let pair = compute_fingerprint(["https://a.com/1", "https://a.com/2"]);
        let single = compute_fingerprint(["https://a.com/1"]);
        assert_ne!(pair, single);
    }

    #[test]
    fn realistic_sets_do_not_collide() {
        let mut seen = std::collections::HashSet::new();
        for n in 1..=200 {
            let urls: Vec<String> = (0..n).map(|i| format!("https://shop.example/p/{i}")).collect();
            assert!(seen.insert(compute_fingerprint(&urls)), "collision at {n}");
        }
    }

    #[test]
    fn accepts_owned_strings() {
        let urls = vec!["https://a.com/x".to_string()];
        assert_eq!(compute_fingerprint(&urls), compute_fingerprint(["https://a.com/x"]));
    }
}
