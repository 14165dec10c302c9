use blake3::Hasher;

use crate::model::RequestMeta;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const FINGERPRINT_LEN: usize = 16;

pub fn base62(bytes: &[u8], len: usize) -> String {
    // Fold the digest into a u128, then peel off base62 digits
    let mut out = String::with_capacity(len);
    let mut acc: u128 = 0;
    for (i, b) in bytes.iter().enumerate() {
        acc ^= (*b as u128) << ((i % 16) * 8);
    }
    for _ in 0..len {
        let idx = (acc % 62) as usize;
        out.push(ALPHABET[idx] as char);
        acc /= 62;
        if acc == 0 {
            acc = 0x9E3779B97F4A7C15;
        }
    }
    out
}

/// Opaque, salted requester fingerprint. The raw address never leaves
/// this function. `None` when there is nothing to fingerprint.
pub fn requester_fingerprint(meta: &RequestMeta, salt: &str) -> Option<String> {
    let ip = meta.source_ip.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let ua = meta.user_agent.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if ip.is_none() && ua.is_none() {
        return None;
    }

    let mut hasher = Hasher::new();
    hasher.update(salt.as_bytes());
    hasher.update(&[0]);
    hasher.update(ip.unwrap_or_default().as_bytes());
    hasher.update(&[0]);
    hasher.update(ua.unwrap_or_default().as_bytes());
    let digest = hasher.finalize();
    Some(base62(digest.as_bytes(), FINGERPRINT_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ip: Option<&str>, ua: Option<&str>) -> RequestMeta {
        RequestMeta {
            source_ip: ip.map(str::to_string),
            user_agent: ua.map(str::to_string),
        }
    }

    #[test]
    fn nothing_to_hash() {
        assert_eq!(requester_fingerprint(&meta(None, None), "s"), None);
        assert_eq!(requester_fingerprint(&meta(Some(" "), Some("")), "s"), None);
    }

    #[test]
    fn stable_and_salted() {
        let m = meta(Some("203.0.113.7"), Some("curl/8.0"));
        let a = requester_fingerprint(&m, "salt-a").unwrap();
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert_eq!(requester_fingerprint(&m, "salt-a").unwrap(), a);
        assert_ne!(requester_fingerprint(&m, "salt-b").unwrap(), a);
    }

    #[test]
    fn ip_and_agent_are_not_interchangeable() {
        let a = requester_fingerprint(&meta(Some("x"), None), "").unwrap();
        let b = requester_fingerprint(&meta(None, Some("x")), "").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn base62_uses_alphabet_only() {
        let s = base62(&[0xff; 32], 20);
        assert_eq!(s.len(), 20);
        assert!(s.bytes().all(|c| ALPHABET.contains(&c)));
    }
}
