use crate::peer::types::SessionDescription;
use sha2::{Digest, Sha256};

/// `a=fingerprint:` values of a description, session and media level.
pub fn dtls_fingerprints(desc: &SessionDescription) -> Vec<String> {
    desc.sdp
        .lines()
        .filter_map(|l| l.trim().strip_prefix("a=fingerprint:"))
        .map(|v| v.trim().to_ascii_lowercase())
        .collect()
}

/// Six digit short authentication string both peers can read out to each other.
///
/// Order-independent: both sides get the same code from their own
/// (local, remote) pair. `None` when either side carries no fingerprint.
pub fn verification_code(local: &SessionDescription, remote: &SessionDescription) -> Option<String> {
    let mut a = dtls_fingerprints(local);
    let mut b = dtls_fingerprints(remote);
    if a.is_empty() || b.is_empty() {
        return None;
    }
    a.sort();
    b.sort();
    let (first, second) = if a <= b { (a, b) } else { (b, a) };

    let mut hasher = Sha256::new();
    for fp in first.iter().chain(second.iter()) {
        hasher.update(fp.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 1_000_000;
    log::debug!("sas digest {}", hex::encode(&digest[..6]));
    Some(format!("{n:06}"))
}
