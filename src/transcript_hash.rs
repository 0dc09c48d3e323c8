//! The two chained transcript digests that impose a total order on accepted
//! commits.
//!
//! `confirmed_n = H(interim_{n-1} || commit_content_n)` binds each commit's
//! content to every prior one; `interim_n = H(confirmed_n ||
//! commit_auth_data_n)` folds in the confirmation tag and signature so the
//! next commit covers them too.  Both start empty at epoch 0.

use crate::crypto::CipherSuite;

pub fn confirmed(
    suite: CipherSuite,
    interim_transcript_hash: &[u8],
    commit_content: &[u8],
) -> Vec<u8> {
    let mut input = interim_transcript_hash.to_vec();
    input.extend_from_slice(commit_content);
    suite.digest(&input)
}

pub fn interim(
    suite: CipherSuite,
    confirmed_transcript_hash: &[u8],
    commit_auth_data: &[u8],
) -> Vec<u8> {
    let mut input = confirmed_transcript_hash.to_vec();
    input.extend_from_slice(commit_auth_data);
    suite.digest(&input)
}

#[cfg(test)]
mod test {
    use super::*;

    const SUITE: CipherSuite = CipherSuite::X25519Aes128GcmSha256Ed25519;

    #[test]
    fn chain_is_deterministic_and_order_sensitive() {
        let c1 = confirmed(SUITE, &[], b"commit one");
        let i1 = interim(SUITE, &c1, b"auth one");
        let c2 = confirmed(SUITE, &i1, b"commit two");

        assert_eq!(c1, confirmed(SUITE, &[], b"commit one"));
        assert_eq!(c2, confirmed(SUITE, &i1, b"commit two"));

        // Swapping the commits changes the chain
        let c1_swapped = confirmed(SUITE, &[], b"commit two");
        let i1_swapped = interim(SUITE, &c1_swapped, b"auth one");
        assert_ne!(c2, confirmed(SUITE, &i1_swapped, b"commit one"));
    }
}
