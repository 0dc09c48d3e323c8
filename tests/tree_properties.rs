//! Property tests: tree-math identities over arbitrary tree sizes and exact
//! codec round-trips for the wire structures.

use mls_core::crypto::{CipherSuite, HpkeCiphertext, Mac, Secret};
use mls_core::protocol::{
    consts, Commit, Content, Extension, GroupContext, GroupSecrets, MlsCiphertext, MlsPlaintext,
    ProposalOrRef, Sender, SenderData, Welcome,
};
use mls_core::syntax::{Deserialize, Serialize};
use mls_core::tree_math::{LeafCount, LeafIndex, NodeCount, NodeIndex};

use proptest::prelude::*;

const SUITE: CipherSuite = CipherSuite::X25519Aes128GcmSha256Ed25519;

fn round_trip<T>(value: &T)
where
    T: Serialize + Deserialize + PartialEq + std::fmt::Debug,
{
    let encoded = value.to_vec().unwrap();
    let decoded = T::from_slice(&encoded).unwrap();
    assert_eq!(&decoded, value);
}

proptest! {
    #[test]
    fn parent_of_child_is_self(n in 1u32..256) {
        let width = NodeCount::from(LeafCount(n));

        for v in 0..width.0 {
            let v = NodeIndex(v);
            if v.is_leaf() {
                continue;
            }

            let l = v.left().unwrap();
            let r = v.right(width).unwrap();
            prop_assert_eq!(l.parent(width), Some(v));
            prop_assert_eq!(r.parent(width), Some(v));
        }
    }

    #[test]
    fn sibling_is_an_involution(n in 1u32..256) {
        let width = NodeCount::from(LeafCount(n));

        for v in 0..width.0 {
            let v = NodeIndex(v);
            if let Some(s) = v.sibling(width) {
                prop_assert_eq!(s.sibling(width), Some(v));
            } else {
                prop_assert_eq!(v, width.root());
            }
        }
    }

    #[test]
    fn direct_path_ends_at_root(n in 1u32..256, leaf in 0u32..256) {
        let leaf = LeafIndex(leaf % n);
        let size = LeafCount(n);

        let dirpath = size.direct_path(leaf);
        if n == 1 {
            prop_assert!(dirpath.is_empty());
        } else {
            prop_assert_eq!(*dirpath.last().unwrap(), size.root());
        }

        // Each node on the path is an ancestor of the leaf
        for node in &dirpath {
            prop_assert!(node.is_above_or_eq(leaf));
        }

        prop_assert_eq!(dirpath.len(), size.copath(leaf).len());
    }

    #[test]
    fn copath_nodes_are_not_ancestors(n in 2u32..256, leaf in 0u32..256) {
        let leaf = LeafIndex(leaf % n);
        let size = LeafCount(n);

        for node in size.copath(leaf) {
            prop_assert!(!node.is_above_or_eq(leaf));
        }
    }

    #[test]
    fn ancestor_is_symmetric_and_above_both(n in 2u32..256, a in 0u32..256, b in 0u32..256) {
        let a = LeafIndex(a % n);
        let b = LeafIndex(b % n);
        prop_assume!(a != b);

        let anc = a.ancestor(b);
        prop_assert_eq!(anc, b.ancestor(a));
        prop_assert!(anc.is_above_or_eq(a));
        prop_assert!(anc.is_above_or_eq(b));
    }

    #[test]
    fn ancestor_lies_on_the_direct_path(n in 2u32..64, a in 0u32..64, b in 0u32..64) {
        let a = LeafIndex(a % n);
        let b = LeafIndex(b % n);
        prop_assume!(a != b);

        let size = LeafCount(n);
        prop_assert!(size.direct_path(a).contains(&a.ancestor(b)));
    }

    #[test]
    fn group_context_round_trips(
        group_id in proptest::collection::vec(any::<u8>(), 0..32),
        epoch in any::<u64>(),
        tree_hash in proptest::collection::vec(any::<u8>(), 0..64),
        cth in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        round_trip(&GroupContext {
            group_id,
            epoch,
            tree_hash,
            confirmed_transcript_hash: cth,
            extensions: vec![Extension {
                extension_type: 0x0a0b,
                extension_data: vec![1, 2, 3],
            }],
        });
    }

    #[test]
    fn ciphertext_round_trips(
        group_id in proptest::collection::vec(any::<u8>(), 0..16),
        epoch in any::<u64>(),
        aad in proptest::collection::vec(any::<u8>(), 0..64),
        sender_data in proptest::collection::vec(any::<u8>(), 0..48),
        ciphertext in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        round_trip(&MlsCiphertext {
            group_id,
            epoch,
            content_type: consts::CONTENT_TYPE_APPLICATION,
            authenticated_data: aad,
            encrypted_sender_data: sender_data,
            ciphertext,
        });
    }

    #[test]
    fn sender_data_round_trips(
        sender in any::<u32>(),
        generation in any::<u32>(),
        reuse_guard in any::<[u8; 4]>(),
    ) {
        round_trip(&SenderData {
            sender: LeafIndex(sender),
            generation,
            reuse_guard,
        });
    }

    #[test]
    fn group_secrets_round_trips(
        joiner in proptest::collection::vec(any::<u8>(), 32),
        path in proptest::option::of(proptest::collection::vec(any::<u8>(), 32)),
    ) {
        round_trip(&GroupSecrets {
            joiner_secret: Secret::from_bytes(joiner),
            path_secret: path.map(Secret::from_bytes),
        });
    }
}

#[test]
fn application_plaintext_round_trips() {
    let mut pt = MlsPlaintext::new(
        &[0x00, 0x01],
        9,
        LeafIndex(4),
        Content::Application(b"payload".as_slice().to_vec()),
    );
    pt.authenticated_data = b"aad".as_slice().to_vec();
    pt.signature = mls_core::crypto::Signature(vec![0x41; 64]);
    pt.membership_tag = Some(Mac(vec![0x42; 32]));
    round_trip(&pt);
}

#[test]
fn commit_plaintext_round_trips() {
    let commit = Commit {
        proposals: vec![ProposalOrRef::Reference(vec![0x43; 32])],
        path: None,
    };

    let mut pt = MlsPlaintext::new(&[0x00, 0x01], 9, LeafIndex(0), Content::Commit(commit));
    pt.signature = mls_core::crypto::Signature(vec![0x44; 64]);
    pt.confirmation_tag = Some(Mac(vec![0x45; 32]));
    pt.membership_tag = Some(Mac(vec![0x46; 32]));
    round_trip(&pt);

    // The sender survives as a member reference
    let encoded = pt.to_vec().unwrap();
    let decoded = MlsPlaintext::from_slice(&encoded).unwrap();
    let Sender::Member(leaf) = decoded.sender;
    assert_eq!(leaf, LeafIndex(0));
}

#[test]
fn welcome_round_trips() {
    round_trip(&Welcome {
        version: consts::SUPPORTED_VERSION,
        cipher_suite: SUITE,
        secrets: vec![],
        encrypted_group_info: vec![0x47; 120],
    });

    round_trip(&HpkeCiphertext {
        kem_output: vec![0x48; 32],
        ciphertext: vec![0x49; 48],
    });
}
