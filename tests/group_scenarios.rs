//! End-to-end scenarios exercising group creation, joins, updates, removes,
//! and message protection across multiple members.

use mls_core::common::Error;
use mls_core::crypto::{CipherSuite, Secret};
use mls_core::group_state::State;
use mls_core::protocol::{consts, Credential, KeyPackageBundle};
use mls_core::tree_math::LeafIndex;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const SUITE: CipherSuite = CipherSuite::X25519Aes128GcmSha256Ed25519;

fn make_bundle(rng: &mut ChaCha8Rng, name: &[u8]) -> KeyPackageBundle {
    let (sig_priv, sig_key) = SUITE.sig_generate(rng).unwrap();
    let credential = Credential::basic(name, sig_key);
    KeyPackageBundle::generate(rng, SUITE, credential, &sig_priv).unwrap()
}

fn leaf_secret(fill: u8) -> Secret {
    Secret::from_bytes(vec![fill; 32])
}

/// A collection of member states that all process the same commit stream.
struct TestGroup {
    rng: ChaCha8Rng,
    states: Vec<Option<State>>,
}

impl TestGroup {
    fn new(group_id: &[u8], creator_name: &[u8]) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(0x6d6c73);
        let bundle = make_bundle(&mut rng, creator_name);
        let state = State::new(group_id, bundle).unwrap();

        Self {
            rng,
            states: vec![Some(state)],
        }
    }

    fn state(&self, member: usize) -> &State {
        self.states[member].as_ref().unwrap()
    }

    fn state_mut(&mut self, member: usize) -> &mut State {
        self.states[member].as_mut().unwrap()
    }

    /// `committer` adds a new member; everyone else handles the commit and
    /// the joiner processes the Welcome.  Returns the joiner's slot.
    fn add(&mut self, committer: usize, joiner_name: &[u8], secret: Secret) -> usize {
        let bundle = make_bundle(&mut self.rng, joiner_name);

        let committer_state = self.states[committer].take().unwrap();
        let add = committer_state
            .add_proposal(bundle.key_package.clone())
            .unwrap();
        let (commit_pt, welcome, committer_next) = committer_state
            .commit(&mut self.rng, secret, &[add])
            .unwrap();

        let joiner_state = State::join(bundle, &welcome.unwrap()).unwrap();

        for state in self.states.iter_mut().filter_map(Option::as_mut) {
            let next = state.handle(&commit_pt).unwrap().unwrap();
            *state = next;
        }
        self.states[committer] = Some(committer_next);

        let slot = match self.states.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.states.push(None);
                self.states.len() - 1
            }
        };
        self.states[slot] = Some(joiner_state);
        slot
    }

    /// `committer` removes `removed`; survivors handle the commit.  Returns
    /// the removed member's final state for post-removal assertions.
    fn remove(&mut self, committer: usize, removed: usize, secret: Secret) -> State {
        let committer_state = self.states[committer].take().unwrap();
        let remove = committer_state
            .remove_proposal(LeafIndex(removed as u32))
            .unwrap();
        let (commit_pt, welcome, committer_next) = committer_state
            .commit(&mut self.rng, secret, &[remove])
            .unwrap();
        assert!(welcome.is_none());

        let removed_state = self.states[removed].take().unwrap();

        for state in self.states.iter_mut().filter_map(Option::as_mut) {
            let next = state.handle(&commit_pt).unwrap().unwrap();
            *state = next;
        }
        self.states[committer] = Some(committer_next);

        removed_state
    }

    /// `committer` issues an empty commit, rotating its own leaf.
    fn rekey(&mut self, committer: usize, secret: Secret) {
        let committer_state = self.states[committer].take().unwrap();
        let (commit_pt, welcome, committer_next) =
            committer_state.commit(&mut self.rng, secret, &[]).unwrap();
        assert!(welcome.is_none());

        for state in self.states.iter_mut().filter_map(Option::as_mut) {
            let next = state.handle(&commit_pt).unwrap().unwrap();
            *state = next;
        }
        self.states[committer] = Some(committer_next);
    }

    /// Every member must agree on the epoch secrets and the tree.
    fn check(&self) {
        let members: Vec<&State> = self.states.iter().filter_map(Option::as_ref).collect();
        let reference = members[0];

        for state in &members[1..] {
            assert_eq!(reference.keys, state.keys);
            assert_eq!(
                reference.epoch_authenticator(),
                state.epoch_authenticator()
            );
            assert_eq!(
                reference.root_hash().unwrap(),
                state.root_hash().unwrap()
            );
            assert!(state.parent_hash_valid().unwrap());
        }
    }
}

#[test]
fn create_and_first_application_message() {
    let mut group = TestGroup::new(&[0x00, 0x01], b"alice");

    let alice = group.state(0);
    assert_eq!(alice.epoch(), 0);
    assert_eq!(alice.member_count(), 1);

    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let ct = group
        .state_mut(0)
        .protect(&mut rng, b"", b"hello")
        .unwrap();
    assert_eq!(ct.epoch, 0);
    assert_eq!(ct.content_type, consts::CONTENT_TYPE_APPLICATION);

    // The sender's ratchet caches produced keys until erased, so
    // self-decryption succeeds once
    assert_eq!(group.state_mut(0).unprotect(&ct).unwrap(), b"hello");
    assert!(group.state_mut(0).unprotect(&ct).is_err());
}

#[test]
fn epoch_zero_secrets_are_deterministic() {
    // Epoch 0 derives from the all-zero init and commit secrets, so the
    // same KeyPackage yields the same secrets
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let bundle = make_bundle(&mut rng, b"alice");

    let a = State::new(&[0x00, 0x01], bundle.clone()).unwrap();
    let b = State::new(&[0x00, 0x01], bundle).unwrap();

    assert_eq!(a.keys, b.keys);
    assert_ne!(
        a.keys.encryption_secret,
        Secret::from_bytes(vec![0; 32])
    );
}

#[test]
fn two_party_join() {
    let mut group = TestGroup::new(&[0x00, 0x01], b"alice");
    let bob = group.add(0, b"bob", leaf_secret(0x01));

    assert_eq!(group.state(bob).epoch(), 1);
    assert_eq!(group.state(0).epoch(), 1);
    group.check();
}

#[test]
fn three_party_update() {
    let mut group = TestGroup::new(&[0x00, 0x02], b"alice");
    group.add(0, b"bob", leaf_secret(0x01));
    group.add(0, b"carol", leaf_secret(0x11));
    group.check();

    let before = group.state(1).keys.encryption_secret.clone();

    // Bob rotates his leaf; Alice and Carol follow
    group.rekey(1, leaf_secret(0x02));
    group.check();

    let after = group.state(1).keys.encryption_secret.clone();
    assert_ne!(before, after);
}

#[test]
fn remove_and_truncate() {
    let mut group = TestGroup::new(&[0x00, 0x03], b"alice");
    group.add(0, b"bob", leaf_secret(0x01));
    group.add(0, b"carol", leaf_secret(0x02));
    group.add(0, b"dave", leaf_secret(0x03));
    group.check();

    let epoch_before = group.state(0).epoch();
    let mut dave = group.remove(0, 3, leaf_secret(0x04));
    group.check();

    // Dave held the highest leaf, so the tree shrank
    assert_eq!(group.state(0).member_count(), 3);
    assert_eq!(group.state(0).epoch(), epoch_before + 1);

    // Dave cannot decrypt post-removal traffic even when handed the bytes
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let ct = group
        .state_mut(0)
        .protect(&mut rng, b"", b"after dave left")
        .unwrap();
    assert!(dave.unprotect(&ct).is_err());

    // And receivers in the group still can
    assert_eq!(
        group.state_mut(1).unprotect(&ct).unwrap(),
        b"after dave left"
    );
}

#[test]
fn removed_member_sees_protocol_error() {
    let mut group = TestGroup::new(&[0x00, 0x04], b"alice");
    group.add(0, b"bob", leaf_secret(0x01));

    let bob_state = group.states[1].take().unwrap();
    let remove = group.state(0).remove_proposal(LeafIndex(1)).unwrap();
    let (commit_pt, _, _) = group.states[0]
        .take()
        .unwrap()
        .commit(&mut group.rng, leaf_secret(0x02), &[remove])
        .unwrap();

    let mut bob_state = bob_state;
    let err = bob_state.handle(&commit_pt).unwrap_err();
    assert!(matches!(err, Error::Protocol(reason) if reason.contains("removed")));
    // The failed handle left Bob's state at the old epoch
    assert_eq!(bob_state.epoch(), 1);
}

#[test]
fn out_of_order_application_delivery() {
    let mut group = TestGroup::new(&[0x00, 0x05], b"alice");
    group.add(0, b"bob", leaf_secret(0x01));

    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let ct0 = group.state_mut(0).protect(&mut rng, b"", b"gen zero").unwrap();
    let ct1 = group.state_mut(0).protect(&mut rng, b"", b"gen one").unwrap();
    let ct2 = group.state_mut(0).protect(&mut rng, b"", b"gen two").unwrap();

    // Delivered 1, 0, 2
    assert_eq!(group.state_mut(1).unprotect(&ct1).unwrap(), b"gen one");
    assert_eq!(group.state_mut(1).unprotect(&ct0).unwrap(), b"gen zero");
    assert_eq!(group.state_mut(1).unprotect(&ct2).unwrap(), b"gen two");

    // Generations 0 and 1 were erased on receipt; a replay is an expired key
    let err = group.state_mut(1).unprotect(&ct0).unwrap_err();
    assert!(matches!(err, Error::Protocol(reason) if reason.contains("expired")));
}

#[test]
fn tampered_membership_tag_leaves_state_unchanged() {
    let mut group = TestGroup::new(&[0x00, 0x06], b"alice");
    group.add(0, b"bob", leaf_secret(0x01));

    let alice = group.states[0].take().unwrap();
    let (commit_pt, _, alice_next) = alice
        .commit(&mut group.rng, leaf_secret(0x02), &[])
        .unwrap();

    for bit in 0..8 {
        let mut tampered = commit_pt.clone();
        tampered.membership_tag.as_mut().unwrap().0[0] ^= 1 << bit;

        let bob = group.state_mut(1);
        let err = bob.handle(&tampered).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(bob.epoch(), 1);
    }

    // The untampered commit still applies afterwards
    let bob_next = group.state_mut(1).handle(&commit_pt).unwrap().unwrap();
    assert_eq!(bob_next.keys, alice_next.keys);
}

#[test]
fn post_compromise_rotation_changes_every_secret() {
    let mut group = TestGroup::new(&[0x00, 0x07], b"alice");
    group.add(0, b"bob", leaf_secret(0x01));

    let before = group.state(0).keys.clone();
    group.rekey(1, leaf_secret(0x22));
    let after = group.state(0).keys.clone();

    assert_ne!(before.epoch_secret, after.epoch_secret);
    assert_ne!(before.encryption_secret, after.encryption_secret);
    assert_ne!(before.confirmation_key, after.confirmation_key);
    assert_ne!(before.membership_key, after.membership_key);
    assert_ne!(before.exporter_secret, after.exporter_secret);
    assert_ne!(before.init_secret, after.init_secret);
}

#[test]
fn exporter_agrees_across_members() {
    let mut group = TestGroup::new(&[0x00, 0x08], b"alice");
    group.add(0, b"bob", leaf_secret(0x01));
    group.add(1, b"carol", leaf_secret(0x02));

    let a = group.state(0).do_export(b"app", b"channel 7", 32).unwrap();
    let b = group.state(1).do_export(b"app", b"channel 7", 32).unwrap();
    let c = group.state(2).do_export(b"app", b"channel 7", 32).unwrap();

    assert_eq!(a, b);
    assert_eq!(b, c);
}

#[test]
fn churn_keeps_the_group_consistent() {
    let mut group = TestGroup::new(&[0x00, 0x09], b"alice");

    for i in 0..6_u8 {
        group.add(0, format!("member-{i}").as_bytes(), leaf_secret(i));
        group.check();
    }

    group.remove(0, 3, leaf_secret(0x31));
    group.check();
    group.remove(2, 5, leaf_secret(0x32));
    group.check();

    // Re-adding into the blanked slots exercises unmerged leaves
    let slot = group.add(4, b"grace", leaf_secret(0x33));
    group.check();
    assert_eq!(slot, 3);

    group.rekey(slot, leaf_secret(0x34));
    group.check();

    // Messages still flow after churn
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let ct = group
        .state_mut(slot)
        .protect(&mut rng, b"", b"still here")
        .unwrap();
    assert_eq!(group.state_mut(0).unprotect(&ct).unwrap(), b"still here");
}
