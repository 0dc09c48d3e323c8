//! The per-epoch key schedule and the per-sender hash ratchets it feeds.
//!
//! ```text
//!                  init_secret_[n-1]
//!                        |
//!                        V
//!  commit_secret --> KDF.Extract = epoch_secret
//!                        |
//!                        +--> derive_secret(., <label>, GroupContext_[n])
//!                             = <secret>  for each epoch secret
//! ```
//!
//! The `encryption_secret` is distributed down the tree to seed one
//! application ratchet per leaf; handshake ratchets are seeded from it
//! directly.  Each ratchet caches the keys it has produced until they are
//! erased, which supports out-of-order receipt and self-decryption while
//! keeping forward secrecy under the caller's control.

use crate::common::{Error, Result};
use crate::crypto::{CipherSuite, HpkePrivateKey, HpkePublicKey, Mac, Secret};
use crate::syntax::Serialize;
use crate::tree_math::{LeafCount, LeafIndex, NodeCount, NodeIndex};

use std::collections::BTreeMap;

// struct {
//     uint32 node;
//     uint32 generation;
// } RatchetContext;
fn ratchet_context(node: NodeIndex, generation: u32) -> Result<Vec<u8>> {
    let mut context = Vec::new();
    node.0.serialize(&mut context)?;
    generation.serialize(&mut context)?;
    Ok(context)
}

/// A one-way chain of (key, nonce) pairs for one sender and content class.
#[derive(Clone, Debug)]
pub struct HashRatchet {
    suite: CipherSuite,
    node: NodeIndex,
    next_secret: Secret,
    next_generation: u32,
    cache: BTreeMap<u32, (Secret, Secret)>,
}

impl HashRatchet {
    fn new(suite: CipherSuite, node: NodeIndex, base_secret: Secret) -> Self {
        Self {
            suite,
            node,
            next_secret: base_secret,
            next_generation: 0,
            cache: BTreeMap::new(),
        }
    }

    pub fn next_generation(&self) -> u32 {
        self.next_generation
    }

    /// Produce the next (key, nonce), advance the chain, and replace the
    /// chain secret.  The pair stays cached until erased.
    pub fn next(&mut self) -> Result<(u32, (Secret, Secret))> {
        let context = ratchet_context(self.node, self.next_generation)?;
        let key = self.suite.expand_with_label(
            &self.next_secret,
            b"key",
            &context,
            self.suite.aead_key_size(),
        )?;
        let nonce = self.suite.expand_with_label(
            &self.next_secret,
            b"nonce",
            &context,
            self.suite.aead_nonce_size(),
        )?;
        let secret = self.suite.expand_with_label(
            &self.next_secret,
            b"secret",
            &context,
            self.suite.secret_size(),
        )?;

        let generation = self.next_generation;
        self.next_generation += 1;
        self.next_secret = secret;

        self.cache.insert(generation, (key.clone(), nonce.clone()));
        Ok((generation, (key, nonce)))
    }

    /// Fetch the keys for a generation, ratcheting forward as needed.  A
    /// generation that has already been produced and erased is gone for good.
    pub fn get(&mut self, generation: u32) -> Result<(Secret, Secret)> {
        if let Some(keys) = self.cache.get(&generation) {
            return Ok(keys.clone());
        }

        if self.next_generation > generation {
            return Err(Error::Protocol("request for expired key"));
        }

        while self.next_generation <= generation {
            self.next()?;
        }

        Ok(self.cache[&generation].clone())
    }

    pub fn erase(&mut self, generation: u32) {
        // Dropping the entry zeroizes the key and nonce
        self.cache.remove(&generation);
    }
}

/// Where a leaf's ratchet base secret comes from.
#[derive(Clone, Debug)]
enum BaseKeySource {
    /// Directly expanded from the root secret per leaf.
    Direct { root_secret: Secret },
    /// Distributed by left/right derivation down the tree; consumed secrets
    /// along the requested leaf's path are zeroized once read.
    Tree {
        width: NodeCount,
        secrets: BTreeMap<NodeIndex, Secret>,
    },
}

impl BaseKeySource {
    fn get(&mut self, suite: CipherSuite, sender: LeafIndex) -> Result<Secret> {
        match self {
            Self::Direct { root_secret } => {
                let context = ratchet_context(NodeIndex::from(sender), 0)?;
                suite.expand_with_label(root_secret, b"handshake", &context, suite.secret_size())
            }
            Self::Tree { width, secrets } => {
                let size = LeafCount::from(*width);
                let mut chain = vec![NodeIndex::from(sender)];
                chain.extend(size.direct_path(sender));

                // Lowest populated ancestor, then derive down to the leaf
                let start = chain
                    .iter()
                    .position(|n| secrets.contains_key(n))
                    .ok_or(Error::InvalidParameter("no secret to derive base key"))?;

                for i in (1..=start).rev() {
                    let node = chain[i];
                    let secret = secrets[&node].clone();

                    for child in [node.left().unwrap(), node.right(*width).unwrap()] {
                        let context = ratchet_context(child, 0)?;
                        let child_secret = suite.expand_with_label(
                            &secret,
                            b"tree",
                            &context,
                            suite.secret_size(),
                        )?;
                        secrets.insert(child, child_secret);
                    }
                }

                let out = secrets[&chain[0]].clone();
                for n in &chain {
                    secrets.remove(n);
                }
                Ok(out)
            }
        }
    }
}

/// A lazily-instantiated map of per-sender hash ratchets.
#[derive(Clone, Debug)]
pub struct GroupKeySource {
    suite: CipherSuite,
    base: BaseKeySource,
    chains: BTreeMap<u32, HashRatchet>,
}

impl GroupKeySource {
    fn handshake(suite: CipherSuite, root_secret: Secret) -> Self {
        Self {
            suite,
            base: BaseKeySource::Direct { root_secret },
            chains: BTreeMap::new(),
        }
    }

    fn application(suite: CipherSuite, size: LeafCount, root_secret: Secret) -> Self {
        let width = NodeCount::from(size);
        let mut secrets = BTreeMap::new();
        secrets.insert(width.root(), root_secret);

        Self {
            suite,
            base: BaseKeySource::Tree { width, secrets },
            chains: BTreeMap::new(),
        }
    }

    fn chain(&mut self, sender: LeafIndex) -> Result<&mut HashRatchet> {
        if !self.chains.contains_key(&sender.0) {
            let base_secret = self.base.get(self.suite, sender)?;
            let ratchet = HashRatchet::new(self.suite, NodeIndex::from(sender), base_secret);
            self.chains.insert(sender.0, ratchet);
        }

        Ok(self.chains.get_mut(&sender.0).unwrap())
    }

    pub fn next(&mut self, sender: LeafIndex) -> Result<(u32, (Secret, Secret))> {
        self.chain(sender)?.next()
    }

    pub fn get(&mut self, sender: LeafIndex, generation: u32) -> Result<(Secret, Secret)> {
        self.chain(sender)?.get(generation)
    }

    pub fn erase(&mut self, sender: LeafIndex, generation: u32) -> Result<()> {
        self.chain(sender)?.erase(generation);
        Ok(())
    }
}

/// The family of secrets for one epoch.  Immutable once built, except that
/// the two key sources advance as messages are protected and opened.
#[derive(Clone, Debug)]
pub struct KeyScheduleEpoch {
    pub suite: CipherSuite,
    pub epoch_secret: Secret,
    /// Conveyed to joiners in their Welcome; yields every other field of
    /// this epoch together with the group context, and nothing of any prior
    /// epoch.
    pub joiner_secret: Secret,
    pub sender_data_secret: Secret,
    pub encryption_secret: Secret,
    pub exporter_secret: Secret,
    pub authentication_secret: Secret,
    pub external_secret: Secret,
    pub confirmation_key: Secret,
    pub membership_key: Secret,
    pub resumption_secret: Secret,
    pub init_secret: Secret,
    pub external_priv: HpkePrivateKey,
    pub external_pub: HpkePublicKey,
    pub handshake_keys: GroupKeySource,
    pub application_keys: GroupKeySource,
}

impl KeyScheduleEpoch {
    /// The creation epoch: all-zero init secret, all-zero commit secret.
    pub fn first(suite: CipherSuite, size: LeafCount, context: &[u8]) -> Result<Self> {
        let init_secret = Secret::zero(suite.secret_size());
        let commit_secret = Secret::zero(suite.secret_size());
        let epoch_secret = suite.hkdf_extract(init_secret.as_ref(), commit_secret.as_ref());
        Self::derive(suite, epoch_secret, size, context)
    }

    /// Advance to the next epoch under the new group context.
    pub fn next(&self, size: LeafCount, commit_secret: &Secret, context: &[u8]) -> Result<Self> {
        let epoch_secret = self
            .suite
            .hkdf_extract(self.init_secret.as_ref(), commit_secret.as_ref());
        Self::derive(self.suite, epoch_secret, size, context)
    }

    /// Build the epoch from a Welcome's joiner secret.
    pub fn from_joiner(
        suite: CipherSuite,
        joiner_secret: Secret,
        size: LeafCount,
        context: &[u8],
    ) -> Result<Self> {
        Self::derive(suite, joiner_secret, size, context)
    }

    fn derive(
        suite: CipherSuite,
        epoch_secret: Secret,
        size: LeafCount,
        context: &[u8],
    ) -> Result<Self> {
        let sender_data_secret = suite.derive_secret(&epoch_secret, b"sender data", context)?;
        let encryption_secret = suite.derive_secret(&epoch_secret, b"encryption", context)?;
        let exporter_secret = suite.derive_secret(&epoch_secret, b"exporter", context)?;
        let authentication_secret =
            suite.derive_secret(&epoch_secret, b"authentication", context)?;
        let external_secret = suite.derive_secret(&epoch_secret, b"external", context)?;
        let confirmation_key = suite.derive_secret(&epoch_secret, b"confirm", context)?;
        let membership_key = suite.derive_secret(&epoch_secret, b"membership", context)?;
        let resumption_secret = suite.derive_secret(&epoch_secret, b"resumption", context)?;
        let init_secret = suite.derive_secret(&epoch_secret, b"init", context)?;

        let (external_priv, external_pub) = suite.hpke_derive(&external_secret)?;

        let handshake_keys = GroupKeySource::handshake(suite, encryption_secret.clone());
        let application_keys =
            GroupKeySource::application(suite, size, encryption_secret.clone());

        Ok(Self {
            suite,
            joiner_secret: epoch_secret.clone(),
            epoch_secret,
            sender_data_secret,
            encryption_secret,
            exporter_secret,
            authentication_secret,
            external_secret,
            confirmation_key,
            membership_key,
            resumption_secret,
            init_secret,
            external_priv,
            external_pub,
            handshake_keys,
            application_keys,
        })
    }

    /// `confirmation_tag = HMAC(confirmation_key, confirmed_transcript_hash)`
    pub fn confirmation_tag(&self, confirmed_transcript_hash: &[u8]) -> Mac {
        self.suite
            .hmac(self.confirmation_key.as_ref(), confirmed_transcript_hash)
    }

    /// `membership_tag = HMAC(membership_key, H(plaintext_without_tag || group_context))`
    pub fn membership_tag(&self, tag_input: &[u8]) -> Mac {
        let digest = self.suite.digest(tag_input);
        self.suite.hmac(self.membership_key.as_ref(), &digest)
    }

    /// Sender-data key and nonce, bound to a sample of the content
    /// ciphertext.
    pub fn sender_data_key_nonce(&self, ciphertext: &[u8]) -> Result<(Secret, Secret)> {
        let sample_len = self.suite.hash_size().min(ciphertext.len());
        let sample = &ciphertext[..sample_len];

        let key = self.suite.expand_with_label(
            &self.sender_data_secret,
            b"key",
            sample,
            self.suite.aead_key_size(),
        )?;
        let nonce = self.suite.expand_with_label(
            &self.sender_data_secret,
            b"nonce",
            sample,
            self.suite.aead_nonce_size(),
        )?;
        Ok((key, nonce))
    }

    /// Welcome encryption keys, derived directly from a joiner secret so a
    /// joiner can open the group info before it knows the group context.
    pub fn welcome_key_nonce(
        suite: CipherSuite,
        joiner_secret: &Secret,
    ) -> Result<(Secret, Secret)> {
        let key =
            suite.expand_with_label(joiner_secret, b"welcome", b"", suite.aead_key_size())?;
        let nonce =
            suite.expand_with_label(joiner_secret, b"nonce", b"", suite.aead_nonce_size())?;
        Ok((key, nonce))
    }

    /// The exporter interface for applications layered on the group.
    pub fn do_export(&self, label: &[u8], context: &[u8], length: usize) -> Result<Secret> {
        let derived = self.suite.derive_secret(&self.exporter_secret, label, b"")?;
        let context_hash = self.suite.digest(context);
        self.suite
            .expand_with_label(&derived, b"exporter", &context_hash, length)
    }

    /// A value equal across members exactly when they agree on the epoch.
    pub fn epoch_authenticator(&self) -> &Secret {
        &self.authentication_secret
    }
}

// Key sources are dynamically generated per sender; two epochs are the same
// epoch when their secrets are.
impl PartialEq for KeyScheduleEpoch {
    fn eq(&self, other: &Self) -> bool {
        self.suite == other.suite
            && self.epoch_secret == other.epoch_secret
            && self.joiner_secret == other.joiner_secret
            && self.sender_data_secret == other.sender_data_secret
            && self.encryption_secret == other.encryption_secret
            && self.exporter_secret == other.exporter_secret
            && self.authentication_secret == other.authentication_secret
            && self.external_secret == other.external_secret
            && self.confirmation_key == other.confirmation_key
            && self.membership_key == other.membership_key
            && self.resumption_secret == other.resumption_secret
            && self.init_secret == other.init_secret
            && self.external_priv == other.external_priv
    }
}

impl Eq for KeyScheduleEpoch {}

#[cfg(test)]
mod test {
    use super::*;

    const SUITE: CipherSuite = CipherSuite::X25519Aes128GcmSha256Ed25519;

    fn context(epoch: u64) -> Vec<u8> {
        let mut ctx = b"test context ".as_slice().to_vec();
        ctx.push(epoch as u8);
        ctx
    }

    #[test]
    fn first_epoch_is_deterministic() {
        let a = KeyScheduleEpoch::first(SUITE, LeafCount(1), &context(0)).unwrap();
        let b = KeyScheduleEpoch::first(SUITE, LeafCount(1), &context(0)).unwrap();
        assert_eq!(a, b);

        // Distinct labels yield distinct secrets
        assert_ne!(a.encryption_secret, a.sender_data_secret);
        assert_ne!(a.confirmation_key, a.membership_key);
        assert_ne!(a.init_secret, a.epoch_secret);
    }

    #[test]
    fn epochs_chain_and_diverge() {
        let e0 = KeyScheduleEpoch::first(SUITE, LeafCount(2), &context(0)).unwrap();

        let commit = Secret::from_bytes(vec![0x07; 32]);
        let e1 = e0.next(LeafCount(2), &commit, &context(1)).unwrap();
        let e1_again = e0.next(LeafCount(2), &commit, &context(1)).unwrap();

        assert_eq!(e1, e1_again);
        assert_ne!(e0.encryption_secret, e1.encryption_secret);

        // A different commit secret produces an unrelated epoch
        let other_commit = Secret::from_bytes(vec![0x08; 32]);
        let e1_other = e0.next(LeafCount(2), &other_commit, &context(1)).unwrap();
        assert_ne!(e1, e1_other);
    }

    #[test]
    fn joiner_reaches_the_same_epoch() {
        let e0 = KeyScheduleEpoch::first(SUITE, LeafCount(2), &context(0)).unwrap();
        let commit = Secret::from_bytes(vec![0x09; 32]);
        let e1 = e0.next(LeafCount(2), &commit, &context(1)).unwrap();

        let joined =
            KeyScheduleEpoch::from_joiner(SUITE, e1.joiner_secret.clone(), LeafCount(2), &context(1))
                .unwrap();
        assert_eq!(e1, joined);
    }

    #[test]
    fn ratchet_generations_advance() {
        let mut epoch = KeyScheduleEpoch::first(SUITE, LeafCount(2), &context(0)).unwrap();

        let (g0, k0) = epoch.application_keys.next(LeafIndex(0)).unwrap();
        let (g1, k1) = epoch.application_keys.next(LeafIndex(0)).unwrap();
        assert_eq!(g0, 0);
        assert_eq!(g1, 1);
        assert_ne!(k0, k1);
    }

    #[test]
    fn two_members_derive_the_same_ratchets() {
        let mut a = KeyScheduleEpoch::first(SUITE, LeafCount(4), &context(0)).unwrap();
        let mut b = a.clone();

        // b consumes another leaf's chain first; the tree derivation must
        // still agree on leaf 2
        let _ = b.application_keys.next(LeafIndex(0)).unwrap();

        let (_, ka) = a.application_keys.next(LeafIndex(2)).unwrap();
        let kb = b.application_keys.get(LeafIndex(2), 0).unwrap();
        assert_eq!(ka, kb);

        let (_, ha) = a.handshake_keys.next(LeafIndex(1)).unwrap();
        let hb = b.handshake_keys.get(LeafIndex(1), 0).unwrap();
        assert_eq!(ha, hb);
    }

    #[test]
    fn out_of_order_and_expiry() {
        let mut epoch = KeyScheduleEpoch::first(SUITE, LeafCount(2), &context(0)).unwrap();

        // Jump ahead to generation 2, then read 0 and 1 from the cache
        let k2 = epoch.application_keys.get(LeafIndex(1), 2).unwrap();
        let k0 = epoch.application_keys.get(LeafIndex(1), 0).unwrap();
        let k1 = epoch.application_keys.get(LeafIndex(1), 1).unwrap();
        assert_ne!(k0, k1);
        assert_ne!(k1, k2);

        // Erased generations are expired
        epoch.application_keys.erase(LeafIndex(1), 0).unwrap();
        let err = epoch.application_keys.get(LeafIndex(1), 0).unwrap_err();
        assert!(matches!(err, Error::Protocol(reason) if reason.contains("expired")));
    }

    #[test]
    fn sender_data_keys_bind_the_sample() {
        let epoch = KeyScheduleEpoch::first(SUITE, LeafCount(2), &context(0)).unwrap();

        let (k1, n1) = epoch.sender_data_key_nonce(&[0xaa; 48]).unwrap();
        let (k2, n2) = epoch.sender_data_key_nonce(&[0xbb; 48]).unwrap();
        assert_ne!(k1, k2);
        assert_ne!(n1, n2);

        // Short ciphertexts sample what there is
        let (k3, _) = epoch.sender_data_key_nonce(&[0xaa; 8]).unwrap();
        assert_ne!(k1, k3);
    }

    #[test]
    fn exporter_separates_labels() {
        let epoch = KeyScheduleEpoch::first(SUITE, LeafCount(2), &context(0)).unwrap();

        let a = epoch.do_export(b"handle", b"ctx", 32).unwrap();
        let b = epoch.do_export(b"handle", b"ctx", 32).unwrap();
        let c = epoch.do_export(b"other", b"ctx", 32).unwrap();
        let d = epoch.do_export(b"handle", b"other ctx", 32).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
