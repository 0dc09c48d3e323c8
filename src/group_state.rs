//! The group state machine: proposal caching, commit construction and
//! application, transcript maintenance, Welcome assembly and ingestion, and
//! the message-protection layer.
//!
//! A `State` is immutable except for proposal caching and ratchet
//! consumption.  Epoch transitions construct a candidate successor, perform
//! every verification against it, and only then hand it back; a failing
//! `handle` or `commit` leaves the current state untouched.

use crate::common::{Error, Result};
use crate::crypto::{CipherSuite, Secret, SignaturePrivateKey};
use crate::key_schedule::KeyScheduleEpoch;
use crate::protocol::{
    ciphertext_content_aad, consts, sender_data_aad, CiphertextContent, Commit, Content,
    EncryptedGroupSecrets, Extension, GroupContext, GroupInfo, GroupSecrets, KeyPackage,
    KeyPackageBundle, MlsCiphertext, MlsPlaintext, Proposal, ProposalOrRef, Sender, SenderData,
    Welcome,
};
use crate::syntax::{Deserialize, Serialize};
use crate::transcript_hash;
use crate::tree_math::{LeafCount, LeafIndex};
use crate::treekem::{TreeKemPrivateKey, TreeKemPublicKey};

use std::collections::BTreeMap;

use rand_core::CryptoRngCore;
use tracing::debug;

/// A proposal accepted from the current epoch, addressable by reference from
/// a commit.
#[derive(Clone, Debug)]
pub struct CachedProposal {
    pub proposal_ref: Vec<u8>,
    pub proposal: Proposal,
    pub sender: LeafIndex,
}

struct AppliedProposals {
    joiners: Vec<(LeafIndex, KeyPackage)>,
    path_required: bool,
}

#[derive(Clone, Debug)]
pub struct State {
    suite: CipherSuite,
    group_id: Vec<u8>,
    epoch: u64,
    extensions: Vec<Extension>,
    tree: TreeKemPublicKey,
    tree_priv: TreeKemPrivateKey,
    confirmed_transcript_hash: Vec<u8>,
    interim_transcript_hash: Vec<u8>,
    pub keys: KeyScheduleEpoch,
    self_index: LeafIndex,
    identity_priv: SignaturePrivateKey,
    pending_proposals: Vec<CachedProposal>,
    /// Leaf secrets for self-updates we have proposed, keyed by the hash of
    /// the KeyPackage carrying them, until a commit consumes one.
    update_secrets: BTreeMap<Vec<u8>, Secret>,
}

impl State {
    ///
    /// Constructors
    ///

    /// Create a new group with this member as its only leaf.  Epoch 0 keys
    /// derive from the all-zero init and commit secrets.
    pub fn new(group_id: &[u8], bundle: KeyPackageBundle) -> Result<Self> {
        let suite = bundle.key_package.cipher_suite;

        let mut tree = TreeKemPublicKey::new(suite);
        let self_index = tree.add_leaf(bundle.key_package.clone())?;
        let tree_priv = TreeKemPrivateKey::solo(suite, self_index, bundle.init_priv);

        let context = GroupContext {
            group_id: group_id.to_vec(),
            epoch: 0,
            tree_hash: tree.root_hash()?,
            confirmed_transcript_hash: Vec::new(),
            extensions: Vec::new(),
        };
        let keys = KeyScheduleEpoch::first(suite, LeafCount(1), &context.to_vec()?)?;

        debug!(group_id = ?group_id, "created group");

        Ok(Self {
            suite,
            group_id: group_id.to_vec(),
            epoch: 0,
            extensions: Vec::new(),
            tree,
            tree_priv,
            confirmed_transcript_hash: Vec::new(),
            interim_transcript_hash: Vec::new(),
            keys,
            self_index,
            identity_priv: bundle.signature_priv,
            pending_proposals: Vec::new(),
            update_secrets: BTreeMap::new(),
        })
    }

    /// Join a group from a Welcome addressed to `bundle`'s KeyPackage.
    pub fn join(bundle: KeyPackageBundle, welcome: &Welcome) -> Result<Self> {
        let suite = welcome.cipher_suite;
        if welcome.version != consts::SUPPORTED_VERSION {
            return Err(Error::Protocol("unsupported protocol version"));
        }
        if bundle.key_package.cipher_suite != suite {
            return Err(Error::InvalidParameter("key package cipher suite mismatch"));
        }

        // Locate and decrypt our GroupSecrets
        let kp_hash = bundle.key_package.hash()?;
        let entry = welcome
            .secrets
            .iter()
            .find(|entry| entry.key_package_hash == kp_hash)
            .ok_or(Error::InvalidParameter(
                "welcome is not addressed to this key package",
            ))?;

        let group_secrets_data = suite.hpke_open(
            &bundle.init_priv,
            &entry.encrypted_group_secrets,
            &[],
            &[],
        )?;
        let group_secrets = GroupSecrets::from_slice(&group_secrets_data)?;

        // Decrypt the GroupInfo
        let (welcome_key, welcome_nonce) =
            KeyScheduleEpoch::welcome_key_nonce(suite, &group_secrets.joiner_secret)?;
        let group_info_data = suite.aead_open(
            &welcome_key,
            welcome_nonce.as_ref(),
            &[],
            &welcome.encrypted_group_info,
        )?;
        let group_info = GroupInfo::from_slice(&group_info_data)?;

        // Reconstruct and validate the public tree
        let tree_data = group_info
            .ratchet_tree_extension()
            .ok_or(Error::NotImplemented("welcome without ratchet tree extension"))?;
        let mut tree = TreeKemPublicKey::import(suite, tree_data)?;

        let context = group_info.group_context.clone();
        if tree.root_hash()? != context.tree_hash {
            return Err(Error::Protocol("tree hash mismatch"));
        }
        if !tree.parent_hash_valid()? {
            return Err(Error::Protocol("invalid parent hash chain"));
        }

        let self_index = tree
            .find(&bundle.key_package)
            .ok_or(Error::Protocol("joiner not present in tree"))?;

        // Verify the GroupInfo signature against the signer's leaf
        let signer_key_package = tree
            .key_package(group_info.signer_index)
            .ok_or(Error::Protocol("group info signer not present in tree"))?;
        group_info.verify(suite, signer_key_package.credential.signature_key()?)?;

        // Key schedule and confirmation check
        let keys = KeyScheduleEpoch::from_joiner(
            suite,
            group_secrets.joiner_secret.clone(),
            tree.size(),
            &context.to_vec()?,
        )?;
        let confirmation_tag = keys.confirmation_tag(&context.confirmed_transcript_hash);
        if confirmation_tag != group_info.confirmation_tag {
            return Err(Error::Protocol("confirmation tag mismatch"));
        }

        // Private tree view from the shared path secret
        let intersect = self_index.ancestor(group_info.signer_index);
        let tree_priv = TreeKemPrivateKey::joiner(
            suite,
            tree.size(),
            self_index,
            bundle.init_priv,
            intersect,
            group_secrets.path_secret.clone(),
        )?;
        if !tree_priv.consistent(&tree)? {
            return Err(Error::Protocol("path secret does not match tree"));
        }

        debug!(
            epoch = context.epoch,
            index = self_index.0,
            "joined group from welcome"
        );

        Ok(Self {
            suite,
            group_id: context.group_id.clone(),
            epoch: context.epoch,
            extensions: context.extensions.clone(),
            tree,
            tree_priv,
            confirmed_transcript_hash: context.confirmed_transcript_hash.clone(),
            interim_transcript_hash: group_info.interim_transcript_hash.clone(),
            keys,
            self_index,
            identity_priv: bundle.signature_priv,
            pending_proposals: Vec::new(),
            update_secrets: BTreeMap::new(),
        })
    }

    ///
    /// Accessors
    ///

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn group_id(&self) -> &[u8] {
        &self.group_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn self_index(&self) -> LeafIndex {
        self.self_index
    }

    pub fn member_count(&self) -> usize {
        self.tree.occupied_leaves().len()
    }

    pub fn root_hash(&self) -> Result<Vec<u8>> {
        self.tree.clone().root_hash()
    }

    pub fn parent_hash_valid(&self) -> Result<bool> {
        self.tree.parent_hash_valid()
    }

    /// A value equal across members exactly when they share the epoch.
    pub fn epoch_authenticator(&self) -> &Secret {
        self.keys.epoch_authenticator()
    }

    pub fn do_export(&self, label: &[u8], context: &[u8], length: usize) -> Result<Secret> {
        self.keys.do_export(label, context, length)
    }

    fn group_context(&self) -> Result<GroupContext> {
        Ok(GroupContext {
            group_id: self.group_id.clone(),
            epoch: self.epoch,
            tree_hash: self.root_hash()?,
            confirmed_transcript_hash: self.confirmed_transcript_hash.clone(),
            extensions: self.extensions.clone(),
        })
    }

    ///
    /// Proposal factories
    ///

    pub fn add_proposal(&self, key_package: KeyPackage) -> Result<Proposal> {
        if key_package.cipher_suite != self.suite {
            return Err(Error::InvalidParameter("key package cipher suite mismatch"));
        }
        key_package.verify()?;
        Ok(Proposal::Add { key_package })
    }

    /// Propose replacing our own leaf.  The fresh leaf secret is cached by
    /// KeyPackage hash so the commit that applies this proposal, ours or a
    /// peer's, can install the matching private key.
    pub fn update_proposal(&mut self, leaf_secret: Secret) -> Result<Proposal> {
        let (_, leaf_key) = self.suite.hpke_derive(&leaf_secret)?;

        let mut key_package = self
            .tree
            .key_package(self.self_index)
            .ok_or(Error::InvalidParameter("own leaf is blank"))?
            .clone();
        key_package.init_key = leaf_key;
        key_package
            .extensions
            .retain(|ext| ext.extension_type != consts::EXTENSION_PARENT_HASH);
        key_package.sign(&self.identity_priv)?;

        self.update_secrets
            .insert(key_package.hash()?, leaf_secret);
        Ok(Proposal::Update { key_package })
    }

    pub fn remove_proposal(&self, removed: LeafIndex) -> Result<Proposal> {
        if self.tree.key_package(removed).is_none() {
            return Err(Error::InvalidParameter("leaf index out of range"));
        }
        Ok(Proposal::Remove { removed })
    }

    /// Wrap content in a signed, membership-tagged plaintext.
    pub fn sign(&self, content: Content) -> Result<MlsPlaintext> {
        let context = self.group_context()?;

        let mut pt = MlsPlaintext::new(&self.group_id, self.epoch, self.self_index, content);
        pt.sign(self.suite, &context, &self.identity_priv)?;
        pt.membership_tag = Some(self.keys.membership_tag(&pt.membership_input(&context)?));
        Ok(pt)
    }

    ///
    /// Handling inbound handshake messages
    ///

    /// Ingest a peer's signed plaintext.  Proposals are cached and return
    /// `None`; a commit returns the successor state.
    pub fn handle(&mut self, pt: &MlsPlaintext) -> Result<Option<State>> {
        if pt.group_id != self.group_id {
            return Err(Error::InvalidParameter("wrong group"));
        }
        if pt.epoch != self.epoch {
            return Err(Error::InvalidParameter("wrong epoch"));
        }

        let context = self.group_context()?;
        let membership_tag = pt
            .membership_tag
            .as_ref()
            .ok_or(Error::Protocol("missing membership tag"))?;
        let expected = self.keys.membership_tag(&pt.membership_input(&context)?);
        if *membership_tag != expected {
            return Err(Error::Protocol("invalid membership tag"));
        }

        self.handle_verified(pt)
    }

    /// Ingest a handshake message that arrived encrypted.
    pub fn handle_ciphertext(&mut self, ct: &MlsCiphertext) -> Result<Option<State>> {
        let pt = self.open(ct)?;
        self.handle_verified(&pt)
    }

    fn handle_verified(&mut self, pt: &MlsPlaintext) -> Result<Option<State>> {
        let Sender::Member(sender) = pt.sender;
        let signer_key_package = self
            .tree
            .key_package(sender)
            .ok_or(Error::Protocol("unknown sender leaf"))?;
        pt.verify_signature(
            self.suite,
            &self.group_context()?,
            signer_key_package.credential.signature_key()?,
        )?;

        match &pt.content {
            Content::Application(_) => {
                Err(Error::InvalidParameter("application data is not handled here"))
            }
            Content::Proposal(proposal) => {
                let proposal_ref = self.suite.digest(&pt.to_vec()?);
                debug!(epoch = self.epoch, sender = sender.0, "cached proposal");
                self.pending_proposals.push(CachedProposal {
                    proposal_ref,
                    proposal: proposal.clone(),
                    sender,
                });
                Ok(None)
            }
            Content::Commit(commit) => {
                if sender == self.self_index {
                    return Err(Error::InvalidParameter(
                        "own commit must be applied via commit()",
                    ));
                }
                self.apply_commit(pt, commit, sender).map(Some)
            }
        }
    }

    /// Resolve a commit's proposal list against the pending cache.
    fn resolve_proposals(
        &self,
        commit: &Commit,
        committer: LeafIndex,
    ) -> Result<Vec<(Proposal, LeafIndex)>> {
        let mut proposals = Vec::new();
        for entry in &commit.proposals {
            match entry {
                ProposalOrRef::Proposal(proposal) => {
                    proposals.push((proposal.clone(), committer));
                }
                ProposalOrRef::Reference(proposal_ref) => {
                    let cached = self
                        .pending_proposals
                        .iter()
                        .find(|cached| cached.proposal_ref == *proposal_ref)
                        .ok_or(Error::Protocol("unknown proposal reference"))?;
                    proposals.push((cached.proposal.clone(), cached.sender));
                }
            }
        }
        Ok(proposals)
    }

    /// Apply proposals to the candidate successor in the fixed class order
    /// Update, Remove, Add, which gives deterministic final leaf positions.
    /// Sender order is preserved within each class.
    fn apply_proposals(
        next: &mut State,
        proposals: &[(Proposal, LeafIndex)],
        by_self: bool,
    ) -> Result<AppliedProposals> {
        let mut path_required = proposals.is_empty();
        let mut joiners = Vec::new();

        for (proposal, sender) in proposals {
            let Proposal::Update { key_package } = proposal else {
                continue;
            };
            path_required = true;

            if key_package.cipher_suite != next.suite {
                return Err(Error::Protocol("key package cipher suite mismatch"));
            }
            key_package.verify()?;
            next.tree.update_leaf(*sender, key_package.clone())?;

            if *sender == next.self_index {
                // Complete our own update from the cached leaf secret
                let leaf_secret = next
                    .update_secrets
                    .get(&key_package.hash()?)
                    .ok_or(Error::Protocol("no cached secret for own update"))?
                    .clone();
                let (leaf_priv, _) = next.suite.hpke_derive(&leaf_secret)?;
                next.tree_priv =
                    TreeKemPrivateKey::solo(next.suite, next.self_index, leaf_priv);
            } else {
                next.tree_priv.blank_path(*sender);
            }
        }

        for (proposal, _) in proposals {
            let Proposal::Remove { removed } = proposal else {
                continue;
            };
            path_required = true;

            if *removed == next.self_index {
                if by_self {
                    return Err(Error::InvalidParameter("cannot remove own leaf"));
                }
                return Err(Error::Protocol("local member removed by commit"));
            }
            next.tree.blank_path(*removed)?;
            next.tree_priv.blank_path(*removed);
        }

        for (proposal, _) in proposals {
            let Proposal::Add { key_package } = proposal else {
                continue;
            };

            if key_package.cipher_suite != next.suite {
                return Err(Error::Protocol("key package cipher suite mismatch"));
            }
            key_package.verify()?;
            let joiner = next.tree.add_leaf(key_package.clone())?;
            joiners.push((joiner, key_package.clone()));
        }

        next.tree.truncate();
        next.tree_priv.truncate(next.tree.size());
        if next.self_index.0 >= next.tree.size().0 {
            return Err(Error::Protocol("tree truncated below local leaf"));
        }

        Ok(AppliedProposals {
            joiners,
            path_required,
        })
    }

    /// Apply a peer's commit and return the successor state.
    fn apply_commit(
        &self,
        pt: &MlsPlaintext,
        commit: &Commit,
        sender: LeafIndex,
    ) -> Result<State> {
        let mut next = self.clone();

        let proposals = self.resolve_proposals(commit, sender)?;
        let applied = Self::apply_proposals(&mut next, &proposals, false)?;

        // Decap the update path against the provisional context: next epoch,
        // next tree hash, previous confirmed transcript hash
        let commit_secret = if let Some(path) = &commit.path {
            path.leaf_key_package.verify()?;
            next.tree.merge(sender, path)?;

            let provisional = GroupContext {
                group_id: self.group_id.clone(),
                epoch: self.epoch + 1,
                tree_hash: next.tree.root_hash()?,
                confirmed_transcript_hash: self.confirmed_transcript_hash.clone(),
                extensions: self.extensions.clone(),
            };
            next.tree_priv
                .decap(sender, &next.tree, &provisional.to_vec()?, path)?;
            next.tree_priv.update_secret.clone()
        } else {
            if applied.path_required {
                return Err(Error::Protocol("commit requires an update path"));
            }
            Secret::zero(self.suite.secret_size())
        };

        next.advance_epoch(pt, &commit_secret)?;

        // The committer proved knowledge of the new epoch
        let confirmation_tag = pt
            .confirmation_tag
            .as_ref()
            .ok_or(Error::Protocol("commit without confirmation tag"))?;
        let expected = next
            .keys
            .confirmation_tag(&next.confirmed_transcript_hash);
        if *confirmation_tag != expected {
            return Err(Error::Protocol("confirmation tag mismatch"));
        }

        next.interim_transcript_hash = transcript_hash::interim(
            self.suite,
            &next.confirmed_transcript_hash,
            &pt.commit_auth_data()?,
        );

        debug!(
            epoch = next.epoch,
            sender = sender.0,
            "applied commit from peer"
        );

        Ok(next)
    }

    /// Advance transcripts and the key schedule for the commit in `pt`.
    /// Leaves `interim_transcript_hash` to the caller, which needs the
    /// confirmation tag first.
    fn advance_epoch(&mut self, pt: &MlsPlaintext, commit_secret: &Secret) -> Result<()> {
        self.confirmed_transcript_hash = transcript_hash::confirmed(
            self.suite,
            &self.interim_transcript_hash,
            &pt.commit_content()?,
        );
        self.epoch += 1;

        let context = self.group_context()?;
        self.keys = self
            .keys
            .next(self.tree.size(), commit_secret, &context.to_vec()?)?;

        self.pending_proposals.clear();
        self.update_secrets.clear();
        Ok(())
    }

    ///
    /// Committing
    ///

    /// Fold the pending proposals plus `extra_proposals` into a commit.
    /// Returns the signed commit plaintext, a Welcome when members were
    /// added, and the successor state.  `leaf_secret` feeds the update path
    /// when one is required.
    pub fn commit(
        &self,
        rng: &mut impl CryptoRngCore,
        leaf_secret: Secret,
        extra_proposals: &[Proposal],
    ) -> Result<(MlsPlaintext, Option<Welcome>, State)> {
        let old_context = self.group_context()?;
        let mut next = self.clone();

        // Assemble the proposal list: cached proposals by reference, extras
        // inline
        let mut proposal_list: Vec<ProposalOrRef> = self
            .pending_proposals
            .iter()
            .map(|cached| ProposalOrRef::Reference(cached.proposal_ref.clone()))
            .collect();
        proposal_list.extend(
            extra_proposals
                .iter()
                .map(|proposal| ProposalOrRef::Proposal(proposal.clone())),
        );

        let mut resolved: Vec<(Proposal, LeafIndex)> = self
            .pending_proposals
            .iter()
            .map(|cached| (cached.proposal.clone(), cached.sender))
            .collect();
        resolved.extend(
            extra_proposals
                .iter()
                .map(|proposal| (proposal.clone(), self.self_index)),
        );

        let applied = Self::apply_proposals(&mut next, &resolved, true)?;

        // Inject fresh entropy along our direct path when required
        let (commit_secret, path) = if applied.path_required {
            let (tree_priv, path) = next.tree.update_direct_path(
                self.self_index,
                &leaf_secret,
                &self.identity_priv,
            )?;

            let provisional = GroupContext {
                group_id: self.group_id.clone(),
                epoch: self.epoch + 1,
                tree_hash: next.tree.root_hash()?,
                confirmed_transcript_hash: self.confirmed_transcript_hash.clone(),
                extensions: self.extensions.clone(),
            };
            let path = next.tree.encrypt_path_secrets(
                rng,
                self.self_index,
                &provisional.to_vec()?,
                &tree_priv,
                path,
            )?;

            next.tree_priv = tree_priv;
            (next.tree_priv.update_secret.clone(), Some(path))
        } else {
            (Secret::zero(self.suite.secret_size()), None)
        };

        let path_applied = path.is_some();
        let commit = Commit {
            proposals: proposal_list,
            path,
        };

        // Sign under the current epoch, then advance
        let mut pt = MlsPlaintext::new(
            &self.group_id,
            self.epoch,
            self.self_index,
            Content::Commit(commit),
        );
        pt.sign(self.suite, &old_context, &self.identity_priv)?;

        next.advance_epoch(&pt, &commit_secret)?;

        let confirmation_tag = next
            .keys
            .confirmation_tag(&next.confirmed_transcript_hash);
        pt.confirmation_tag = Some(confirmation_tag.clone());
        pt.membership_tag = Some(self.keys.membership_tag(&pt.membership_input(&old_context)?));

        next.interim_transcript_hash = transcript_hash::interim(
            self.suite,
            &next.confirmed_transcript_hash,
            &pt.commit_auth_data()?,
        );

        // Self-verification before anything escapes: the successor must
        // accept its own confirmation tag
        if next.keys.confirmation_tag(&next.confirmed_transcript_hash) != confirmation_tag {
            return Err(Error::Protocol("confirmation tag mismatch"));
        }

        let welcome = if applied.joiners.is_empty() {
            None
        } else {
            Some(next.make_welcome(rng, &applied.joiners, path_applied)?)
        };

        debug!(
            epoch = next.epoch,
            joiners = applied.joiners.len(),
            "committed"
        );

        Ok((pt, welcome, next))
    }

    /// Assemble the Welcome for this (already advanced) epoch.
    fn make_welcome(
        &self,
        rng: &mut impl CryptoRngCore,
        joiners: &[(LeafIndex, KeyPackage)],
        path_applied: bool,
    ) -> Result<Welcome> {
        let mut group_info = GroupInfo {
            group_context: self.group_context()?,
            extensions: vec![Extension::ratchet_tree(self.tree.export()?)],
            interim_transcript_hash: self.interim_transcript_hash.clone(),
            confirmation_tag: self.keys.confirmation_tag(&self.confirmed_transcript_hash),
            signer_index: self.self_index,
            signature: crate::crypto::Signature(Vec::new()),
        };
        group_info.sign(self.suite, &self.identity_priv)?;

        let (welcome_key, welcome_nonce) =
            KeyScheduleEpoch::welcome_key_nonce(self.suite, &self.keys.joiner_secret)?;
        let encrypted_group_info = self.suite.aead_seal(
            &welcome_key,
            welcome_nonce.as_ref(),
            &[],
            &group_info.to_vec()?,
        )?;

        let mut secrets = Vec::new();
        for (joiner, key_package) in joiners {
            let path_secret = if path_applied {
                Some(self.tree_priv.shared_path_secret(*joiner)?.1)
            } else {
                None
            };

            let group_secrets = GroupSecrets {
                joiner_secret: self.keys.joiner_secret.clone(),
                path_secret,
            };
            let encrypted_group_secrets = self.suite.hpke_seal(
                rng,
                &key_package.init_key,
                &[],
                &[],
                &group_secrets.to_vec()?,
            )?;

            secrets.push(EncryptedGroupSecrets {
                key_package_hash: key_package.hash()?,
                encrypted_group_secrets,
            });
        }

        Ok(Welcome {
            version: consts::SUPPORTED_VERSION,
            cipher_suite: self.suite,
            secrets,
            encrypted_group_info,
        })
    }

    ///
    /// Message protection
    ///

    /// Sign and encrypt application data.
    pub fn protect(
        &mut self,
        rng: &mut impl CryptoRngCore,
        authenticated_data: &[u8],
        application_data: &[u8],
    ) -> Result<MlsCiphertext> {
        let context = self.group_context()?;

        let mut pt = MlsPlaintext::new(
            &self.group_id,
            self.epoch,
            self.self_index,
            Content::Application(application_data.to_vec()),
        );
        pt.authenticated_data = authenticated_data.to_vec();
        pt.sign(self.suite, &context, &self.identity_priv)?;

        self.seal(rng, &pt)
    }

    /// Decrypt an application message, erase the consumed key, and return
    /// the plaintext payload.
    pub fn unprotect(&mut self, ct: &MlsCiphertext) -> Result<Vec<u8>> {
        let pt = self.open(ct)?;
        match pt.content {
            Content::Application(data) => Ok(data),
            _ => Err(Error::InvalidParameter("not an application message")),
        }
    }

    /// Encrypt one of our own plaintexts, drawing the next key from the
    /// ratchet matching its content type.
    pub fn seal(
        &mut self,
        rng: &mut impl CryptoRngCore,
        pt: &MlsPlaintext,
    ) -> Result<MlsCiphertext> {
        if pt.group_id != self.group_id || pt.epoch != self.epoch {
            return Err(Error::InvalidParameter("message is not for this epoch"));
        }
        let Sender::Member(sender) = pt.sender;
        if sender != self.self_index {
            return Err(Error::InvalidParameter("can only seal own messages"));
        }

        let content_type = pt.content.content_type();
        let source = match content_type {
            consts::CONTENT_TYPE_APPLICATION => &mut self.keys.application_keys,
            _ => &mut self.keys.handshake_keys,
        };
        let (generation, (key, nonce)) = source.next(self.self_index)?;

        // A fresh reuse guard masks the nonce so that a resumed or forked
        // sender cannot reuse (key, nonce) undetectably
        let mut reuse_guard = [0_u8; 4];
        rng.fill_bytes(&mut reuse_guard);

        let mut nonce_bytes = nonce.as_ref().to_vec();
        for (n, r) in nonce_bytes.iter_mut().zip(reuse_guard.iter()) {
            *n ^= r;
        }

        let content = CiphertextContent {
            content: pt.content.clone(),
            signature: pt.signature.clone(),
            confirmation_tag: pt.confirmation_tag.clone(),
        };
        let content_aad = ciphertext_content_aad(
            &self.group_id,
            self.epoch,
            content_type,
            &pt.authenticated_data,
        )?;
        let ciphertext = self
            .suite
            .aead_seal(&key, &nonce_bytes, &content_aad, &content.to_vec()?)?;

        // Encrypt the sender data under keys bound to the ciphertext sample
        let sender_data = SenderData {
            sender: self.self_index,
            generation,
            reuse_guard,
        };
        let (sd_key, sd_nonce) = self.keys.sender_data_key_nonce(&ciphertext)?;
        let sd_aad = sender_data_aad(&self.group_id, self.epoch, content_type)?;
        let encrypted_sender_data = self.suite.aead_seal(
            &sd_key,
            sd_nonce.as_ref(),
            &sd_aad,
            &sender_data.to_vec()?,
        )?;

        Ok(MlsCiphertext {
            group_id: self.group_id.clone(),
            epoch: self.epoch,
            content_type,
            authenticated_data: pt.authenticated_data.clone(),
            encrypted_sender_data,
            ciphertext,
        })
    }

    /// Decrypt a ciphertext from the current epoch, verify its signature,
    /// and erase the consumed generation to protect against replay.
    pub fn open(&mut self, ct: &MlsCiphertext) -> Result<MlsPlaintext> {
        if ct.group_id != self.group_id {
            return Err(Error::InvalidParameter("wrong group"));
        }
        if ct.epoch != self.epoch {
            return Err(Error::InvalidParameter("wrong epoch"));
        }

        // Decrypt the sender data
        let (sd_key, sd_nonce) = self.keys.sender_data_key_nonce(&ct.ciphertext)?;
        let sd_aad = sender_data_aad(&self.group_id, self.epoch, ct.content_type)?;
        let sender_data_bytes = self.suite.aead_open(
            &sd_key,
            sd_nonce.as_ref(),
            &sd_aad,
            &ct.encrypted_sender_data,
        )?;
        let sender_data = SenderData::from_slice(&sender_data_bytes)?;

        let signer_key_package = self
            .tree
            .key_package(sender_data.sender)
            .ok_or(Error::Protocol("unknown sender leaf"))?;

        // Fetch the addressed ratchet key and unmask the nonce
        let source = match ct.content_type {
            consts::CONTENT_TYPE_APPLICATION => &mut self.keys.application_keys,
            consts::CONTENT_TYPE_PROPOSAL | consts::CONTENT_TYPE_COMMIT => {
                &mut self.keys.handshake_keys
            }
            _ => return Err(Error::InvalidParameter("unknown content type")),
        };
        let (key, nonce) = source.get(sender_data.sender, sender_data.generation)?;

        let mut nonce_bytes = nonce.as_ref().to_vec();
        for (n, r) in nonce_bytes.iter_mut().zip(sender_data.reuse_guard.iter()) {
            *n ^= r;
        }

        let content_aad = ciphertext_content_aad(
            &self.group_id,
            self.epoch,
            ct.content_type,
            &ct.authenticated_data,
        )?;
        let content_bytes = self
            .suite
            .aead_open(&key, &nonce_bytes, &content_aad, &ct.ciphertext)?;
        let content = CiphertextContent::from_slice(ct.content_type, &content_bytes)?;

        // The generation is spent: erase it so a replay fails
        match ct.content_type {
            consts::CONTENT_TYPE_APPLICATION => self
                .keys
                .application_keys
                .erase(sender_data.sender, sender_data.generation)?,
            _ => self
                .keys
                .handshake_keys
                .erase(sender_data.sender, sender_data.generation)?,
        }

        let pt = MlsPlaintext {
            group_id: ct.group_id.clone(),
            epoch: ct.epoch,
            sender: Sender::Member(sender_data.sender),
            authenticated_data: ct.authenticated_data.clone(),
            content: content.content,
            signature: content.signature,
            confirmation_tag: content.confirmation_tag,
            membership_tag: None,
        };

        pt.verify_signature(
            self.suite,
            &self.group_context()?,
            signer_key_package.credential.signature_key()?,
        )?;

        Ok(pt)
    }
}
