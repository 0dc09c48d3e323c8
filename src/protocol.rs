//! Wire structures of the protocol and their codecs.  Every structure here
//! round-trips exactly through the TLS-presentation encoding in
//! [`crate::syntax`].

use crate::common::{Error, Result};
use crate::crypto::{
    CipherSuite, HpkeCiphertext, HpkePrivateKey, HpkePublicKey, Mac, Secret, Signature,
    SignaturePrivateKey, SignaturePublicKey,
};
use crate::io::{Read, Write};
use crate::syntax::{
    deserialize_opaque, deserialize_vector, serialize_opaque, serialize_vector, Deserialize,
    Serialize,
};
use crate::tree_math::LeafIndex;

use rand_core::CryptoRngCore;

pub mod consts {
    use super::ProtocolVersion;

    pub const SUPPORTED_VERSION: ProtocolVersion = ProtocolVersion(0x0001); // mls10

    pub const SIGNATURE_SCHEME_ED25519: u16 = 0x0807;

    // Extension type code points
    pub const EXTENSION_CAPABILITIES: u16 = 0x0001;
    pub const EXTENSION_LIFETIME: u16 = 0x0002;
    pub const EXTENSION_PARENT_HASH: u16 = 0x0004;
    pub const EXTENSION_RATCHET_TREE: u16 = 0x0005;

    // Content types
    pub const CONTENT_TYPE_APPLICATION: u8 = 1;
    pub const CONTENT_TYPE_PROPOSAL: u8 = 2;
    pub const CONTENT_TYPE_COMMIT: u8 = 3;

    // Proposal types
    pub const PROPOSAL_TYPE_ADD: u16 = 1;
    pub const PROPOSAL_TYPE_UPDATE: u16 = 2;
    pub const PROPOSAL_TYPE_REMOVE: u16 = 3;
    pub const PROPOSAL_TYPE_PSK: u16 = 4;
    pub const PROPOSAL_TYPE_REINIT: u16 = 5;
    pub const PROPOSAL_TYPE_EXTERNAL_INIT: u16 = 6;
    pub const PROPOSAL_TYPE_APP_ACK: u16 = 7;
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ProtocolVersion(pub u16);

impl Default for ProtocolVersion {
    fn default() -> Self {
        consts::SUPPORTED_VERSION
    }
}

impl Serialize for ProtocolVersion {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.0.serialize(writer)
    }
}

impl Deserialize for ProtocolVersion {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self(u16::deserialize(reader)?))
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Extension {
    pub extension_type: u16,
    pub extension_data: Vec<u8>,
}

impl Serialize for Extension {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.extension_type.serialize(writer)?;
        serialize_opaque::<4>(&self.extension_data, writer)
    }
}

impl Deserialize for Extension {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            extension_type: u16::deserialize(reader)?,
            extension_data: deserialize_opaque::<4>(reader)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Capabilities {
    pub versions: Vec<ProtocolVersion>,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
}

impl Capabilities {
    pub fn new(suite: CipherSuite) -> Self {
        Self {
            versions: vec![consts::SUPPORTED_VERSION],
            cipher_suites: vec![suite.id()],
            extensions: Vec::new(),
        }
    }
}

impl Serialize for Capabilities {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        serialize_vector::<1, _>(&self.versions, writer)?;
        serialize_vector::<1, _>(&self.cipher_suites, writer)?;
        serialize_vector::<1, _>(&self.extensions, writer)
    }
}

impl Deserialize for Capabilities {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            versions: deserialize_vector::<1, _>(reader)?,
            cipher_suites: deserialize_vector::<1, _>(reader)?,
            extensions: deserialize_vector::<1, _>(reader)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Lifetime {
    pub not_before: u64,
    pub not_after: u64,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self {
            not_before: u64::MIN,
            not_after: u64::MAX,
        }
    }
}

impl Serialize for Lifetime {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.not_before.serialize(writer)?;
        self.not_after.serialize(writer)
    }
}

impl Deserialize for Lifetime {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            not_before: u64::deserialize(reader)?,
            not_after: u64::deserialize(reader)?,
        })
    }
}

impl Extension {
    pub fn capabilities(capabilities: &Capabilities) -> Result<Self> {
        Ok(Self {
            extension_type: consts::EXTENSION_CAPABILITIES,
            extension_data: capabilities.to_vec()?,
        })
    }

    pub fn lifetime(lifetime: &Lifetime) -> Result<Self> {
        Ok(Self {
            extension_type: consts::EXTENSION_LIFETIME,
            extension_data: lifetime.to_vec()?,
        })
    }

    pub fn parent_hash(value: &[u8]) -> Self {
        Self {
            extension_type: consts::EXTENSION_PARENT_HASH,
            extension_data: value.to_vec(),
        }
    }

    pub fn ratchet_tree(serialized_tree: Vec<u8>) -> Self {
        Self {
            extension_type: consts::EXTENSION_RATCHET_TREE,
            extension_data: serialized_tree,
        }
    }
}

fn find_extension(extensions: &[Extension], extension_type: u16) -> Option<&[u8]> {
    extensions
        .iter()
        .find(|ext| ext.extension_type == extension_type)
        .map(|ext| ext.extension_data.as_slice())
}

///
/// Credentials
///

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BasicCredential {
    pub identity: Vec<u8>,
    pub signature_scheme: u16,
    pub public_key: SignaturePublicKey,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct X509Credential {
    /// DER certificates, leaf first.
    pub chain: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Credential {
    Basic(BasicCredential),
    X509(X509Credential),
}

impl Credential {
    pub fn basic(identity: &[u8], public_key: SignaturePublicKey) -> Self {
        Self::Basic(BasicCredential {
            identity: identity.to_vec(),
            signature_scheme: consts::SIGNATURE_SCHEME_ED25519,
            public_key,
        })
    }

    /// The verifying key asserted by this credential.  X.509 chains are
    /// evaluated by the certificate layer, outside this crate.
    pub fn signature_key(&self) -> Result<&SignaturePublicKey> {
        match self {
            Self::Basic(cred) => Ok(&cred.public_key),
            Self::X509(_) => Err(Error::NotImplemented("X.509 credential evaluation")),
        }
    }
}

impl Serialize for Credential {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        match self {
            Self::Basic(cred) => {
                1_u8.serialize(writer)?;
                serialize_opaque::<2>(&cred.identity, writer)?;
                cred.signature_scheme.serialize(writer)?;
                serialize_opaque::<2>(&cred.public_key.0, writer)
            }
            Self::X509(cred) => {
                2_u8.serialize(writer)?;
                let mut certs = Vec::new();
                for cert in &cred.chain {
                    serialize_opaque::<2>(cert, &mut certs)?;
                }
                serialize_opaque::<4>(&certs, writer)
            }
        }
    }
}

impl Deserialize for Credential {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        match u8::deserialize(reader)? {
            1 => Ok(Self::Basic(BasicCredential {
                identity: deserialize_opaque::<2>(reader)?,
                signature_scheme: u16::deserialize(reader)?,
                public_key: SignaturePublicKey(deserialize_opaque::<2>(reader)?),
            })),
            2 => {
                let certs = deserialize_opaque::<4>(reader)?;
                let mut certs_reader: &[u8] = &certs;
                let mut chain = Vec::new();
                while !certs_reader.is_empty() {
                    chain.push(deserialize_opaque::<2>(&mut certs_reader)?);
                }
                Ok(Self::X509(X509Credential { chain }))
            }
            _ => Err(Error::Protocol("unknown credential type")),
        }
    }
}

///
/// KeyPackage
///

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KeyPackage {
    pub version: ProtocolVersion,
    pub cipher_suite: CipherSuite,
    pub init_key: HpkePublicKey,
    pub credential: Credential,
    pub extensions: Vec<Extension>,
    pub signature: Signature,
}

const KEY_PACKAGE_SIGNATURE_LABEL: &[u8] = b"KeyPackageTBS";

impl KeyPackage {
    fn to_be_signed(&self) -> Result<Vec<u8>> {
        let mut tbs = Vec::new();
        self.version.serialize(&mut tbs)?;
        self.cipher_suite.serialize(&mut tbs)?;
        serialize_opaque::<2>(&self.init_key.0, &mut tbs)?;
        self.credential.serialize(&mut tbs)?;
        serialize_vector::<4, _>(&self.extensions, &mut tbs)?;
        Ok(tbs)
    }

    pub fn sign(&mut self, signature_priv: &SignaturePrivateKey) -> Result<()> {
        let tbs = self.to_be_signed()?;
        self.signature =
            self.cipher_suite
                .sign_with_label(&tbs, KEY_PACKAGE_SIGNATURE_LABEL, signature_priv)?;
        Ok(())
    }

    /// Verify the signature under the credential's own key.
    pub fn verify(&self) -> Result<()> {
        let tbs = self.to_be_signed()?;
        self.cipher_suite.verify_with_label(
            &tbs,
            KEY_PACKAGE_SIGNATURE_LABEL,
            &self.signature,
            self.credential.signature_key()?,
        )
    }

    /// Hash of the complete KeyPackage, used to address Welcome secrets and
    /// cached self-updates.
    pub fn hash(&self) -> Result<Vec<u8>> {
        self.cipher_suite
            .hash_ref(b"MLS 1.0 KeyPackage Reference", &self.to_vec()?)
    }

    pub fn parent_hash(&self) -> Option<&[u8]> {
        find_extension(&self.extensions, consts::EXTENSION_PARENT_HASH)
    }

    /// Replace (or install) the parent-hash extension.  The caller must
    /// re-sign afterwards.
    pub fn set_parent_hash(&mut self, value: &[u8]) {
        self.extensions
            .retain(|ext| ext.extension_type != consts::EXTENSION_PARENT_HASH);
        self.extensions.push(Extension::parent_hash(value));
    }
}

impl Serialize for KeyPackage {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.version.serialize(writer)?;
        self.cipher_suite.serialize(writer)?;
        serialize_opaque::<2>(&self.init_key.0, writer)?;
        self.credential.serialize(writer)?;
        serialize_vector::<4, _>(&self.extensions, writer)?;
        serialize_opaque::<2>(&self.signature.0, writer)
    }
}

impl Deserialize for KeyPackage {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            version: ProtocolVersion::deserialize(reader)?,
            cipher_suite: CipherSuite::deserialize(reader)?,
            init_key: HpkePublicKey(deserialize_opaque::<2>(reader)?),
            credential: Credential::deserialize(reader)?,
            extensions: deserialize_vector::<4, _>(reader)?,
            signature: Signature(deserialize_opaque::<2>(reader)?),
        })
    }
}

/// A freshly generated KeyPackage together with the private keys it commits
/// to.
#[derive(Clone, Debug)]
pub struct KeyPackageBundle {
    pub key_package: KeyPackage,
    pub init_priv: HpkePrivateKey,
    pub signature_priv: SignaturePrivateKey,
}

impl KeyPackageBundle {
    pub fn generate(
        rng: &mut impl CryptoRngCore,
        suite: CipherSuite,
        credential: Credential,
        signature_priv: &SignaturePrivateKey,
    ) -> Result<Self> {
        let (init_priv, init_key) = suite.hpke_generate(rng)?;

        let mut key_package = KeyPackage {
            version: consts::SUPPORTED_VERSION,
            cipher_suite: suite,
            init_key,
            credential,
            extensions: vec![
                Extension::capabilities(&Capabilities::new(suite))?,
                Extension::lifetime(&Lifetime::default())?,
            ],
            signature: Signature(Vec::new()),
        };
        key_package.sign(signature_priv)?;

        Ok(Self {
            key_package,
            init_priv,
            signature_priv: signature_priv.clone(),
        })
    }
}

///
/// GroupContext
///

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GroupContext {
    pub group_id: Vec<u8>,
    pub epoch: u64,
    pub tree_hash: Vec<u8>,
    pub confirmed_transcript_hash: Vec<u8>,
    pub extensions: Vec<Extension>,
}

impl Serialize for GroupContext {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        serialize_opaque::<1>(&self.group_id, writer)?;
        self.epoch.serialize(writer)?;
        serialize_opaque::<1>(&self.tree_hash, writer)?;
        serialize_opaque::<1>(&self.confirmed_transcript_hash, writer)?;
        serialize_vector::<4, _>(&self.extensions, writer)
    }
}

impl Deserialize for GroupContext {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            group_id: deserialize_opaque::<1>(reader)?,
            epoch: u64::deserialize(reader)?,
            tree_hash: deserialize_opaque::<1>(reader)?,
            confirmed_transcript_hash: deserialize_opaque::<1>(reader)?,
            extensions: deserialize_vector::<4, _>(reader)?,
        })
    }
}

///
/// UpdatePath
///

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UpdatePathNode {
    pub public_key: HpkePublicKey,
    pub encrypted_path_secret: Vec<HpkeCiphertext>,
}

impl Serialize for UpdatePathNode {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        serialize_opaque::<2>(&self.public_key.0, writer)?;
        serialize_vector::<4, _>(&self.encrypted_path_secret, writer)
    }
}

impl Deserialize for UpdatePathNode {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            public_key: HpkePublicKey(deserialize_opaque::<2>(reader)?),
            encrypted_path_secret: deserialize_vector::<4, _>(reader)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UpdatePath {
    pub leaf_key_package: KeyPackage,
    pub nodes: Vec<UpdatePathNode>,
}

impl Serialize for UpdatePath {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.leaf_key_package.serialize(writer)?;
        serialize_vector::<4, _>(&self.nodes, writer)
    }
}

impl Deserialize for UpdatePath {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            leaf_key_package: KeyPackage::deserialize(reader)?,
            nodes: deserialize_vector::<4, _>(reader)?,
        })
    }
}

///
/// Proposals and commits
///

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Sender {
    Member(LeafIndex),
}

impl Serialize for Sender {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        match self {
            Self::Member(index) => {
                1_u8.serialize(writer)?;
                index.serialize(writer)
            }
        }
    }
}

impl Deserialize for Sender {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        match u8::deserialize(reader)? {
            1 => Ok(Self::Member(LeafIndex::deserialize(reader)?)),
            2 | 3 => Err(Error::NotImplemented("non-member senders")),
            _ => Err(Error::Protocol("unknown sender type")),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Proposal {
    Add { key_package: KeyPackage },
    Update { key_package: KeyPackage },
    Remove { removed: LeafIndex },
}

impl Proposal {
    pub fn proposal_type(&self) -> u16 {
        match self {
            Self::Add { .. } => consts::PROPOSAL_TYPE_ADD,
            Self::Update { .. } => consts::PROPOSAL_TYPE_UPDATE,
            Self::Remove { .. } => consts::PROPOSAL_TYPE_REMOVE,
        }
    }
}

impl Serialize for Proposal {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.proposal_type().serialize(writer)?;
        match self {
            Self::Add { key_package } | Self::Update { key_package } => {
                key_package.serialize(writer)
            }
            Self::Remove { removed } => removed.serialize(writer),
        }
    }
}

impl Deserialize for Proposal {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        match u16::deserialize(reader)? {
            consts::PROPOSAL_TYPE_ADD => Ok(Self::Add {
                key_package: KeyPackage::deserialize(reader)?,
            }),
            consts::PROPOSAL_TYPE_UPDATE => Ok(Self::Update {
                key_package: KeyPackage::deserialize(reader)?,
            }),
            consts::PROPOSAL_TYPE_REMOVE => Ok(Self::Remove {
                removed: LeafIndex::deserialize(reader)?,
            }),
            consts::PROPOSAL_TYPE_PSK
            | consts::PROPOSAL_TYPE_REINIT
            | consts::PROPOSAL_TYPE_EXTERNAL_INIT
            | consts::PROPOSAL_TYPE_APP_ACK => {
                Err(Error::NotImplemented("optional proposal types"))
            }
            _ => Err(Error::Protocol("unknown proposal type")),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ProposalOrRef {
    Proposal(Proposal),
    Reference(Vec<u8>),
}

impl Serialize for ProposalOrRef {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        match self {
            Self::Proposal(proposal) => {
                1_u8.serialize(writer)?;
                proposal.serialize(writer)
            }
            Self::Reference(hash) => {
                2_u8.serialize(writer)?;
                serialize_opaque::<1>(hash, writer)
            }
        }
    }
}

impl Deserialize for ProposalOrRef {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        match u8::deserialize(reader)? {
            1 => Ok(Self::Proposal(Proposal::deserialize(reader)?)),
            2 => Ok(Self::Reference(deserialize_opaque::<1>(reader)?)),
            _ => Err(Error::Protocol("unknown proposal-or-ref type")),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Commit {
    pub proposals: Vec<ProposalOrRef>,
    pub path: Option<UpdatePath>,
}

impl Serialize for Commit {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        serialize_vector::<4, _>(&self.proposals, writer)?;
        self.path.serialize(writer)
    }
}

impl Deserialize for Commit {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            proposals: deserialize_vector::<4, _>(reader)?,
            path: Option::<UpdatePath>::deserialize(reader)?,
        })
    }
}

///
/// Message framing
///

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Content {
    Application(Vec<u8>),
    Proposal(Proposal),
    Commit(Commit),
}

impl Content {
    pub fn content_type(&self) -> u8 {
        match self {
            Self::Application(_) => consts::CONTENT_TYPE_APPLICATION,
            Self::Proposal(_) => consts::CONTENT_TYPE_PROPOSAL,
            Self::Commit(_) => consts::CONTENT_TYPE_COMMIT,
        }
    }

    /// Serialize the body alone; the content type travels separately in the
    /// enclosing framing.
    pub fn serialize_body(&self, writer: &mut impl Write) -> Result<()> {
        match self {
            Self::Application(data) => serialize_opaque::<4>(data, writer),
            Self::Proposal(proposal) => proposal.serialize(writer),
            Self::Commit(commit) => commit.serialize(writer),
        }
    }

    pub fn deserialize_body(content_type: u8, reader: &mut impl Read) -> Result<Self> {
        match content_type {
            consts::CONTENT_TYPE_APPLICATION => {
                Ok(Self::Application(deserialize_opaque::<4>(reader)?))
            }
            consts::CONTENT_TYPE_PROPOSAL => Ok(Self::Proposal(Proposal::deserialize(reader)?)),
            consts::CONTENT_TYPE_COMMIT => Ok(Self::Commit(Commit::deserialize(reader)?)),
            _ => Err(Error::InvalidParameter("unknown content type")),
        }
    }
}

impl Serialize for Content {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.content_type().serialize(writer)?;
        self.serialize_body(writer)
    }
}

impl Deserialize for Content {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        let content_type = u8::deserialize(reader)?;
        Self::deserialize_body(content_type, reader)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MlsPlaintext {
    pub group_id: Vec<u8>,
    pub epoch: u64,
    pub sender: Sender,
    pub authenticated_data: Vec<u8>,
    pub content: Content,
    pub signature: Signature,
    pub confirmation_tag: Option<Mac>,
    pub membership_tag: Option<Mac>,
}

const PLAINTEXT_SIGNATURE_LABEL: &[u8] = b"MLSPlaintextTBS";

impl MlsPlaintext {
    pub fn new(group_id: &[u8], epoch: u64, sender: LeafIndex, content: Content) -> Self {
        Self {
            group_id: group_id.to_vec(),
            epoch,
            sender: Sender::Member(sender),
            authenticated_data: Vec::new(),
            content,
            signature: Signature(Vec::new()),
            confirmation_tag: None,
            membership_tag: None,
        }
    }

    // struct {
    //     GroupContext group_context;
    //     opaque group_id<0..255>;
    //     uint64 epoch;
    //     Sender sender;
    //     opaque authenticated_data<0..2^32-1>;
    //     ContentType content_type;
    //     Content content;
    // } MLSPlaintextTBS;
    fn to_be_signed(&self, group_context: &GroupContext) -> Result<Vec<u8>> {
        let mut tbs = Vec::new();
        group_context.serialize(&mut tbs)?;
        serialize_opaque::<1>(&self.group_id, &mut tbs)?;
        self.epoch.serialize(&mut tbs)?;
        self.sender.serialize(&mut tbs)?;
        serialize_opaque::<4>(&self.authenticated_data, &mut tbs)?;
        self.content.serialize(&mut tbs)?;
        Ok(tbs)
    }

    pub fn sign(
        &mut self,
        suite: CipherSuite,
        group_context: &GroupContext,
        signature_priv: &SignaturePrivateKey,
    ) -> Result<()> {
        let tbs = self.to_be_signed(group_context)?;
        self.signature = suite.sign_with_label(&tbs, PLAINTEXT_SIGNATURE_LABEL, signature_priv)?;
        Ok(())
    }

    pub fn verify_signature(
        &self,
        suite: CipherSuite,
        group_context: &GroupContext,
        signature_key: &SignaturePublicKey,
    ) -> Result<()> {
        let tbs = self.to_be_signed(group_context)?;
        suite.verify_with_label(
            &tbs,
            PLAINTEXT_SIGNATURE_LABEL,
            &self.signature,
            signature_key,
        )
    }

    /// The bytes bound by the membership tag: the full plaintext minus the
    /// tag itself, followed by the group context.
    pub fn membership_input(&self, group_context: &GroupContext) -> Result<Vec<u8>> {
        let mut input = Vec::new();
        serialize_opaque::<1>(&self.group_id, &mut input)?;
        self.epoch.serialize(&mut input)?;
        self.sender.serialize(&mut input)?;
        serialize_opaque::<4>(&self.authenticated_data, &mut input)?;
        self.content.serialize(&mut input)?;
        serialize_opaque::<2>(&self.signature.0, &mut input)?;
        self.confirmation_tag.serialize(&mut input)?;
        group_context.serialize(&mut input)?;
        Ok(input)
    }

    // struct {
    //     opaque group_id<0..255>;
    //     uint64 epoch;
    //     Sender sender;
    //     ContentType content_type = commit;
    //     Commit commit;
    // } MLSPlaintextCommitContent;
    pub fn commit_content(&self) -> Result<Vec<u8>> {
        let Content::Commit(commit) = &self.content else {
            return Err(Error::InvalidParameter("message does not carry a commit"));
        };

        let mut content = Vec::new();
        serialize_opaque::<1>(&self.group_id, &mut content)?;
        self.epoch.serialize(&mut content)?;
        self.sender.serialize(&mut content)?;
        consts::CONTENT_TYPE_COMMIT.serialize(&mut content)?;
        commit.serialize(&mut content)?;
        Ok(content)
    }

    // struct {
    //     MAC confirmation_tag;
    //     opaque signature<0..2^16-1>;
    // } MLSPlaintextCommitAuthData;
    pub fn commit_auth_data(&self) -> Result<Vec<u8>> {
        let confirmation_tag = self
            .confirmation_tag
            .as_ref()
            .ok_or(Error::Protocol("commit without confirmation tag"))?;

        let mut auth_data = Vec::new();
        confirmation_tag.serialize(&mut auth_data)?;
        serialize_opaque::<2>(&self.signature.0, &mut auth_data)?;
        Ok(auth_data)
    }
}

impl Serialize for MlsPlaintext {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        serialize_opaque::<1>(&self.group_id, writer)?;
        self.epoch.serialize(writer)?;
        self.sender.serialize(writer)?;
        serialize_opaque::<4>(&self.authenticated_data, writer)?;
        self.content.serialize(writer)?;
        serialize_opaque::<2>(&self.signature.0, writer)?;
        self.confirmation_tag.serialize(writer)?;
        self.membership_tag.serialize(writer)
    }
}

impl Deserialize for MlsPlaintext {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            group_id: deserialize_opaque::<1>(reader)?,
            epoch: u64::deserialize(reader)?,
            sender: Sender::deserialize(reader)?,
            authenticated_data: deserialize_opaque::<4>(reader)?,
            content: Content::deserialize(reader)?,
            signature: Signature(deserialize_opaque::<2>(reader)?),
            confirmation_tag: Option::<Mac>::deserialize(reader)?,
            membership_tag: Option::<Mac>::deserialize(reader)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MlsCiphertext {
    pub group_id: Vec<u8>,
    pub epoch: u64,
    pub content_type: u8,
    pub authenticated_data: Vec<u8>,
    pub encrypted_sender_data: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl Serialize for MlsCiphertext {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        serialize_opaque::<1>(&self.group_id, writer)?;
        self.epoch.serialize(writer)?;
        self.content_type.serialize(writer)?;
        serialize_opaque::<4>(&self.authenticated_data, writer)?;
        serialize_opaque::<1>(&self.encrypted_sender_data, writer)?;
        serialize_opaque::<4>(&self.ciphertext, writer)
    }
}

impl Deserialize for MlsCiphertext {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            group_id: deserialize_opaque::<1>(reader)?,
            epoch: u64::deserialize(reader)?,
            content_type: u8::deserialize(reader)?,
            authenticated_data: deserialize_opaque::<4>(reader)?,
            encrypted_sender_data: deserialize_opaque::<1>(reader)?,
            ciphertext: deserialize_opaque::<4>(reader)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SenderData {
    pub sender: LeafIndex,
    pub generation: u32,
    pub reuse_guard: [u8; 4],
}

impl Serialize for SenderData {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.sender.serialize(writer)?;
        self.generation.serialize(writer)?;
        self.reuse_guard.serialize(writer)
    }
}

impl Deserialize for SenderData {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            sender: LeafIndex::deserialize(reader)?,
            generation: u32::deserialize(reader)?,
            reuse_guard: <[u8; 4]>::deserialize(reader)?,
        })
    }
}

// struct {
//     opaque group_id<0..255>;
//     uint64 epoch;
//     ContentType content_type;
// } MLSSenderDataAAD;
pub fn sender_data_aad(group_id: &[u8], epoch: u64, content_type: u8) -> Result<Vec<u8>> {
    let mut aad = Vec::new();
    serialize_opaque::<1>(group_id, &mut aad)?;
    epoch.serialize(&mut aad)?;
    content_type.serialize(&mut aad)?;
    Ok(aad)
}

// struct {
//     opaque group_id<0..255>;
//     uint64 epoch;
//     ContentType content_type;
//     opaque authenticated_data<0..2^32-1>;
// } MLSCiphertextContentAAD;
pub fn ciphertext_content_aad(
    group_id: &[u8],
    epoch: u64,
    content_type: u8,
    authenticated_data: &[u8],
) -> Result<Vec<u8>> {
    let mut aad = Vec::new();
    serialize_opaque::<1>(group_id, &mut aad)?;
    epoch.serialize(&mut aad)?;
    content_type.serialize(&mut aad)?;
    serialize_opaque::<4>(authenticated_data, &mut aad)?;
    Ok(aad)
}

/// The encrypted payload of an [`MlsCiphertext`]: the content body, the
/// signature, and (for commits) the confirmation tag.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CiphertextContent {
    pub content: Content,
    pub signature: Signature,
    pub confirmation_tag: Option<Mac>,
}

impl CiphertextContent {
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.content.serialize_body(&mut buffer)?;
        serialize_opaque::<2>(&self.signature.0, &mut buffer)?;
        self.confirmation_tag.serialize(&mut buffer)?;
        Ok(buffer)
    }

    pub fn from_slice(content_type: u8, data: &[u8]) -> Result<Self> {
        let mut reader: &[u8] = data;
        let value = Self {
            content: Content::deserialize_body(content_type, &mut reader)?,
            signature: Signature(deserialize_opaque::<2>(&mut reader)?),
            confirmation_tag: Option::<Mac>::deserialize(&mut reader)?,
        };

        if !reader.is_empty() {
            return Err(Error::Protocol("trailing bytes after encoded value"));
        }
        Ok(value)
    }
}

///
/// Welcome
///

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GroupInfo {
    pub group_context: GroupContext,
    pub extensions: Vec<Extension>,
    /// Carried so a joiner can continue the transcript chain without seeing
    /// the commit that produced this epoch.
    pub interim_transcript_hash: Vec<u8>,
    pub confirmation_tag: Mac,
    pub signer_index: LeafIndex,
    pub signature: Signature,
}

const GROUP_INFO_SIGNATURE_LABEL: &[u8] = b"GroupInfoTBS";

impl GroupInfo {
    fn to_be_signed(&self) -> Result<Vec<u8>> {
        let mut tbs = Vec::new();
        self.group_context.serialize(&mut tbs)?;
        serialize_vector::<4, _>(&self.extensions, &mut tbs)?;
        serialize_opaque::<1>(&self.interim_transcript_hash, &mut tbs)?;
        self.confirmation_tag.serialize(&mut tbs)?;
        self.signer_index.serialize(&mut tbs)?;
        Ok(tbs)
    }

    pub fn sign(&mut self, suite: CipherSuite, signature_priv: &SignaturePrivateKey) -> Result<()> {
        let tbs = self.to_be_signed()?;
        self.signature = suite.sign_with_label(&tbs, GROUP_INFO_SIGNATURE_LABEL, signature_priv)?;
        Ok(())
    }

    pub fn verify(&self, suite: CipherSuite, signature_key: &SignaturePublicKey) -> Result<()> {
        let tbs = self.to_be_signed()?;
        suite.verify_with_label(
            &tbs,
            GROUP_INFO_SIGNATURE_LABEL,
            &self.signature,
            signature_key,
        )
    }

    pub fn ratchet_tree_extension(&self) -> Option<&[u8]> {
        find_extension(&self.extensions, consts::EXTENSION_RATCHET_TREE)
    }
}

impl Serialize for GroupInfo {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.group_context.serialize(writer)?;
        serialize_vector::<4, _>(&self.extensions, writer)?;
        serialize_opaque::<1>(&self.interim_transcript_hash, writer)?;
        self.confirmation_tag.serialize(writer)?;
        self.signer_index.serialize(writer)?;
        serialize_opaque::<2>(&self.signature.0, writer)
    }
}

impl Deserialize for GroupInfo {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            group_context: GroupContext::deserialize(reader)?,
            extensions: deserialize_vector::<4, _>(reader)?,
            interim_transcript_hash: deserialize_opaque::<1>(reader)?,
            confirmation_tag: Mac::deserialize(reader)?,
            signer_index: LeafIndex::deserialize(reader)?,
            signature: Signature(deserialize_opaque::<2>(reader)?),
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GroupSecrets {
    pub joiner_secret: Secret,
    pub path_secret: Option<Secret>,
}

impl Serialize for GroupSecrets {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        serialize_opaque::<1>(self.joiner_secret.as_ref(), writer)?;
        match &self.path_secret {
            Some(secret) => {
                1_u8.serialize(writer)?;
                serialize_opaque::<1>(secret.as_ref(), writer)
            }
            None => 0_u8.serialize(writer),
        }
    }
}

impl Deserialize for GroupSecrets {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        let joiner_secret = Secret::from_bytes(deserialize_opaque::<1>(reader)?);
        let path_secret = match u8::deserialize(reader)? {
            0 => None,
            1 => Some(Secret::from_bytes(deserialize_opaque::<1>(reader)?)),
            _ => return Err(Error::Protocol("invalid optional marker")),
        };

        Ok(Self {
            joiner_secret,
            path_secret,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EncryptedGroupSecrets {
    pub key_package_hash: Vec<u8>,
    pub encrypted_group_secrets: HpkeCiphertext,
}

impl Serialize for EncryptedGroupSecrets {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        serialize_opaque::<1>(&self.key_package_hash, writer)?;
        self.encrypted_group_secrets.serialize(writer)
    }
}

impl Deserialize for EncryptedGroupSecrets {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            key_package_hash: deserialize_opaque::<1>(reader)?,
            encrypted_group_secrets: HpkeCiphertext::deserialize(reader)?,
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Welcome {
    pub version: ProtocolVersion,
    pub cipher_suite: CipherSuite,
    pub secrets: Vec<EncryptedGroupSecrets>,
    pub encrypted_group_info: Vec<u8>,
}

impl Serialize for Welcome {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.version.serialize(writer)?;
        self.cipher_suite.serialize(writer)?;
        serialize_vector::<4, _>(&self.secrets, writer)?;
        serialize_opaque::<4>(&self.encrypted_group_info, writer)
    }
}

impl Deserialize for Welcome {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            version: ProtocolVersion::deserialize(reader)?,
            cipher_suite: CipherSuite::deserialize(reader)?,
            secrets: deserialize_vector::<4, _>(reader)?,
            encrypted_group_info: deserialize_opaque::<4>(reader)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::thread_rng;

    const SUITE: CipherSuite = CipherSuite::X25519Aes128GcmSha256Ed25519;

    fn make_key_package(name: &[u8]) -> KeyPackageBundle {
        let mut rng = thread_rng();
        let (sig_priv, sig_key) = SUITE.sig_generate(&mut rng).unwrap();
        let credential = Credential::basic(name, sig_key);
        KeyPackageBundle::generate(&mut rng, SUITE, credential, &sig_priv).unwrap()
    }

    fn round_trip<T>(value: &T)
    where
        T: Serialize + Deserialize + PartialEq + core::fmt::Debug,
    {
        let encoded = value.to_vec().unwrap();
        let decoded = T::from_slice(&encoded).unwrap();
        assert_eq!(&decoded, value);
    }

    #[test]
    fn key_package_signs_and_round_trips() {
        let bundle = make_key_package(b"alice");
        bundle.key_package.verify().unwrap();
        round_trip(&bundle.key_package);

        // Tampering invalidates the signature
        let mut bad = bundle.key_package.clone();
        bad.init_key.0[0] ^= 0xff;
        assert!(bad.verify().is_err());
    }

    #[test]
    fn credential_round_trips() {
        let bundle = make_key_package(b"alice");
        round_trip(&bundle.key_package.credential);

        let x509 = Credential::X509(X509Credential {
            chain: vec![vec![0x30, 0x82], vec![0x30, 0x81]],
        });
        round_trip(&x509);
        assert!(matches!(
            x509.signature_key(),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    fn group_context_round_trips() {
        round_trip(&GroupContext {
            group_id: vec![0, 1],
            epoch: 7,
            tree_hash: vec![0xa0; 32],
            confirmed_transcript_hash: vec![0xb0; 32],
            extensions: vec![Extension {
                extension_type: 0x7777,
                extension_data: vec![1, 2, 3],
            }],
        });
    }

    #[test]
    fn proposal_round_trips() {
        let bundle = make_key_package(b"bob");

        round_trip(&Proposal::Add {
            key_package: bundle.key_package.clone(),
        });
        round_trip(&Proposal::Update {
            key_package: bundle.key_package.clone(),
        });
        round_trip(&Proposal::Remove {
            removed: LeafIndex(2),
        });
    }

    #[test]
    fn commit_round_trips() {
        round_trip(&Commit {
            proposals: vec![
                ProposalOrRef::Reference(vec![0xc0; 32]),
                ProposalOrRef::Proposal(Proposal::Remove {
                    removed: LeafIndex(1),
                }),
            ],
            path: None,
        });
    }

    #[test]
    fn plaintext_round_trips() {
        let mut pt = MlsPlaintext::new(
            &[0, 1],
            3,
            LeafIndex(0),
            Content::Application(b"hello".as_slice().to_vec()),
        );
        pt.signature = Signature(vec![0x5a; 64]);
        pt.membership_tag = Some(Mac(vec![0x88; 32]));
        round_trip(&pt);
    }

    #[test]
    fn ciphertext_round_trips() {
        round_trip(&MlsCiphertext {
            group_id: vec![0, 1],
            epoch: 3,
            content_type: consts::CONTENT_TYPE_APPLICATION,
            authenticated_data: Vec::new(),
            encrypted_sender_data: vec![0x11; 28],
            ciphertext: vec![0x22; 64],
        });
    }

    #[test]
    fn sender_data_round_trips() {
        round_trip(&SenderData {
            sender: LeafIndex(5),
            generation: 42,
            reuse_guard: [1, 2, 3, 4],
        });
    }

    #[test]
    fn group_secrets_round_trips() {
        round_trip(&GroupSecrets {
            joiner_secret: Secret::from_bytes(vec![0x33; 32]),
            path_secret: Some(Secret::from_bytes(vec![0x44; 32])),
        });
        round_trip(&GroupSecrets {
            joiner_secret: Secret::from_bytes(vec![0x33; 32]),
            path_secret: None,
        });
    }

    #[test]
    fn welcome_round_trips() {
        round_trip(&Welcome {
            version: consts::SUPPORTED_VERSION,
            cipher_suite: SUITE,
            secrets: vec![EncryptedGroupSecrets {
                key_package_hash: vec![0x55; 32],
                encrypted_group_secrets: HpkeCiphertext {
                    kem_output: vec![0x66; 32],
                    ciphertext: vec![0x77; 48],
                },
            }],
            encrypted_group_info: vec![0x99; 80],
        });
    }

    #[test]
    fn parent_hash_extension() {
        let mut bundle = make_key_package(b"carol");
        assert!(bundle.key_package.parent_hash().is_none());

        bundle.key_package.set_parent_hash(&[0xab; 32]);
        bundle
            .key_package
            .sign(&bundle.signature_priv.clone())
            .unwrap();
        assert_eq!(bundle.key_package.parent_hash(), Some([0xab; 32].as_ref()));
        bundle.key_package.verify().unwrap();
    }
}
