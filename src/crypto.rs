//! Cipher-suite capability bundle.  A [`CipherSuite`] value selects the KEM,
//! KDF, AEAD, digest, and signature scheme as a unit; all primitive
//! operations are methods on it, resolved once when a group state is
//! constructed.  There is deliberately no cipher-suite type parameter on the
//! rest of the engine.

use crate::common::{Error, Result};
use crate::io::{Read, Write};
use crate::syntax::{deserialize_opaque, serialize_opaque, Deserialize, Serialize};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes128Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac as _};
use rand_core::CryptoRngCore;
use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub mod consts {
    // https://www.iana.org/assignments/mls/mls.xhtml#mls-ciphersuites
    pub const MLS10_128_DHKEMX25519_AES128GCM_SHA256_ED25519: u16 = 0x0001;
    pub const MLS10_128_DHKEMP256_AES128GCM_SHA256_P256: u16 = 0x0002;
    pub const MLS10_128_DHKEMX25519_CHACHA20POLY1305_SHA256_ED25519: u16 = 0x0003;

    pub const X25519_KEY_SIZE: usize = 32;
    pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;
    pub const ED25519_KEYPAIR_SIZE: usize = 64;
    pub const ED25519_SIGNATURE_SIZE: usize = 64;
}

/// Key material with best-effort hygiene: zeroized on drop, redacted in debug
/// output, compared in constant time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn zero(len: usize) -> Self {
        Self(vec![0; len])
    }

    pub fn random(rng: &mut impl CryptoRngCore, len: usize) -> Self {
        let mut bytes = vec![0; len];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Secret {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Secret {}

impl core::fmt::Debug for Secret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Secret").field(&"***").finish()
    }
}

/// An authentication tag.  Compared in constant time.
#[derive(Clone, Default)]
pub struct Mac(pub Vec<u8>);

impl PartialEq for Mac {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Mac {}

impl core::fmt::Debug for Mac {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Mac").field(&hex_fmt(&self.0)).finish()
    }
}

impl Serialize for Mac {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        serialize_opaque::<1>(&self.0, writer)
    }
}

impl Deserialize for Mac {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self(deserialize_opaque::<1>(reader)?))
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct HpkePublicKey(pub Vec<u8>);

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HpkePrivateKey(Secret);

impl HpkePrivateKey {
    pub fn from_secret(secret: Secret) -> Self {
        Self(secret)
    }

    fn scalar(&self) -> Result<[u8; consts::X25519_KEY_SIZE]> {
        self.0
            .as_ref()
            .try_into()
            .map_err(|_| Error::InvalidParameter("malformed HPKE private key"))
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SignaturePublicKey(pub Vec<u8>);

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SignaturePrivateKey(Secret);

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Signature(pub Vec<u8>);

/// A single HPKE encryption: the encapsulated KEM output plus the AEAD
/// ciphertext produced under the derived key.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HpkeCiphertext {
    pub kem_output: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl Serialize for HpkeCiphertext {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        serialize_opaque::<2>(&self.kem_output, writer)?;
        serialize_opaque::<2>(&self.ciphertext, writer)
    }
}

impl Deserialize for HpkeCiphertext {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Ok(Self {
            kem_output: deserialize_opaque::<2>(reader)?,
            ciphertext: deserialize_opaque::<2>(reader)?,
        })
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CipherSuite {
    /// DHKEM(X25519, HKDF-SHA256) / AES-128-GCM / SHA-256 / Ed25519
    X25519Aes128GcmSha256Ed25519,
    /// DHKEM(X25519, HKDF-SHA256) / ChaCha20-Poly1305 / SHA-256 / Ed25519
    X25519ChaCha20Poly1305Sha256Ed25519,
}

impl TryFrom<u16> for CipherSuite {
    type Error = Error;

    fn try_from(id: u16) -> Result<Self> {
        match id {
            consts::MLS10_128_DHKEMX25519_AES128GCM_SHA256_ED25519 => {
                Ok(Self::X25519Aes128GcmSha256Ed25519)
            }
            consts::MLS10_128_DHKEMX25519_CHACHA20POLY1305_SHA256_ED25519 => {
                Ok(Self::X25519ChaCha20Poly1305Sha256Ed25519)
            }
            id => Err(Error::UnsupportedCipherSuite(id)),
        }
    }
}

impl Serialize for CipherSuite {
    fn serialize(&self, writer: &mut impl Write) -> Result<()> {
        self.id().serialize(writer)
    }
}

impl Deserialize for CipherSuite {
    fn deserialize(reader: &mut impl Read) -> Result<Self> {
        Self::try_from(u16::deserialize(reader)?)
    }
}

impl CipherSuite {
    pub fn id(&self) -> u16 {
        match self {
            Self::X25519Aes128GcmSha256Ed25519 => {
                consts::MLS10_128_DHKEMX25519_AES128GCM_SHA256_ED25519
            }
            Self::X25519ChaCha20Poly1305Sha256Ed25519 => {
                consts::MLS10_128_DHKEMX25519_CHACHA20POLY1305_SHA256_ED25519
            }
        }
    }

    pub fn hash_size(&self) -> usize {
        32
    }

    pub fn secret_size(&self) -> usize {
        self.hash_size()
    }

    pub fn aead_key_size(&self) -> usize {
        match self {
            Self::X25519Aes128GcmSha256Ed25519 => 16,
            Self::X25519ChaCha20Poly1305Sha256Ed25519 => 32,
        }
    }

    pub fn aead_nonce_size(&self) -> usize {
        12
    }

    ///
    /// Digest and MAC
    ///

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    pub fn hmac(&self, key: &[u8], data: &[u8]) -> Mac {
        let mut mac = <Hmac<Sha256> as hmac::Mac>::new_from_slice(key)
            .expect("HMAC accepts keys of any length");
        mac.update(data);
        Mac(mac.finalize().into_bytes().to_vec())
    }

    /// `ref = H(opaque label<0..255> || opaque value<0..2^32-1>)`, used for
    /// proposal references and KeyPackage hashes.
    pub fn hash_ref(&self, label: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        let mut input = Vec::new();
        serialize_opaque::<1>(label, &mut input)?;
        serialize_opaque::<4>(value, &mut input)?;
        Ok(self.digest(&input))
    }

    ///
    /// KDF
    ///

    pub fn hkdf_extract(&self, salt: &[u8], ikm: &[u8]) -> Secret {
        let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
        Secret(prk.to_vec())
    }

    pub fn hkdf_expand(&self, prk: &[u8], info: &[u8], length: usize) -> Result<Secret> {
        let hkdf = Hkdf::<Sha256>::from_prk(prk)
            .map_err(|_| Error::InvalidParameter("HKDF PRK too short"))?;
        let mut okm = vec![0; length];
        hkdf.expand(info, &mut okm)
            .map_err(|_| Error::InvalidParameter("HKDF output too long"))?;
        Ok(Secret(okm))
    }

    /// `expand_with_label(secret, label, context, length)` with the "mls10 "
    /// label prefix:
    ///
    /// ```text
    /// struct {
    ///     uint16 length;
    ///     opaque label<0..255> = "mls10 " + label;
    ///     opaque context<0..2^32-1>;
    /// } KDFLabel;
    /// ```
    pub fn expand_with_label(
        &self,
        secret: &Secret,
        label: &[u8],
        context: &[u8],
        length: usize,
    ) -> Result<Secret> {
        let mut full_label = b"mls10 ".as_slice().to_vec();
        full_label.extend_from_slice(label);

        let mut info = Vec::new();
        (length as u16).serialize(&mut info)?;
        serialize_opaque::<1>(&full_label, &mut info)?;
        serialize_opaque::<4>(context, &mut info)?;

        self.hkdf_expand(secret.as_ref(), &info, length)
    }

    /// `derive_secret(secret, label, context)` hashes the context before
    /// expanding, so arbitrarily large group contexts feed the KDF uniformly.
    pub fn derive_secret(&self, secret: &Secret, label: &[u8], context: &[u8]) -> Result<Secret> {
        let context_hash = self.digest(context);
        self.expand_with_label(secret, label, &context_hash, self.secret_size())
    }

    ///
    /// AEAD
    ///

    pub fn aead_seal(
        &self,
        key: &Secret,
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        if nonce.len() != self.aead_nonce_size() {
            return Err(Error::InvalidParameter("AEAD nonce length"));
        }

        let payload = Payload {
            msg: plaintext,
            aad,
        };

        match self {
            Self::X25519Aes128GcmSha256Ed25519 => Aes128Gcm::new_from_slice(key.as_ref())
                .map_err(|_| Error::InvalidParameter("AEAD key length"))?
                .encrypt(aes_gcm::Nonce::from_slice(nonce), payload)
                .map_err(|_| Error::Protocol("AEAD seal failed")),
            Self::X25519ChaCha20Poly1305Sha256Ed25519 => {
                ChaCha20Poly1305::new_from_slice(key.as_ref())
                    .map_err(|_| Error::InvalidParameter("AEAD key length"))?
                    .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                    .map_err(|_| Error::Protocol("AEAD seal failed"))
            }
        }
    }

    pub fn aead_open(
        &self,
        key: &Secret,
        nonce: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        if nonce.len() != self.aead_nonce_size() {
            return Err(Error::InvalidParameter("AEAD nonce length"));
        }

        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        match self {
            Self::X25519Aes128GcmSha256Ed25519 => Aes128Gcm::new_from_slice(key.as_ref())
                .map_err(|_| Error::InvalidParameter("AEAD key length"))?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
                .map_err(|_| Error::Protocol("AEAD open failure")),
            Self::X25519ChaCha20Poly1305Sha256Ed25519 => {
                ChaCha20Poly1305::new_from_slice(key.as_ref())
                    .map_err(|_| Error::InvalidParameter("AEAD key length"))?
                    .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                    .map_err(|_| Error::Protocol("AEAD open failure"))
            }
        }
    }

    ///
    /// HPKE (base mode, single shot)
    ///

    pub fn hpke_generate(
        &self,
        rng: &mut impl CryptoRngCore,
    ) -> Result<(HpkePrivateKey, HpkePublicKey)> {
        let raw_priv = StaticSecret::random_from_rng(&mut *rng);
        let raw_pub = PublicKey::from(&raw_priv);

        Ok((
            HpkePrivateKey(Secret(raw_priv.to_bytes().as_slice().to_vec())),
            HpkePublicKey(raw_pub.to_bytes().as_slice().to_vec()),
        ))
    }

    /// Derive an HPKE keypair deterministically from a secret, as TreeKEM
    /// does for every node along an update path.
    pub fn hpke_derive(&self, seed: &Secret) -> Result<(HpkePrivateKey, HpkePublicKey)> {
        let scalar: [u8; consts::X25519_KEY_SIZE] = seed
            .as_ref()
            .try_into()
            .map_err(|_| Error::InvalidParameter("HPKE derivation seed length"))?;

        let raw_priv = StaticSecret::from(scalar);
        let raw_pub = PublicKey::from(&raw_priv);

        Ok((
            HpkePrivateKey(Secret(raw_priv.to_bytes().as_slice().to_vec())),
            HpkePublicKey(raw_pub.to_bytes().as_slice().to_vec()),
        ))
    }

    pub fn hpke_priv_to_pub(&self, encryption_priv: &HpkePrivateKey) -> Result<HpkePublicKey> {
        let raw_priv = StaticSecret::from(encryption_priv.scalar()?);
        Ok(HpkePublicKey(PublicKey::from(&raw_priv).to_bytes().as_slice().to_vec()))
    }

    pub fn hpke_seal(
        &self,
        rng: &mut impl CryptoRngCore,
        encryption_key: &HpkePublicKey,
        info: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<HpkeCiphertext> {
        let pk_r_bytes: [u8; consts::X25519_KEY_SIZE] = encryption_key
            .0
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidParameter("malformed HPKE public key"))?;
        let pk_r = PublicKey::from(pk_r_bytes);

        let sk_e = StaticSecret::random_from_rng(&mut *rng);
        let enc = PublicKey::from(&sk_e).to_bytes();
        let dh = sk_e.diffie_hellman(&pk_r);

        let mut kem_context = enc.as_slice().to_vec();
        kem_context.extend_from_slice(&pk_r_bytes);

        let shared_secret = hpke::extract_and_expand(self, dh.as_bytes(), &kem_context)?;
        let (key, nonce) = hpke::key_schedule(self, &shared_secret, info)?;

        let ciphertext = self.aead_seal(&key, nonce.as_ref(), aad, plaintext)?;
        Ok(HpkeCiphertext {
            kem_output: enc.as_slice().to_vec(),
            ciphertext,
        })
    }

    pub fn hpke_open(
        &self,
        encryption_priv: &HpkePrivateKey,
        ct: &HpkeCiphertext,
        info: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        let enc: [u8; consts::X25519_KEY_SIZE] = ct
            .kem_output
            .as_slice()
            .try_into()
            .map_err(|_| Error::Protocol("malformed KEM output"))?;

        let sk_r = StaticSecret::from(encryption_priv.scalar()?);
        let pk_r = PublicKey::from(&sk_r);
        let dh = sk_r.diffie_hellman(&PublicKey::from(enc));

        let mut kem_context = enc.as_slice().to_vec();
        kem_context.extend_from_slice(pk_r.as_bytes());

        let shared_secret = hpke::extract_and_expand(self, dh.as_bytes(), &kem_context)?;
        let (key, nonce) = hpke::key_schedule(self, &shared_secret, info)?;

        self.aead_open(&key, nonce.as_ref(), aad, &ct.ciphertext)
    }

    ///
    /// Signatures
    ///

    pub fn sig_generate(
        &self,
        rng: &mut impl CryptoRngCore,
    ) -> Result<(SignaturePrivateKey, SignaturePublicKey)> {
        let raw_priv = SigningKey::generate(rng);
        let raw_pub = raw_priv.verifying_key();

        Ok((
            SignaturePrivateKey(Secret(raw_priv.to_keypair_bytes().as_slice().to_vec())),
            SignaturePublicKey(raw_pub.to_bytes().as_slice().to_vec()),
        ))
    }

    /// Sign the digest of `SignContent { label, message }`.
    pub fn sign_with_label(
        &self,
        message: &[u8],
        label: &[u8],
        signature_priv: &SignaturePrivateKey,
    ) -> Result<Signature> {
        let keypair_bytes: [u8; consts::ED25519_KEYPAIR_SIZE] = signature_priv
            .0
            .as_ref()
            .try_into()
            .map_err(|_| Error::InvalidParameter("malformed signature private key"))?;
        let raw_priv = SigningKey::from_keypair_bytes(&keypair_bytes)
            .map_err(|_| Error::InvalidParameter("malformed signature private key"))?;

        let digest = self.signature_digest(message, label)?;
        let raw_sig = raw_priv.sign(&digest);
        Ok(Signature(raw_sig.to_bytes().as_slice().to_vec()))
    }

    pub fn verify_with_label(
        &self,
        message: &[u8],
        label: &[u8],
        signature: &Signature,
        signature_key: &SignaturePublicKey,
    ) -> Result<()> {
        let key_bytes: [u8; consts::ED25519_PUBLIC_KEY_SIZE] = signature_key
            .0
            .as_slice()
            .try_into()
            .map_err(|_| Error::Protocol("malformed signature public key"))?;
        let raw_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| Error::Protocol("malformed signature public key"))?;

        let sig_bytes: [u8; consts::ED25519_SIGNATURE_SIZE] = signature
            .0
            .as_slice()
            .try_into()
            .map_err(|_| Error::Protocol("malformed signature"))?;
        let raw_sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);

        let digest = self.signature_digest(message, label)?;
        raw_key
            .verify(&digest, &raw_sig)
            .map_err(|_| Error::Protocol("invalid signature"))
    }

    // struct {
    //     opaque label<0..255>;
    //     opaque content<0..2^32-1>;
    // } SignContent;
    fn signature_digest(&self, message: &[u8], label: &[u8]) -> Result<Vec<u8>> {
        let mut input = Vec::new();
        serialize_opaque::<1>(label, &mut input)?;
        serialize_opaque::<4>(message, &mut input)?;
        Ok(self.digest(&input))
    }
}

mod hpke {
    //! RFC 9180 DHKEM(X25519, HKDF-SHA256) plumbing, base mode only.

    use super::{CipherSuite, Result, Secret, Serialize as _};

    // 0x0020 = DHKEM(X25519, HKDF-SHA256)
    const KEM_SUITE_ID: &[u8] = b"KEM\x00\x20";

    const MODE_BASE: u8 = 0x00;
    const KDF_HKDF_SHA256: u16 = 0x0001;

    fn aead_id(suite: &CipherSuite) -> u16 {
        match suite {
            CipherSuite::X25519Aes128GcmSha256Ed25519 => 0x0001,
            CipherSuite::X25519ChaCha20Poly1305Sha256Ed25519 => 0x0003,
        }
    }

    // suite_id = concat("HPKE", kem_id, kdf_id, aead_id)
    fn full_suite_id(suite: &CipherSuite) -> Result<Vec<u8>> {
        let mut id = b"HPKE\x00\x20".as_slice().to_vec();
        KDF_HKDF_SHA256.serialize(&mut id)?;
        aead_id(suite).serialize(&mut id)?;
        Ok(id)
    }

    fn labeled_extract(
        suite: &CipherSuite,
        suite_id: &[u8],
        salt: &[u8],
        label: &[u8],
        ikm: &[u8],
    ) -> Secret {
        let mut labeled_ikm = b"HPKE-v1".as_slice().to_vec();
        labeled_ikm.extend_from_slice(suite_id);
        labeled_ikm.extend_from_slice(label);
        labeled_ikm.extend_from_slice(ikm);
        suite.hkdf_extract(salt, &labeled_ikm)
    }

    fn labeled_expand(
        suite: &CipherSuite,
        suite_id: &[u8],
        prk: &Secret,
        label: &[u8],
        info: &[u8],
        len: usize,
    ) -> Result<Secret> {
        let mut labeled_info = Vec::new();
        (len as u16).serialize(&mut labeled_info)?;
        labeled_info.extend_from_slice(b"HPKE-v1");
        labeled_info.extend_from_slice(suite_id);
        labeled_info.extend_from_slice(label);
        labeled_info.extend_from_slice(info);
        suite.hkdf_expand(prk.as_ref(), &labeled_info, len)
    }

    pub fn extract_and_expand(
        suite: &CipherSuite,
        dh: &[u8],
        kem_context: &[u8],
    ) -> Result<Secret> {
        let eae_prk = labeled_extract(suite, KEM_SUITE_ID, b"", b"eae_prk", dh);
        labeled_expand(
            suite,
            KEM_SUITE_ID,
            &eae_prk,
            b"shared_secret",
            kem_context,
            suite.hash_size(),
        )
    }

    pub fn key_schedule(
        suite: &CipherSuite,
        shared_secret: &Secret,
        info: &[u8],
    ) -> Result<(Secret, Secret)> {
        let suite_id = full_suite_id(suite)?;

        let psk_id_hash = labeled_extract(suite, &suite_id, b"", b"psk_id_hash", b"");
        let info_hash = labeled_extract(suite, &suite_id, b"", b"info_hash", info);

        let mut key_schedule_context = vec![MODE_BASE];
        key_schedule_context.extend_from_slice(psk_id_hash.as_ref());
        key_schedule_context.extend_from_slice(info_hash.as_ref());

        let secret = labeled_extract(suite, &suite_id, shared_secret.as_ref(), b"secret", b"");

        let key = labeled_expand(
            suite,
            &suite_id,
            &secret,
            b"key",
            &key_schedule_context,
            suite.aead_key_size(),
        )?;
        let base_nonce = labeled_expand(
            suite,
            &suite_id,
            &secret,
            b"base_nonce",
            &key_schedule_context,
            suite.aead_nonce_size(),
        )?;

        Ok((key, base_nonce))
    }
}

fn hex_fmt(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    use hex_literal::hex;
    use rand::thread_rng;

    const SUITE: CipherSuite = CipherSuite::X25519Aes128GcmSha256Ed25519;

    #[test]
    fn suite_ids_round_trip() {
        assert_eq!(CipherSuite::try_from(0x0001).unwrap().id(), 0x0001);
        assert_eq!(CipherSuite::try_from(0x0003).unwrap().id(), 0x0003);
        assert!(matches!(
            CipherSuite::try_from(0x0002),
            Err(Error::UnsupportedCipherSuite(0x0002))
        ));
    }

    #[test]
    fn expand_with_label_is_deterministic() {
        let secret = Secret::zero(SUITE.hash_size());
        let a = SUITE
            .expand_with_label(&secret, b"path", b"", SUITE.hash_size())
            .unwrap();
        let b = SUITE
            .expand_with_label(&secret, b"path", b"", SUITE.hash_size())
            .unwrap();
        let c = SUITE
            .expand_with_label(&secret, b"node", b"", SUITE.hash_size())
            .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hmac_known_answer() {
        // RFC 4231 test case 2
        let tag = SUITE.hmac(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            tag.0,
            hex!("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
        );
    }

    #[test]
    fn aead_round_trip() {
        let key = Secret::zero(SUITE.aead_key_size());
        let nonce = vec![0; SUITE.aead_nonce_size()];

        let ct = SUITE.aead_seal(&key, &nonce, b"aad", b"hello").unwrap();
        let pt = SUITE.aead_open(&key, &nonce, b"aad", &ct).unwrap();
        assert_eq!(pt, b"hello");

        assert!(SUITE.aead_open(&key, &nonce, b"other", &ct).is_err());
    }

    #[test]
    fn hpke_round_trip() {
        let mut rng = thread_rng();
        let (sk, pk) = SUITE.hpke_generate(&mut rng).unwrap();

        let ct = SUITE
            .hpke_seal(&mut rng, &pk, b"info", b"aad", b"path secret")
            .unwrap();
        let pt = SUITE.hpke_open(&sk, &ct, b"info", b"aad").unwrap();
        assert_eq!(pt, b"path secret");

        assert!(SUITE.hpke_open(&sk, &ct, b"wrong info", b"aad").is_err());
    }

    #[test]
    fn hpke_derive_matches_priv_to_pub() {
        let seed = Secret::from_bytes(vec![0x42; 32]);
        let (sk, pk) = SUITE.hpke_derive(&seed).unwrap();
        assert_eq!(SUITE.hpke_priv_to_pub(&sk).unwrap(), pk);
    }

    #[test]
    fn sign_verify() {
        let mut rng = thread_rng();
        let (sig_priv, sig_key) = SUITE.sig_generate(&mut rng).unwrap();

        let sig = SUITE
            .sign_with_label(b"message", b"TestLabel", &sig_priv)
            .unwrap();
        SUITE
            .verify_with_label(b"message", b"TestLabel", &sig, &sig_key)
            .unwrap();

        assert!(SUITE
            .verify_with_label(b"message", b"OtherLabel", &sig, &sig_key)
            .is_err());
        assert!(SUITE
            .verify_with_label(b"other message", b"TestLabel", &sig, &sig_key)
            .is_err());
    }

    #[test]
    fn secret_compares_and_redacts() {
        let a = Secret::from_bytes(vec![1, 2, 3]);
        let b = Secret::from_bytes(vec![1, 2, 3]);
        let c = Secret::from_bytes(vec![1, 2, 4]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(format!("{a:?}"), "Secret(\"***\")");
    }
}
