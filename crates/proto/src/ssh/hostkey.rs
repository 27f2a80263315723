//! SSH public-key algorithms for host and user keys (RFC 4253 Section 6.6).
//!
//! Keys are modelled as two capabilities:
//! - [`Verifiable`]: a name, the SSH public blob, and signature checking
//! - [`Signable`]: additionally produces SSH signature blobs
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - EdDSA over Curve25519
//! - `ssh-rsa` - RSA PKCS#1 v1.5; signatures are SHA-1, verification also
//!   accepts `rsa-sha2-256` and `rsa-sha2-512`
//! - `ssh-dss` - DSA over SHA-1
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::hostkey::{Ed25519Key, PublicKey, Signable, Verifiable};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let key = Ed25519Key::generate();
//! let sig = key.sign_ssh_data(b"data to sign")?;
//!
//! let public = PublicKey::from_blob(&key.public_blob())?;
//! assert!(public.verify_ssh_sig(b"data to sign", &sig)?);
//! assert!(public.fingerprint().starts_with("SHA256:"));
//! # Ok(())
//! # }
//! ```

use crate::ssh::message::Message;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use kestrel_platform::{KestrelError, KestrelResult};
use num_bigint::{BigUint, RandBigInt};
use ring::signature::{
    RsaPublicKeyComponents, RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// DSS signatures carry r and s as two fixed 20-byte fields.
const DSS_SIG_COMPONENT_LEN: usize = 20;

/// A key that can check SSH signatures.
pub trait Verifiable: Send + Sync {
    /// Algorithm name, e.g. `ssh-ed25519`.
    fn name(&self) -> &'static str;

    /// Public key in SSH wire format (`string name` + key fields).
    fn public_blob(&self) -> Vec<u8>;

    /// Checks an SSH signature blob over `data`.
    ///
    /// Returns `Ok(false)` for a well-formed signature that does not match,
    /// or one made with a different algorithm.
    fn verify_ssh_sig(&self, data: &[u8], sig: &[u8]) -> KestrelResult<bool>;

    /// `SHA256:<base64>` fingerprint of the public blob.
    fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.public_blob());
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
        )
    }
}

/// A private key that can sign.
pub trait Signable: Verifiable {
    /// Signs `data`, returning `string name || string signature`.
    fn sign_ssh_data(&self, data: &[u8]) -> KestrelResult<Vec<u8>>;
}

/// Any supported public key, parsed from its SSH blob.
#[derive(Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Ed25519 point
    Ed25519([u8; 32]),
    /// RSA modulus and exponent
    Rsa {
        /// Public exponent
        e: BigUint,
        /// Modulus
        n: BigUint,
    },
    /// DSA domain parameters and public value
    Dss {
        /// Prime modulus
        p: BigUint,
        /// Subgroup order
        q: BigUint,
        /// Generator
        g: BigUint,
        /// Public value g^x mod p
        y: BigUint,
    },
}

impl PublicKey {
    /// Parses an SSH public key blob.
    ///
    /// # Errors
    ///
    /// [`KestrelError::Security`] for unknown key types or malformed fields.
    pub fn from_blob(blob: &[u8]) -> KestrelResult<Self> {
        let mut m = Message::from_bytes(blob);
        let kind = m.get_text()?;
        match kind.as_str() {
            "ssh-ed25519" => {
                let raw = m.get_string()?;
                let point: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                    KestrelError::Security("Ed25519 public key must be 32 bytes".to_string())
                })?;
                Ok(PublicKey::Ed25519(point))
            }
            "ssh-rsa" => {
                let e = m.get_mpint()?;
                let n = m.get_mpint()?;
                Ok(PublicKey::Rsa { e, n })
            }
            "ssh-dss" => {
                let p = m.get_mpint()?;
                let q = m.get_mpint()?;
                let g = m.get_mpint()?;
                let y = m.get_mpint()?;
                if !dss_params_valid(&p, &q, &g, &y) {
                    return Err(KestrelError::Security(
                        "Invalid DSA key parameters".to_string(),
                    ));
                }
                Ok(PublicKey::Dss { p, q, g, y })
            }
            other => Err(KestrelError::Security(format!(
                "Unsupported public key type: {}",
                other
            ))),
        }
    }

    /// Key size in bits.
    pub fn bits(&self) -> u64 {
        match self {
            PublicKey::Ed25519(_) => 256,
            PublicKey::Rsa { n, .. } => n.bits(),
            PublicKey::Dss { p, .. } => p.bits(),
        }
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.name())
            .field("bits", &self.bits())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Splits `string name || string sig`, checking the name.
fn split_signature(sig: &[u8], expected: &[&str]) -> KestrelResult<Option<(String, Vec<u8>)>> {
    let mut m = Message::from_bytes(sig);
    let kind = m.get_text()?;
    if !expected.contains(&kind.as_str()) {
        return Ok(None);
    }
    let raw = m.get_string()?;
    Ok(Some((kind, raw)))
}

fn encode_signature(name: &str, raw: &[u8]) -> Vec<u8> {
    let mut m = Message::new();
    m.add_string(name).add_string(raw);
    m.into_bytes()
}

/// Rejects domain parameters that would make the modular arithmetic degenerate.
fn dss_params_valid(p: &BigUint, q: &BigUint, g: &BigUint, y: &BigUint) -> bool {
    let two = BigUint::from(2u32);
    *p >= two && *q >= two && *g >= two && *y >= two && q < p && g < p && y < p
}

fn dss_verify(
    p: &BigUint,
    q: &BigUint,
    g: &BigUint,
    y: &BigUint,
    data: &[u8],
    sig: &[u8],
) -> KestrelResult<bool> {
    if !dss_params_valid(p, q, g, y) {
        return Ok(false);
    }
    let raw = if sig.len() == 2 * DSS_SIG_COMPONENT_LEN {
        // Some peers omit the string header
        sig.to_vec()
    } else {
        match split_signature(sig, &["ssh-dss"])? {
            Some((_, raw)) => raw,
            None => return Ok(false),
        }
    };
    if raw.len() != 2 * DSS_SIG_COMPONENT_LEN {
        return Ok(false);
    }

    let zero = BigUint::from(0u32);
    let r = BigUint::from_bytes_be(&raw[..DSS_SIG_COMPONENT_LEN]);
    let s = BigUint::from_bytes_be(&raw[DSS_SIG_COMPONENT_LEN..]);
    if r == zero || &r >= q || s == zero || &s >= q {
        return Ok(false);
    }

    let m = BigUint::from_bytes_be(&Sha1::digest(data));
    // q is prime, so s^(q-2) is the inverse
    let w = s.modpow(&(q - 2u32), q);
    let u1 = (&m * &w) % q;
    let u2 = (&r * &w) % q;
    let v = ((g.modpow(&u1, p) * y.modpow(&u2, p)) % p) % q;
    Ok(v == r)
}

impl Verifiable for PublicKey {
    fn name(&self) -> &'static str {
        match self {
            PublicKey::Ed25519(_) => "ssh-ed25519",
            PublicKey::Rsa { .. } => "ssh-rsa",
            PublicKey::Dss { .. } => "ssh-dss",
        }
    }

    fn public_blob(&self) -> Vec<u8> {
        let mut m = Message::new();
        m.add_string(self.name());
        match self {
            PublicKey::Ed25519(point) => {
                m.add_string(point);
            }
            PublicKey::Rsa { e, n } => {
                m.add_mpint(e).add_mpint(n);
            }
            PublicKey::Dss { p, q, g, y } => {
                m.add_mpint(p).add_mpint(q).add_mpint(g).add_mpint(y);
            }
        }
        m.into_bytes()
    }

    fn verify_ssh_sig(&self, data: &[u8], sig: &[u8]) -> KestrelResult<bool> {
        match self {
            PublicKey::Ed25519(point) => {
                let Some((_, raw)) = split_signature(sig, &["ssh-ed25519"])? else {
                    return Ok(false);
                };
                let key = VerifyingKey::from_bytes(point).map_err(|e| {
                    KestrelError::Security(format!("Invalid Ed25519 public key: {}", e))
                })?;
                let raw: [u8; 64] = match raw.as_slice().try_into() {
                    Ok(raw) => raw,
                    Err(_) => return Ok(false),
                };
                Ok(key.verify(data, &Signature::from_bytes(&raw)).is_ok())
            }
            PublicKey::Rsa { e, n } => {
                let Some((kind, raw)) =
                    split_signature(sig, &["ssh-rsa", "rsa-sha2-256", "rsa-sha2-512"])?
                else {
                    return Ok(false);
                };
                let params = match kind.as_str() {
                    "rsa-sha2-256" => &RSA_PKCS1_2048_8192_SHA256,
                    "rsa-sha2-512" => &RSA_PKCS1_2048_8192_SHA512,
                    _ => &RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY,
                };
                let components = RsaPublicKeyComponents {
                    n: n.to_bytes_be(),
                    e: e.to_bytes_be(),
                };
                Ok(components.verify(params, data, &raw).is_ok())
            }
            PublicKey::Dss { p, q, g, y } => dss_verify(p, q, g, y, data, sig),
        }
    }
}

/// Ed25519 private key (`ssh-ed25519`).
#[derive(Clone)]
pub struct Ed25519Key {
    signing_key: SigningKey,
}

impl Ed25519Key {
    /// Generates a new key pair.
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        let secret_bytes: [u8; SECRET_KEY_LENGTH] = rand::Rng::gen(&mut csprng);
        Self {
            signing_key: SigningKey::from_bytes(&secret_bytes),
        }
    }

    /// Creates from a 32-byte secret.
    pub fn from_bytes(secret_bytes: &[u8]) -> KestrelResult<Self> {
        let key_bytes: [u8; 32] = secret_bytes.try_into().map_err(|_| {
            KestrelError::Security("Ed25519 secret key must be 32 bytes".to_string())
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::Ed25519(self.signing_key.verifying_key().to_bytes())
    }
}

impl Verifiable for Ed25519Key {
    fn name(&self) -> &'static str {
        "ssh-ed25519"
    }

    fn public_blob(&self) -> Vec<u8> {
        self.public_key().public_blob()
    }

    fn verify_ssh_sig(&self, data: &[u8], sig: &[u8]) -> KestrelResult<bool> {
        self.public_key().verify_ssh_sig(data, sig)
    }
}

impl Signable for Ed25519Key {
    fn sign_ssh_data(&self, data: &[u8]) -> KestrelResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        Ok(encode_signature("ssh-ed25519", &signature.to_bytes()))
    }
}

impl std::fmt::Debug for Ed25519Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Key")
            .field(
                "public_key",
                &hex::encode(self.signing_key.verifying_key().as_bytes()),
            )
            .finish_non_exhaustive()
    }
}

/// RSA private key (`ssh-rsa`).
///
/// Signs with SHA-1 as `ssh-rsa` requires; ring cannot produce those, so
/// signing goes through the `rsa` crate.
pub struct RsaKey {
    key: RsaPrivateKey,
}

impl RsaKey {
    /// Generates a key of `bits` bits.
    pub fn generate(bits: usize) -> KestrelResult<Self> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| KestrelError::Security(format!("RSA key generation failed: {}", e)))?;
        Ok(Self { key })
    }

    /// Wraps an existing private key.
    pub fn from_private_key(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::Rsa {
            e: BigUint::from_bytes_be(&self.key.e().to_bytes_be()),
            n: BigUint::from_bytes_be(&self.key.n().to_bytes_be()),
        }
    }
}

impl Verifiable for RsaKey {
    fn name(&self) -> &'static str {
        "ssh-rsa"
    }

    fn public_blob(&self) -> Vec<u8> {
        self.public_key().public_blob()
    }

    fn verify_ssh_sig(&self, data: &[u8], sig: &[u8]) -> KestrelResult<bool> {
        self.public_key().verify_ssh_sig(data, sig)
    }
}

impl Signable for RsaKey {
    fn sign_ssh_data(&self, data: &[u8]) -> KestrelResult<Vec<u8>> {
        let hashed = Sha1::digest(data);
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &hashed)
            .map_err(|e| KestrelError::Security(format!("RSA signing failed: {}", e)))?;
        Ok(encode_signature("ssh-rsa", &signature))
    }
}

impl std::fmt::Debug for RsaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKey")
            .field("key_size_bits", &(self.key.size() * 8))
            .finish_non_exhaustive()
    }
}

/// DSA private key (`ssh-dss`).
pub struct DssKey {
    p: BigUint,
    q: BigUint,
    g: BigUint,
    y: BigUint,
    x: BigUint,
}

impl DssKey {
    /// Builds a key from its domain parameters and private exponent.
    pub fn from_components(
        p: BigUint,
        q: BigUint,
        g: BigUint,
        y: BigUint,
        x: BigUint,
    ) -> KestrelResult<Self> {
        if !dss_params_valid(&p, &q, &g, &y) || g.modpow(&x, &p) != y {
            return Err(KestrelError::Security(
                "DSA key components are inconsistent".to_string(),
            ));
        }
        Ok(Self { p, q, g, y, x })
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::Dss {
            p: self.p.clone(),
            q: self.q.clone(),
            g: self.g.clone(),
            y: self.y.clone(),
        }
    }
}

fn left_pad(bytes: Vec<u8>, len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes;
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

impl Verifiable for DssKey {
    fn name(&self) -> &'static str {
        "ssh-dss"
    }

    fn public_blob(&self) -> Vec<u8> {
        self.public_key().public_blob()
    }

    fn verify_ssh_sig(&self, data: &[u8], sig: &[u8]) -> KestrelResult<bool> {
        dss_verify(&self.p, &self.q, &self.g, &self.y, data, sig)
    }
}

impl Signable for DssKey {
    fn sign_ssh_data(&self, data: &[u8]) -> KestrelResult<Vec<u8>> {
        let (p, q, g, x) = (&self.p, &self.q, &self.g, &self.x);
        let m = BigUint::from_bytes_be(&Sha1::digest(data));
        let two = BigUint::from(2u32);
        let zero = BigUint::from(0u32);
        let mut rng = rand::thread_rng();

        let (r, s) = loop {
            // k in (2, q)
            let k = rng.gen_biguint_below(q);
            if k <= two {
                continue;
            }
            let r = g.modpow(&k, p) % q;
            if r == zero {
                continue;
            }
            let k_inv = k.modpow(&(q - 2u32), q);
            let s = (k_inv * ((&m + x * &r) % q)) % q;
            if s == zero {
                continue;
            }
            break (r, s);
        };

        let mut raw = left_pad(r.to_bytes_be(), DSS_SIG_COMPONENT_LEN);
        raw.extend_from_slice(&left_pad(s.to_bytes_be(), DSS_SIG_COMPONENT_LEN));
        Ok(encode_signature("ssh-dss", &raw))
    }
}

impl std::fmt::Debug for DssKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DssKey")
            .field("bits", &self.p.bits())
            .finish_non_exhaustive()
    }
}
