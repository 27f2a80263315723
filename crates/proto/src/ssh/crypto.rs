//! SSH symmetric primitives.
//!
//! This module wraps the per-direction objects the packetizer installs after
//! key exchange:
//! - AES-128/256 in CTR and CBC mode (RFC 4344, RFC 4253 Section 6.3)
//! - HMAC-SHA1, HMAC-SHA1-96, HMAC-SHA2-256, HMAC-SHA2-512 (RFC 6668)
//! - zlib stream compression with sync flushes (RFC 4253 Section 6.2)
//! - SHA-1 / SHA-256 exchange hashing
//!
//! # Security
//!
//! - MAC keys are zeroized on drop and redacted from `Debug`
//! - MAC verification is constant time
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::crypto::{CipherAlgorithm, CipherDirection, PacketCipher};
//!
//! let key = [7u8; 16];
//! let iv = [9u8; 16];
//! let mut enc = PacketCipher::new(CipherAlgorithm::Aes128Ctr, &key, &iv, CipherDirection::Encrypt).unwrap();
//! let mut dec = PacketCipher::new(CipherAlgorithm::Aes128Ctr, &key, &iv, CipherDirection::Decrypt).unwrap();
//!
//! let mut block = *b"sixteen byte blk";
//! enc.process(&mut block).unwrap();
//! dec.process(&mut block).unwrap();
//! assert_eq!(&block, b"sixteen byte blk");
//! ```

use aes::{Aes128, Aes256};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use hmac::{Hmac, Mac};
use kestrel_platform::{KestrelError, KestrelResult};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroize;

/// Upper bound on a single inflated payload.
pub const MAX_DECOMPRESSED_SIZE: usize = 1 << 20;

/// Cipher algorithm for SSH encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-128-CTR
    Aes128Ctr,
    /// AES-256-CTR
    Aes256Ctr,
    /// AES-128-CBC
    Aes128Cbc,
    /// AES-256-CBC
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Cbc => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        16
    }

    /// Returns the cipher block size in bytes.
    pub fn block_size(&self) -> usize {
        16
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            "aes256-cbc" => Some(CipherAlgorithm::Aes256Cbc),
            _ => None,
        }
    }
}

/// Which way a [`PacketCipher`] transforms data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    /// Plaintext to ciphertext
    Encrypt,
    /// Ciphertext to plaintext
    Decrypt,
}

enum CipherState {
    Aes128Ctr(Ctr128BE<Aes128>),
    Aes256Ctr(Ctr128BE<Aes256>),
    Aes128CbcEnc(cbc::Encryptor<Aes128>),
    Aes128CbcDec(cbc::Decryptor<Aes128>),
    Aes256CbcEnc(cbc::Encryptor<Aes256>),
    Aes256CbcDec(cbc::Decryptor<Aes256>),
}

/// Stateful cipher for one direction of the connection.
///
/// Counter and chaining state carry over between calls, so the packetizer
/// can decrypt the first block of a packet, then the rest of it later.
pub struct PacketCipher {
    algorithm: CipherAlgorithm,
    state: CipherState,
}

impl std::fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCipher")
            .field("algorithm", &self.algorithm)
            .field("state", &"<redacted>")
            .finish()
    }
}

impl PacketCipher {
    /// Creates a cipher from derived key material.
    ///
    /// Extra trailing bytes in `key` or `iv` are ignored.
    pub fn new(
        algorithm: CipherAlgorithm,
        key: &[u8],
        iv: &[u8],
        direction: CipherDirection,
    ) -> KestrelResult<Self> {
        if key.len() < algorithm.key_size() || iv.len() < algorithm.iv_size() {
            return Err(KestrelError::Security(format!(
                "Insufficient key material for {}: key {} bytes, iv {} bytes",
                algorithm.name(),
                key.len(),
                iv.len()
            )));
        }
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];
        let invalid = |_| KestrelError::Security(format!("Invalid {} key", algorithm.name()));

        let state = match (algorithm, direction) {
            (CipherAlgorithm::Aes128Ctr, _) => {
                CipherState::Aes128Ctr(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherAlgorithm::Aes256Ctr, _) => {
                CipherState::Aes256Ctr(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?)
            }
            (CipherAlgorithm::Aes128Cbc, CipherDirection::Encrypt) => CipherState::Aes128CbcEnc(
                cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?,
            ),
            (CipherAlgorithm::Aes128Cbc, CipherDirection::Decrypt) => CipherState::Aes128CbcDec(
                cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?,
            ),
            (CipherAlgorithm::Aes256Cbc, CipherDirection::Encrypt) => CipherState::Aes256CbcEnc(
                cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?,
            ),
            (CipherAlgorithm::Aes256Cbc, CipherDirection::Decrypt) => CipherState::Aes256CbcDec(
                cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?,
            ),
        };

        Ok(Self { algorithm, state })
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Returns the block size the packetizer must frame to.
    pub fn block_size(&self) -> usize {
        self.algorithm.block_size()
    }

    /// Encrypts or decrypts `data` in place.
    ///
    /// # Errors
    ///
    /// Returns [`KestrelError::Protocol`] if `data` is not a whole number of
    /// cipher blocks.
    pub fn process(&mut self, data: &mut [u8]) -> KestrelResult<()> {
        let bs = self.block_size();
        if data.len() % bs != 0 {
            return Err(KestrelError::Protocol("Invalid packet blocking".to_string()));
        }

        match &mut self.state {
            CipherState::Aes128Ctr(c) => c.apply_keystream(data),
            CipherState::Aes256Ctr(c) => c.apply_keystream(data),
            CipherState::Aes128CbcEnc(c) => {
                for chunk in data.chunks_exact_mut(bs) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
                }
            }
            CipherState::Aes128CbcDec(c) => {
                for chunk in data.chunks_exact_mut(bs) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
                }
            }
            CipherState::Aes256CbcEnc(c) => {
                for chunk in data.chunks_exact_mut(bs) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
                }
            }
            CipherState::Aes256CbcDec(c) => {
                for chunk in data.chunks_exact_mut(bs) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
                }
            }
        }
        Ok(())
    }
}

/// MAC algorithm for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA1 truncated to 96 bits
    HmacSha1_96,
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha1_96 => "hmac-sha1-96",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key size in bytes (the digest size).
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1_96 => 20,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Returns the size of the tag placed on the wire.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha1_96 => 12,
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha1-96" => Some(MacAlgorithm::HmacSha1_96),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

/// MAC key for one direction.
///
/// The sequence number is owned by the packetizer and passed in per call.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> KestrelResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(KestrelError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes `HMAC(uint32 seq || data)` truncated to the wire tag size.
    pub fn compute(&self, sequence: u32, data: &[u8]) -> KestrelResult<Vec<u8>> {
        let seq = sequence.to_be_bytes();
        let bad_key = |_| KestrelError::Security("Invalid HMAC key".to_string());

        let mut tag = match self.algorithm {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1_96 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&self.key).map_err(bad_key)?;
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.key).map_err(bad_key)?;
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&self.key).map_err(bad_key)?;
                mac.update(&seq);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        };
        tag.truncate(self.algorithm.mac_size());
        Ok(tag)
    }

    /// Checks a received tag in constant time.
    pub fn verify(&self, sequence: u32, data: &[u8], received: &[u8]) -> KestrelResult<bool> {
        use subtle::ConstantTimeEq;

        let computed = self.compute(sequence, data)?;
        if computed.len() != received.len() {
            return Ok(false);
        }
        Ok(computed.ct_eq(received).into())
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Returns the wire tag size.
    pub fn mac_size(&self) -> usize {
        self.algorithm.mac_size()
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Hash used for the exchange hash and key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1 (group1, group14, gex-sha1)
    Sha1,
    /// SHA-256 (gex-sha256)
    Sha256,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => {
                let mut h = Sha1::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut h = Sha256::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
        }
    }
}

/// Compression names the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// zlib from the first NEWKEYS
    Zlib,
    /// zlib delayed until authentication succeeds
    ZlibOpenssh,
}

impl CompressionAlgorithm {
    /// Parses a negotiated compression name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibOpenssh),
            _ => None,
        }
    }

    /// True unless this is `none`.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CompressionAlgorithm::None)
    }

    /// True if activation waits for a successful login.
    pub fn is_delayed(&self) -> bool {
        matches!(self, CompressionAlgorithm::ZlibOpenssh)
    }
}

/// Outbound zlib stream; one per connection direction, flushed per packet.
pub struct ZlibCompressor {
    inner: Compress,
}

impl std::fmt::Debug for ZlibCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibCompressor")
            .field("total_in", &self.inner.total_in())
            .finish()
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibCompressor {
    /// Creates a compressor with a zlib header.
    pub fn new() -> Self {
        Self {
            inner: Compress::new(Compression::default(), true),
        }
    }

    /// Compresses one payload and sync-flushes the stream.
    pub fn compress(&mut self, data: &[u8]) -> KestrelResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() + 64);
        let start = self.inner.total_in();

        loop {
            let consumed = (self.inner.total_in() - start) as usize;
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(256));
            }
            self.inner
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| KestrelError::Protocol(format!("Compression failed: {}", e)))?;
            let consumed = (self.inner.total_in() - start) as usize;
            if consumed == data.len() && out.len() < out.capacity() {
                break;
            }
        }
        Ok(out)
    }
}

/// Inbound zlib stream.
pub struct ZlibDecompressor {
    inner: Decompress,
}

impl std::fmt::Debug for ZlibDecompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibDecompressor")
            .field("total_in", &self.inner.total_in())
            .finish()
    }
}

impl Default for ZlibDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibDecompressor {
    /// Creates a decompressor expecting a zlib header.
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(true),
        }
    }

    /// Inflates one sync-flushed payload.
    pub fn decompress(&mut self, data: &[u8]) -> KestrelResult<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        let start = self.inner.total_in();

        loop {
            let consumed = (self.inner.total_in() - start) as usize;
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(256));
            }
            let before_out = out.len();
            let status = self
                .inner
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| KestrelError::Protocol(format!("Decompression failed: {}", e)))?;
            if out.len() > MAX_DECOMPRESSED_SIZE {
                return Err(KestrelError::Protocol(
                    "Decompressed payload too large".to_string(),
                ));
            }
            let consumed_now = (self.inner.total_in() - start) as usize;
            let stalled = consumed_now == consumed && out.len() == before_out;
            if status == Status::StreamEnd
                || (consumed_now == data.len() && out.len() < out.capacity())
                || stalled
            {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_algorithm_properties() {
        assert_eq!(CipherAlgorithm::Aes128Ctr.key_size(), 16);
        assert_eq!(CipherAlgorithm::Aes256Cbc.key_size(), 32);
        assert_eq!(CipherAlgorithm::Aes256Ctr.block_size(), 16);
        assert_eq!(CipherAlgorithm::from_name("aes256-cbc"), Some(CipherAlgorithm::Aes256Cbc));
        assert!(CipherAlgorithm::from_name("3des-cbc").is_none());
    }

    #[test]
    fn test_ctr_state_carries_across_calls() {
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let mut enc =
            PacketCipher::new(CipherAlgorithm::Aes256Ctr, &key, &iv, CipherDirection::Encrypt)
                .unwrap();
        let mut dec =
            PacketCipher::new(CipherAlgorithm::Aes256Ctr, &key, &iv, CipherDirection::Decrypt)
                .unwrap();

        let original = [0x5au8; 48];
        let mut data = original;
        enc.process(&mut data).unwrap();
        assert_ne!(data, original);

        // Decrypting the first block then the rest matches one-shot decryption
        dec.process(&mut data[..16]).unwrap();
        dec.process(&mut data[16..]).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_cbc_chaining() {
        let key = [3u8; 16];
        let iv = [4u8; 16];
        let mut enc =
            PacketCipher::new(CipherAlgorithm::Aes128Cbc, &key, &iv, CipherDirection::Encrypt)
                .unwrap();
        let mut dec =
            PacketCipher::new(CipherAlgorithm::Aes128Cbc, &key, &iv, CipherDirection::Decrypt)
                .unwrap();

        let original = [0u8; 32];
        let mut data = original;
        enc.process(&mut data).unwrap();
        // Identical plaintext blocks must not produce identical ciphertext
        assert_ne!(data[..16], data[16..]);

        dec.process(&mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_cipher_rejects_partial_block() {
        let mut enc = PacketCipher::new(
            CipherAlgorithm::Aes128Ctr,
            &[0u8; 16],
            &[0u8; 16],
            CipherDirection::Encrypt,
        )
        .unwrap();
        let mut data = [0u8; 15];
        assert!(matches!(enc.process(&mut data), Err(KestrelError::Protocol(_))));
    }

    #[test]
    fn test_cipher_insufficient_key() {
        let result = PacketCipher::new(
            CipherAlgorithm::Aes256Ctr,
            &[0u8; 16],
            &[0u8; 16],
            CipherDirection::Encrypt,
        );
        assert!(matches!(result, Err(KestrelError::Security(_))));
    }

    #[test]
    fn test_mac_algorithm_properties() {
        assert_eq!(MacAlgorithm::HmacSha1_96.key_size(), 20);
        assert_eq!(MacAlgorithm::HmacSha1_96.mac_size(), 12);
        assert_eq!(MacAlgorithm::HmacSha512.mac_size(), 64);
        assert_eq!(MacAlgorithm::from_name("hmac-sha2-256"), Some(MacAlgorithm::HmacSha256));
        assert!(MacAlgorithm::from_name("hmac-md5").is_none());
    }

    #[test]
    fn test_mac_binds_sequence_number() {
        let mac_key = MacKey::new(MacAlgorithm::HmacSha256, &[0u8; 32]).unwrap();
        let data = b"Hello, SSH!";
        let tag = mac_key.compute(7, data).unwrap();
        assert_eq!(tag.len(), 32);

        assert!(mac_key.verify(7, data, &tag).unwrap());
        assert!(!mac_key.verify(8, data, &tag).unwrap());

        let mut flipped = tag.clone();
        flipped[0] ^= 1;
        assert!(!mac_key.verify(7, data, &flipped).unwrap());
    }

    #[test]
    fn test_mac_truncation() {
        let full = MacKey::new(MacAlgorithm::HmacSha1, &[9u8; 20]).unwrap();
        let short = MacKey::new(MacAlgorithm::HmacSha1_96, &[9u8; 20]).unwrap();
        let a = full.compute(1, b"payload").unwrap();
        let b = short.compute(1, b"payload").unwrap();
        assert_eq!(b.len(), 12);
        assert_eq!(&a[..12], &b[..]);
    }

    #[test]
    fn test_hash_digest_parts() {
        let joined = HashAlgorithm::Sha256.digest(&[b"abc"]);
        let split = HashAlgorithm::Sha256.digest(&[b"a", b"bc"]);
        assert_eq!(joined, split);
        assert_eq!(HashAlgorithm::Sha1.digest(&[b"abc"]).len(), 20);
        assert_eq!(
            hex::encode(HashAlgorithm::Sha1.digest(&[b"abc"])),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_zlib_stream_across_packets() {
        let mut comp = ZlibCompressor::new();
        let mut decomp = ZlibDecompressor::new();

        for msg in [&b"first packet payload"[..], &[b'x'; 5000][..], b""] {
            let packed = comp.compress(msg).unwrap();
            let unpacked = decomp.decompress(&packed).unwrap();
            assert_eq!(unpacked, msg);
        }
    }

    #[test]
    fn test_compression_names() {
        assert!(CompressionAlgorithm::from_name("zlib@openssh.com").unwrap().is_delayed());
        assert!(!CompressionAlgorithm::from_name("none").unwrap().is_enabled());
        assert!(CompressionAlgorithm::from_name("lz4").is_none());
    }
}
