//! Fixed-group Diffie-Hellman key exchange (RFC 4253 Section 8).
//!
//! This module implements:
//! - diffie-hellman-group1-sha1 (1024-bit Oakley group 2)
//! - diffie-hellman-group14-sha1 (2048-bit MODP group, RFC 3526)
//!
//! Both use generator 2 and SHA-1 for the exchange hash.
//!
//! # Example
//!
//! ```rust
//! use kestrel_proto::ssh::kex::KexEngine;
//! use kestrel_proto::ssh::kex_dh::KexGroup;
//!
//! let kex = KexGroup::group14();
//! assert_eq!(kex.name(), "diffie-hellman-group14-sha1");
//! ```

use crate::ssh::crypto::HashAlgorithm;
use crate::ssh::kex::{KexContext, KexEngine, KexResult, KexStep};
use crate::ssh::message::{Message, MessageType};
use kestrel_platform::{KestrelError, KestrelResult};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use rand::RngCore;
use tracing::debug;

/// Oakley group 2 prime (1024-bit).
pub static GROUP1_P: Lazy<BigUint> = Lazy::new(|| {
    parse_hex_prime(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
         FFFFFFFFFFFFFFFF",
    )
});

/// RFC 3526 group 14 prime (2048-bit).
pub static GROUP14_P: Lazy<BigUint> = Lazy::new(|| {
    parse_hex_prime(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
         83655D23DCA3AD961C62F356208552BB9ED529077096966D\
         670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
         E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
         DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
         15728E5A8AACAA68FFFFFFFFFFFFFFFF",
    )
});

/// Generator shared by both fixed groups.
pub static GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

fn parse_hex_prime(hex_str: &str) -> BigUint {
    BigUint::from_bytes_be(&hex::decode(hex_str).expect("Invalid hex"))
}

/// Picks a private exponent with `1 < x < (p - 1) / 2`.
///
/// Random bytes the width of `q` have their top byte masked down to q's
/// highest set bit, then the candidate is rejected until it falls in range.
pub(crate) fn generate_x(p: &BigUint) -> BigUint {
    let one = BigUint::from(1u32);
    let q: BigUint = (p - &one) >> 1;
    let q_bytes = q.to_bytes_be();

    let mut mask = 0xffu8;
    let mut high = q_bytes[0];
    while high & 0x80 == 0 {
        high <<= 1;
        mask >>= 1;
    }

    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; q_bytes.len()];
    loop {
        rng.fill_bytes(&mut buf);
        buf[0] &= mask;
        let x = BigUint::from_bytes_be(&buf);
        if x > one && x < q {
            return x;
        }
    }
}

/// Rejects a peer public value outside `1 < v < p - 1`.
pub(crate) fn check_public_value(value: &BigUint, p: &BigUint, label: &str) -> KestrelResult<()> {
    let one = BigUint::from(1u32);
    if *value <= one || *value >= p - &one {
        return Err(KestrelError::Protocol(format!("{} is out of range", label)));
    }
    Ok(())
}

/// Fixed-group Diffie-Hellman exchange.
pub struct KexGroup {
    name: &'static str,
    p: &'static BigUint,
    g: &'static BigUint,
    x: Option<BigUint>,
    e: Option<BigUint>,
    f: Option<BigUint>,
}

impl KexGroup {
    /// diffie-hellman-group1-sha1.
    pub fn group1() -> Self {
        Self::with_group("diffie-hellman-group1-sha1", &GROUP1_P)
    }

    /// diffie-hellman-group14-sha1.
    pub fn group14() -> Self {
        Self::with_group("diffie-hellman-group14-sha1", &GROUP14_P)
    }

    fn with_group(name: &'static str, p: &'static BigUint) -> Self {
        Self {
            name,
            p,
            g: &GENERATOR,
            x: None,
            e: None,
            f: None,
        }
    }

    fn private_x(&self) -> KestrelResult<&BigUint> {
        self.x
            .as_ref()
            .ok_or_else(|| KestrelError::Protocol("Key exchange not started".to_string()))
    }

    fn exchange_hash(&self, ctx: &KexContext<'_>, host_key: &[u8], e: &BigUint, f: &BigUint, k: &BigUint) -> Vec<u8> {
        let mut hm = ctx.hash_prefix(host_key);
        hm.add_mpint(e).add_mpint(f).add_mpint(k);
        self.hash_algorithm().digest(&[hm.as_bytes()])
    }

    fn parse_kexdh_reply(&mut self, ctx: &KexContext<'_>, m: &mut Message) -> KestrelResult<KexStep> {
        let host_key = m.get_string()?;
        let f = m.get_mpint()?;
        let sig = m.get_string()?;
        check_public_value(&f, self.p, "Server kex \"f\"")?;

        let k = f.modpow(self.private_x()?, self.p);
        let e = self
            .e
            .as_ref()
            .ok_or_else(|| KestrelError::Protocol("Key exchange not started".to_string()))?;
        let h = self.exchange_hash(ctx, &host_key, e, &f, &k);
        self.f = Some(f);

        Ok(KexStep {
            outbound: vec![],
            expect: vec![],
            result: Some(KexResult {
                k,
                h,
                host_key,
                signature: Some(sig),
            }),
        })
    }

    fn parse_kexdh_init(&mut self, ctx: &KexContext<'_>, m: &mut Message) -> KestrelResult<KexStep> {
        let e = m.get_mpint()?;
        check_public_value(&e, self.p, "Client kex \"e\"")?;

        let host = ctx.require_host_key()?;
        let k = e.modpow(self.private_x()?, self.p);
        let f = self
            .f
            .clone()
            .ok_or_else(|| KestrelError::Protocol("Key exchange not started".to_string()))?;
        let key_blob = host.public_blob();
        let h = self.exchange_hash(ctx, &key_blob, &e, &f, &k);
        let sig = host.sign_ssh_data(&h)?;

        let mut reply = Message::with_type(MessageType::KexdhReply);
        reply.add_string(&key_blob).add_mpint(&f).add_string(&sig);
        self.e = Some(e);

        Ok(KexStep {
            outbound: vec![reply],
            expect: vec![],
            result: Some(KexResult {
                k,
                h,
                host_key: key_blob,
                signature: None,
            }),
        })
    }
}

impl KexEngine for KexGroup {
    fn name(&self) -> &'static str {
        self.name
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::Sha1
    }

    fn start_kex(&mut self, ctx: &KexContext<'_>) -> KestrelResult<KexStep> {
        let x = generate_x(self.p);
        let public = self.g.modpow(&x, self.p);
        self.x = Some(x);

        if ctx.server_mode {
            self.f = Some(public);
            return Ok(KexStep::expect(&[MessageType::KexdhInit as u8]));
        }

        let mut m = Message::with_type(MessageType::KexdhInit);
        m.add_mpint(&public);
        self.e = Some(public);
        debug!("{}: sent KEXDH_INIT", self.name);
        Ok(KexStep::send_and_expect(m, &[MessageType::KexdhReply as u8]))
    }

    fn parse_next(&mut self, ctx: &KexContext<'_>, ptype: u8, m: &mut Message) -> KestrelResult<KexStep> {
        match ptype {
            30 if ctx.server_mode => self.parse_kexdh_init(ctx, m),
            31 if !ctx.server_mode => self.parse_kexdh_reply(ctx, m),
            _ => Err(KestrelError::Protocol(format!(
                "KexGroup asked to handle packet type {}",
                ptype
            ))),
        }
    }
}
