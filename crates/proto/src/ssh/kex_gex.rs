//! Diffie-Hellman group exchange (RFC 4419).
//!
//! The server proposes the group. The client requests a modulus size range,
//! checks the offered prime, and the rest mirrors the fixed-group exchange
//! with a longer exchange hash:
//!
//! ```text
//! H = hash(V_C || V_S || I_C || I_S || K_S || min || n || max || p || g || e || f || K)
//! ```
//!
//! The pre-RFC "old style" request carries only the preferred size, and
//! only that size goes into H.

use crate::ssh::crypto::HashAlgorithm;
use crate::ssh::kex::{GexBits, KexContext, KexEngine, KexResult, KexStep};
use crate::ssh::kex_dh::{check_public_value, generate_x, GENERATOR, GROUP14_P, GROUP1_P};
use crate::ssh::message::{Message, MessageType};
use kestrel_platform::{KestrelError, KestrelResult};
use num_bigint::BigUint;
use tracing::debug;

/// Smallest modulus a client accepts or a server offers.
pub const MIN_GEX_BITS: u32 = 1024;

/// Largest modulus a client accepts or a server offers.
pub const MAX_GEX_BITS: u32 = 8192;

/// Requested sizes as they appear on the wire and in H.
#[derive(Debug, Clone, Copy)]
enum GexRequest {
    Old { preferred: u32 },
    Full(GexBits),
}

/// Group-exchange engine, SHA-1 or SHA-256.
pub struct KexGex {
    name: &'static str,
    hash: HashAlgorithm,
    request: Option<GexRequest>,
    p: Option<BigUint>,
    g: Option<BigUint>,
    x: Option<BigUint>,
    e: Option<BigUint>,
    f: Option<BigUint>,
}

impl KexGex {
    /// diffie-hellman-group-exchange-sha1.
    pub fn sha1() -> Self {
        Self::with_hash("diffie-hellman-group-exchange-sha1", HashAlgorithm::Sha1)
    }

    /// diffie-hellman-group-exchange-sha256.
    pub fn sha256() -> Self {
        Self::with_hash("diffie-hellman-group-exchange-sha256", HashAlgorithm::Sha256)
    }

    fn with_hash(name: &'static str, hash: HashAlgorithm) -> Self {
        Self {
            name,
            hash,
            request: None,
            p: None,
            g: None,
            x: None,
            e: None,
            f: None,
        }
    }

    fn not_started() -> KestrelError {
        KestrelError::Protocol("Key exchange not started".to_string())
    }

    fn exchange_hash(&self, ctx: &KexContext<'_>, host_key: &[u8], k: &BigUint) -> KestrelResult<Vec<u8>> {
        let request = self.request.ok_or_else(Self::not_started)?;
        let mut hm = ctx.hash_prefix(host_key);
        match request {
            GexRequest::Old { preferred } => {
                hm.add_int(preferred);
            }
            GexRequest::Full(bits) => {
                hm.add_int(bits.min).add_int(bits.preferred).add_int(bits.max);
            }
        }
        hm.add_mpint(self.p.as_ref().ok_or_else(Self::not_started)?)
            .add_mpint(self.g.as_ref().ok_or_else(Self::not_started)?)
            .add_mpint(self.e.as_ref().ok_or_else(Self::not_started)?)
            .add_mpint(self.f.as_ref().ok_or_else(Self::not_started)?)
            .add_mpint(k);
        Ok(self.hash.digest(&[hm.as_bytes()]))
    }

    // client side

    fn parse_kexdh_gex_group(&mut self, m: &mut Message) -> KestrelResult<KexStep> {
        let p = m.get_mpint()?;
        let g = m.get_mpint()?;
        let bits = p.bits();
        if bits < MIN_GEX_BITS as u64 || bits > MAX_GEX_BITS as u64 {
            return Err(KestrelError::Protocol(format!(
                "Server-generated gex p is out of range ({} bits)",
                bits
            )));
        }
        debug!("Got server p ({} bits)", bits);

        let x = generate_x(&p);
        let e = g.modpow(&x, &p);

        let mut init = Message::with_type(MessageType::KexGexInit);
        init.add_mpint(&e);

        self.p = Some(p);
        self.g = Some(g);
        self.x = Some(x);
        self.e = Some(e);
        Ok(KexStep::send_and_expect(init, &[MessageType::KexGexReply as u8]))
    }

    fn parse_kexdh_gex_reply(&mut self, ctx: &KexContext<'_>, m: &mut Message) -> KestrelResult<KexStep> {
        let host_key = m.get_string()?;
        let f = m.get_mpint()?;
        let sig = m.get_string()?;

        let p = self.p.as_ref().ok_or_else(Self::not_started)?;
        check_public_value(&f, p, "Server kex \"f\"")?;
        let k = f.modpow(self.x.as_ref().ok_or_else(Self::not_started)?, p);
        self.f = Some(f);

        let h = self.exchange_hash(ctx, &host_key, &k)?;
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

    // server side

    fn parse_kexdh_gex_request(&mut self, m: &mut Message) -> KestrelResult<KexStep> {
        let bits = GexBits {
            min: m.get_int()?,
            preferred: m.get_int()?,
            max: m.get_int()?,
        };
        self.request = Some(GexRequest::Full(bits));
        self.send_group(bits)
    }

    fn parse_kexdh_gex_request_old(&mut self, m: &mut Message) -> KestrelResult<KexStep> {
        let preferred = m.get_int()?;
        self.request = Some(GexRequest::Old { preferred });
        self.send_group(GexBits {
            min: MIN_GEX_BITS,
            preferred,
            max: MAX_GEX_BITS,
        })
    }

    fn send_group(&mut self, requested: GexBits) -> KestrelResult<KexStep> {
        let p = choose_modulus(requested)?;
        let g = GENERATOR.clone();
        debug!(
            "Picked p ({} bits) for request {}/{}/{}",
            p.bits(),
            requested.min,
            requested.preferred,
            requested.max
        );

        let x = generate_x(&p);
        let f = g.modpow(&x, &p);

        let mut group = Message::with_type(MessageType::KexdhReply);
        group.add_mpint(&p).add_mpint(&g);

        self.p = Some(p);
        self.g = Some(g);
        self.x = Some(x);
        self.f = Some(f);
        Ok(KexStep::send_and_expect(group, &[MessageType::KexGexInit as u8]))
    }

    fn parse_kexdh_gex_init(&mut self, ctx: &KexContext<'_>, m: &mut Message) -> KestrelResult<KexStep> {
        let e = m.get_mpint()?;
        let p = self.p.as_ref().ok_or_else(Self::not_started)?;
        check_public_value(&e, p, "Client kex \"e\"")?;

        let host = ctx.require_host_key()?;
        let k = e.modpow(self.x.as_ref().ok_or_else(Self::not_started)?, p);
        self.e = Some(e);

        let key_blob = host.public_blob();
        let h = self.exchange_hash(ctx, &key_blob, &k)?;
        let sig = host.sign_ssh_data(&h)?;

        let mut reply = Message::with_type(MessageType::KexGexReply);
        reply
            .add_string(&key_blob)
            .add_mpint(self.f.as_ref().ok_or_else(Self::not_started)?)
            .add_string(&sig);

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

/// Picks a built-in prime for a client request.
///
/// The request is clamped to `[MIN_GEX_BITS, MAX_GEX_BITS]`; the largest
/// prime no bigger than the preferred size wins, else the smallest in range.
pub fn choose_modulus(requested: GexBits) -> KestrelResult<BigUint> {
    let min = requested.min.max(MIN_GEX_BITS) as u64;
    let max = requested.max.min(MAX_GEX_BITS) as u64;
    let preferred = (requested.preferred as u64).clamp(min.min(max), max.max(min));

    let pack: [&BigUint; 2] = [&GROUP1_P, &GROUP14_P];
    let in_range: Vec<&BigUint> = pack
        .iter()
        .copied()
        .filter(|p| p.bits() >= min && p.bits() <= max)
        .collect();

    in_range
        .iter()
        .copied()
        .filter(|p| p.bits() <= preferred)
        .max_by_key(|p| p.bits())
        .or_else(|| in_range.iter().copied().min_by_key(|p| p.bits()))
        .cloned()
        .ok_or_else(|| {
            KestrelError::Protocol("Can't do server-side gex with no modulus pack".to_string())
        })
}

impl KexEngine for KexGex {
    fn name(&self) -> &'static str {
        self.name
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash
    }

    fn start_kex(&mut self, ctx: &KexContext<'_>) -> KestrelResult<KexStep> {
        if ctx.server_mode {
            return Ok(KexStep::expect(&[
                MessageType::KexGexRequest as u8,
                MessageType::KexdhInit as u8,
            ]));
        }

        let bits = ctx.gex_bits;
        let m = if ctx.gex_old_style {
            let mut m = Message::with_type(MessageType::KexdhInit);
            m.add_int(bits.preferred);
            self.request = Some(GexRequest::Old {
                preferred: bits.preferred,
            });
            m
        } else {
            let mut m = Message::with_type(MessageType::KexGexRequest);
            m.add_int(bits.min).add_int(bits.preferred).add_int(bits.max);
            self.request = Some(GexRequest::Full(bits));
            m
        };
        Ok(KexStep::send_and_expect(m, &[MessageType::KexdhReply as u8]))
    }

    fn parse_next(&mut self, ctx: &KexContext<'_>, ptype: u8, m: &mut Message) -> KestrelResult<KexStep> {
        match (ctx.server_mode, ptype) {
            (true, 34) => self.parse_kexdh_gex_request(m),
            (true, 30) => self.parse_kexdh_gex_request_old(m),
            (true, 32) => self.parse_kexdh_gex_init(ctx, m),
            (false, 31) => self.parse_kexdh_gex_group(m),
            (false, 33) => self.parse_kexdh_gex_reply(ctx, m),
            _ => Err(KestrelError::Protocol(format!(
                "KexGex asked to handle packet type {}",
                ptype
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::{Ed25519Key, Signable};

    fn context<'a>(server: bool, host_key: Option<&'a dyn Signable>, old_style: bool) -> KexContext<'a> {
        KexContext {
            server_mode: server,
            local_version: if server { "SSH-2.0-Server" } else { "SSH-2.0-Client" },
            remote_version: if server { "SSH-2.0-Client" } else { "SSH-2.0-Server" },
            local_kex_init: if server { b"\x14s" } else { b"\x14c" },
            remote_kex_init: if server { b"\x14c" } else { b"\x14s" },
            host_key,
            gex_bits: GexBits::default(),
            gex_old_style: old_style,
        }
    }

    fn body(msg: &Message) -> (u8, Message) {
        let bytes = msg.as_bytes();
        (bytes[0], Message::from_bytes(&bytes[1..]))
    }

    fn run_exchange(mut client: KexGex, mut server: KexGex, old_style: bool) {
        let host = Ed25519Key::generate();
        let cctx = context(false, None, old_style);
        let sctx = context(true, Some(&host), old_style);

        assert_eq!(server.start_kex(&sctx).unwrap().expect, vec![34, 30]);
        let step = client.start_kex(&cctx).unwrap();
        let (ptype, mut req) = body(&step.outbound[0]);
        assert_eq!(ptype, if old_style { 30 } else { 34 });

        let step = server.parse_next(&sctx, ptype, &mut req).unwrap();
        assert_eq!(step.expect, vec![32]);
        let (ptype, mut group) = body(&step.outbound[0]);

        let step = client.parse_next(&cctx, ptype, &mut group).unwrap();
        assert_eq!(step.expect, vec![33]);
        let (ptype, mut init) = body(&step.outbound[0]);

        let step = server.parse_next(&sctx, ptype, &mut init).unwrap();
        let server_result = step.result.unwrap();
        let (ptype, mut reply) = body(&step.outbound[0]);
        assert_eq!(ptype, 33);

        let client_result = client.parse_next(&cctx, ptype, &mut reply).unwrap().result.unwrap();
        assert_eq!(client_result.k, server_result.k);
        assert_eq!(client_result.h, server_result.h);
        assert_eq!(client_result.h.len(), client.hash_algorithm().digest_size());
    }

    #[test]
    fn test_gex_sha256_exchange() {
        run_exchange(KexGex::sha256(), KexGex::sha256(), false);
    }

    #[test]
    fn test_gex_old_style_exchange() {
        run_exchange(KexGex::sha1(), KexGex::sha1(), true);
    }

    fn group_message(p: &BigUint) -> Message {
        let mut m = Message::new();
        m.add_mpint(p).add_mpint(&BigUint::from(2u32));
        Message::from_bytes(m.as_bytes())
    }

    #[test]
    fn test_client_rejects_small_and_large_p() {
        let cctx = context(false, None, false);

        let mut client = KexGex::sha1();
        client.start_kex(&cctx).unwrap();
        let small = (BigUint::from(1u32) << 511usize) + 1u32;
        match client.parse_next(&cctx, 31, &mut group_message(&small)) {
            Err(KestrelError::Protocol(msg)) => {
                assert_eq!(msg, "Server-generated gex p is out of range (512 bits)")
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }

        let mut client = KexGex::sha1();
        client.start_kex(&cctx).unwrap();
        let large = (BigUint::from(1u32) << 16383usize) + 1u32;
        assert!(client.parse_next(&cctx, 31, &mut group_message(&large)).is_err());

        let mut client = KexGex::sha1();
        client.start_kex(&cctx).unwrap();
        assert!(client.parse_next(&cctx, 31, &mut group_message(&GROUP14_P)).is_ok());
    }

    #[test]
    fn test_choose_modulus() {
        let pick = |min, preferred, max| choose_modulus(GexBits { min, preferred, max }).map(|p| p.bits());
        assert_eq!(pick(1024, 2048, 8192).unwrap(), 2048);
        assert_eq!(pick(1024, 1024, 8192).unwrap(), 1024);
        assert_eq!(pick(512, 1536, 8192).unwrap(), 1024);
        assert!(pick(3072, 4096, 8192).is_err());
        // preferred below the pack still gets something in range
        assert_eq!(pick(2048, 1024, 4096).unwrap(), 2048);
    }
}
