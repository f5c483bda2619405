//! Typed bodies for the relay messages that the relay cell engine
//! interprets itself.
//!
//! Messages whose bodies only ever cross the engine opaquely (BEGIN,
//! EXTEND, the hidden-service block) are not decoded here; they are
//! handed to their collaborators as raw payload bytes.

use crate::chancell::DestroyReason;
use crate::{Error, Result};
use caret::caret_int;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

caret_int! {
    /// A declared reason for closing a stream
    pub struct EndReason(u8) {
        /// Closing a stream because of an unspecified reason.
        ///
        /// This is the only END reason that clients send.
        MISC = 1,
        /// Couldn't look up hostname.
        RESOLVEFAILED = 2,
        /// Remote host refused connection.
        CONNECTREFUSED = 3,
        /// Closing a stream because of an exit-policy violation.
        EXITPOLICY = 4,
        /// Circuit destroyed
        DESTROY = 5,
        /// Anonymized TCP connection was closed
        DONE = 6,
        /// Connection timed out, or relay timed out while connecting
        TIMEOUT = 7,
        /// No route to target destination.
        NOROUTE = 8,
        /// Relay is entering hibernation and not handling requests
        HIBERNATING = 9,
        /// Internal error at the relay
        INTERNAL = 10,
        /// Ran out of resources to fulfill requests
        RESOURCELIMIT = 11,
        /// Connection unexpectedly reset
        CONNRESET = 12,
        /// Protocol violation
        TORPROTOCOL = 13,
        /// BEGIN_DIR cell at a non-directory relay.
        NOTDIRECTORY = 14,
    }
}

caret_int! {
    /// The type code of an address TLV.
    ///
    /// The same encoding is shared by RESOLVED answers and the
    /// optional address field of several other messages.
    pub struct AddrType(u8) {
        /// Unspecified or unrecognized address family.
        UNSPEC = 0,
        /// Four-byte IPv4 address.
        IPV4 = 1,
        /// Sixteen-byte IPv6 address.
        IPV6 = 2,
        /// A transient name-resolution error.
        ERROR_TRANSIENT = 0xF0,
        /// A permanent name-resolution error.
        ERROR_NONTRANSIENT = 0xF1,
    }
}

/// Append the TLV encoding of `addr` to `out`, returning the number of
/// bytes written.
///
/// The encoding is `type:u8, len:u8, value[len]`; 6 bytes for IPv4 and
/// 18 for IPv6.  Fails if `out` has too little free space.
pub fn encode_address(addr: &IpAddr, out: &mut [u8]) -> Result<usize> {
    match addr {
        IpAddr::V4(v4) => {
            if out.len() < 6 {
                return Err(Error::Truncated {
                    wanted: 6,
                    have: out.len(),
                });
            }
            out[0] = AddrType::IPV4.into();
            out[1] = 4;
            out[2..6].copy_from_slice(&v4.octets());
            Ok(6)
        }
        IpAddr::V6(v6) => {
            if out.len() < 18 {
                return Err(Error::Truncated {
                    wanted: 18,
                    have: out.len(),
                });
            }
            out[0] = AddrType::IPV6.into();
            out[1] = 16;
            out[2..18].copy_from_slice(&v6.octets());
            Ok(18)
        }
    }
}

/// Decode an address TLV from the front of `payload`.
///
/// On success, return the decoded address (or `None` for an
/// unrecognized type, whose value bytes are skipped) and the number of
/// bytes consumed.
pub fn decode_address(payload: &[u8]) -> Result<(Option<IpAddr>, usize)> {
    if payload.len() < 2 {
        return Err(Error::Truncated {
            wanted: 2,
            have: payload.len(),
        });
    }
    let len = usize::from(payload[1]);
    if payload.len() < 2 + len {
        return Err(Error::Truncated {
            wanted: 2 + len,
            have: payload.len(),
        });
    }
    let value = &payload[2..2 + len];
    let addr = match AddrType::from(payload[0]) {
        AddrType::IPV4 => {
            if len != 4 {
                return Err(Error::BadAddress);
            }
            let octets: [u8; 4] = value.try_into().map_err(|_| Error::BadAddress)?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        AddrType::IPV6 => {
            if len != 16 {
                return Err(Error::BadAddress);
            }
            let octets: [u8; 16] = value.try_into().map_err(|_| Error::BadAddress)?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    };
    Ok((addr, 2 + len))
}

/// The body of an END message, closing a stream.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct End {
    /// Reason for closing the stream.
    reason: EndReason,
    /// If the reason is EXITPOLICY, this holds the resolved address and
    /// an associated TTL.  The TTL is set to MAX if none was given.
    addr: Option<(IpAddr, u32)>,
}

impl End {
    /// Make a new END message with the MISC reason.
    ///
    /// Clients send this every time they decide to close a stream.
    pub fn new_misc() -> Self {
        End {
            reason: EndReason::MISC,
            addr: None,
        }
    }
    /// Make a new END message with the provided end reason.
    pub fn new_with_reason(reason: EndReason) -> Self {
        End { reason, addr: None }
    }
    /// Make a new END message with reason EXITPOLICY, and the provided
    /// address and TTL.
    pub fn new_exitpolicy(addr: IpAddr, ttl: u32) -> Self {
        End {
            reason: EndReason::EXITPOLICY,
            addr: Some((addr, ttl)),
        }
    }
    /// Return the reason this END message carries.
    pub fn reason(&self) -> EndReason {
        self.reason
    }
    /// Return the address and TTL carried by an EXITPOLICY END, if any.
    pub fn addr(&self) -> Option<(IpAddr, u32)> {
        self.addr
    }

    /// Decode an END body from `body` (the `length` bytes of the
    /// message).
    ///
    /// An empty body means MISC: very old implementations sent no
    /// reason at all.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(End::new_misc());
        }
        let reason: EndReason = body[0].into();
        if reason != EndReason::EXITPOLICY {
            return Ok(End { reason, addr: None });
        }
        let rest = &body[1..];
        let addr = match rest.len() {
            4 | 8 => {
                let octets: [u8; 4] = rest[0..4].try_into().map_err(|_| Error::BadAddress)?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 | 20 => {
                let octets: [u8; 16] = rest[0..16].try_into().map_err(|_| Error::BadAddress)?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => {
                // Unexpected body lengths carry no address.
                return Ok(End { reason, addr: None });
            }
        };
        let ttl = match rest.len() {
            8 => u32::from_be_bytes(rest[4..8].try_into().map_err(|_| Error::BadAddress)?),
            20 => u32::from_be_bytes(rest[16..20].try_into().map_err(|_| Error::BadAddress)?),
            _ => u32::MAX,
        };
        Ok(End {
            reason,
            addr: Some((addr, ttl)),
        })
    }

    /// Encode this END body into `out`, returning the number of bytes
    /// written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Err(Error::Truncated {
                wanted: 1,
                have: 0,
            });
        }
        out[0] = self.reason.into();
        let mut n = 1;
        if let (EndReason::EXITPOLICY, Some((addr, ttl))) = (self.reason, self.addr) {
            match addr {
                IpAddr::V4(v4) => {
                    let wanted = n + 8;
                    if out.len() < wanted {
                        return Err(Error::Truncated {
                            wanted,
                            have: out.len(),
                        });
                    }
                    out[n..n + 4].copy_from_slice(&v4.octets());
                    n += 4;
                }
                IpAddr::V6(v6) => {
                    let wanted = n + 20;
                    if out.len() < wanted {
                        return Err(Error::Truncated {
                            wanted,
                            have: out.len(),
                        });
                    }
                    out[n..n + 16].copy_from_slice(&v6.octets());
                    n += 16;
                }
            }
            out[n..n + 4].copy_from_slice(&ttl.to_be_bytes());
            n += 4;
        }
        Ok(n)
    }
}

/// The body of a CONNECTED message, acknowledging a BEGIN.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Connected {
    /// The address the exit actually connected to, if it told us.
    addr: Option<Ipv4Addr>,
    /// How long the address may be cached.
    ttl: Option<u32>,
}

impl Connected {
    /// Make a new CONNECTED message with no address information.
    pub fn new_empty() -> Self {
        Connected {
            addr: None,
            ttl: None,
        }
    }
    /// Make a new CONNECTED message reporting the connected address.
    pub fn new_with_addr(addr: Ipv4Addr, ttl: u32) -> Self {
        Connected {
            addr: Some(addr),
            ttl: Some(ttl),
        }
    }
    /// Return the reported address, if any.
    pub fn addr(&self) -> Option<Ipv4Addr> {
        self.addr
    }
    /// Return the reported TTL, if any.
    pub fn ttl(&self) -> Option<u32> {
        self.ttl
    }

    /// Decode a CONNECTED body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Ok(Connected::new_empty());
        }
        let octets: [u8; 4] = body[0..4].try_into().map_err(|_| Error::BadAddress)?;
        let addr = Some(Ipv4Addr::from(octets));
        let ttl = if body.len() >= 8 {
            Some(u32::from_be_bytes(
                body[4..8].try_into().map_err(|_| Error::BadAddress)?,
            ))
        } else {
            None
        };
        Ok(Connected { addr, ttl })
    }

    /// Encode this CONNECTED body into `out`, returning the number of
    /// bytes written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        match (self.addr, self.ttl) {
            (Some(addr), ttl) => {
                if out.len() < 8 {
                    return Err(Error::Truncated {
                        wanted: 8,
                        have: out.len(),
                    });
                }
                out[0..4].copy_from_slice(&addr.octets());
                out[4..8].copy_from_slice(&ttl.unwrap_or(u32::MAX).to_be_bytes());
                Ok(8)
            }
            (None, _) => Ok(0),
        }
    }
}

/// A single answer within a RESOLVED message.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum ResolvedAnswer {
    /// An IP address.
    Ip(IpAddr),
    /// The lookup failed, but trying again might work.
    TransientError,
    /// The lookup failed and will keep failing.
    NontransientError,
    /// An answer type this implementation does not interpret; carried
    /// through opaquely.
    Other(AddrType, Vec<u8>),
}

/// The body of a RESOLVED message: the first answer it carries, plus
/// the answer's TTL when one was given.
///
/// (The engine only ever acts on the first answer; further answers are
/// the name-resolution collaborator's business.)
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Resolved {
    /// The first answer in the message.
    answer: ResolvedAnswer,
    /// How long the answer may be cached, if we were told.
    ttl: Option<u32>,
    /// The raw answer bytes, for relaying to the SOCKS layer.
    raw: Vec<u8>,
}

impl Resolved {
    /// Return the first answer.
    pub fn answer(&self) -> &ResolvedAnswer {
        &self.answer
    }
    /// Return the answer's TTL, if one was given.
    pub fn ttl(&self) -> Option<u32> {
        self.ttl
    }
    /// Return the raw value bytes of the first answer.
    pub fn raw_answer(&self) -> &[u8] {
        &self.raw
    }
    /// Return the wire type code of the first answer.
    pub fn answer_type(&self) -> AddrType {
        match &self.answer {
            ResolvedAnswer::Ip(IpAddr::V4(_)) => AddrType::IPV4,
            ResolvedAnswer::Ip(IpAddr::V6(_)) => AddrType::IPV6,
            ResolvedAnswer::TransientError => AddrType::ERROR_TRANSIENT,
            ResolvedAnswer::NontransientError => AddrType::ERROR_NONTRANSIENT,
            ResolvedAnswer::Other(t, _) => *t,
        }
    }

    /// Decode the leading answer of a RESOLVED body.
    ///
    /// Fails on malformed answers (a declared answer length that
    /// overruns the body).
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 2 {
            return Err(Error::Truncated {
                wanted: 2,
                have: body.len(),
            });
        }
        let answer_len = usize::from(body[1]);
        if answer_len + 2 > body.len() {
            return Err(Error::Truncated {
                wanted: answer_len + 2,
                have: body.len(),
            });
        }
        let atype = AddrType::from(body[0]);
        let raw = body[2..2 + answer_len].to_vec();
        let answer = match atype {
            AddrType::IPV4 if answer_len >= 4 => {
                let octets: [u8; 4] = raw[0..4].try_into().map_err(|_| Error::BadAddress)?;
                ResolvedAnswer::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            AddrType::IPV6 if answer_len >= 16 => {
                let octets: [u8; 16] = raw[0..16].try_into().map_err(|_| Error::BadAddress)?;
                ResolvedAnswer::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            AddrType::ERROR_TRANSIENT => ResolvedAnswer::TransientError,
            AddrType::ERROR_NONTRANSIENT => ResolvedAnswer::NontransientError,
            other => ResolvedAnswer::Other(other, raw.clone()),
        };
        let ttl = if body.len() >= answer_len + 6 {
            Some(u32::from_be_bytes(
                body[2 + answer_len..6 + answer_len]
                    .try_into()
                    .map_err(|_| Error::BadAddress)?,
            ))
        } else {
            None
        };
        Ok(Resolved { answer, ttl, raw })
    }
}

/// The body of a TRUNCATED message: the reason the forward part of the
/// circuit went away.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Truncated {
    /// Why the circuit was truncated.
    reason: DestroyReason,
}

impl Truncated {
    /// Make a new TRUNCATED body.
    pub fn new(reason: DestroyReason) -> Self {
        Truncated { reason }
    }
    /// Return the reason for truncation.
    pub fn reason(&self) -> DestroyReason {
        self.reason
    }
    /// Decode a TRUNCATED body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(Error::Truncated { wanted: 1, have: 0 });
        }
        Ok(Truncated {
            reason: body[0].into(),
        })
    }
    /// Encode this TRUNCATED body into `out`.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Err(Error::Truncated { wanted: 1, have: 0 });
        }
        out[0] = self.reason.into();
        Ok(1)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn address_tlv_roundtrip() {
        let v4 = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let v6 = IpAddr::V6("2001:db8::1".parse().unwrap());
        for addr in [v4, v6] {
            let mut buf = [0_u8; 18];
            let n = encode_address(&addr, &mut buf).unwrap();
            let (decoded, consumed) = decode_address(&buf[..n]).unwrap();
            assert_eq!(decoded, Some(addr));
            assert_eq!(consumed, n);
            // encode(decode(tlv)) == tlv
            let mut buf2 = [0_u8; 18];
            let n2 = encode_address(&decoded.unwrap(), &mut buf2).unwrap();
            assert_eq!(buf[..n], buf2[..n2]);
        }
    }

    #[test]
    fn address_tlv_unknown_type_is_skipped() {
        // Type 9 with 3 value bytes, then one trailing byte.
        let payload = hex!("09 03 aabbcc 55");
        let (addr, consumed) = decode_address(&payload).unwrap();
        assert_eq!(addr, None);
        assert_eq!(consumed, 5);
        assert_eq!(payload[consumed], 0x55);
    }

    #[test]
    fn address_tlv_malformed() {
        assert!(decode_address(&[1]).is_err());
        // Declared length overruns the payload.
        assert!(decode_address(&hex!("01 04 aabb")).is_err());
        // IPv4 with a bad length.
        assert!(decode_address(&hex!("01 03 aabbcc")).is_err());
    }

    #[test]
    fn end_roundtrip() {
        assert_eq!(End::decode(&[]).unwrap().reason(), EndReason::MISC);

        let e = End::decode(&[EndReason::TIMEOUT.into()]).unwrap();
        assert_eq!(e.reason(), EndReason::TIMEOUT);
        assert_eq!(e.addr(), None);

        let body = hex!("04 7f000001 00000e10");
        let e = End::decode(&body).unwrap();
        assert_eq!(e.reason(), EndReason::EXITPOLICY);
        assert_eq!(
            e.addr(),
            Some((IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 3600))
        );
        let mut out = [0_u8; 21];
        let n = e.encode(&mut out).unwrap();
        assert_eq!(out[..n], body);

        // An address with no TTL gets TTL MAX.
        let e = End::decode(&hex!("04 7f000001")).unwrap();
        assert_eq!(
            e.addr(),
            Some((IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), u32::MAX))
        );
    }

    #[test]
    fn connected_decode() {
        let c = Connected::decode(&[]).unwrap();
        assert_eq!(c.addr(), None);

        let c = Connected::decode(&hex!("c0000201")).unwrap();
        assert_eq!(c.addr(), Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(c.ttl(), None);

        let c = Connected::decode(&hex!("c0000201 00000080")).unwrap();
        assert_eq!(c.ttl(), Some(128));

        let mut out = [0_u8; 8];
        let n = Connected::new_with_addr(Ipv4Addr::new(192, 0, 2, 1), 128)
            .encode(&mut out)
            .unwrap();
        assert_eq!(out[..n], hex!("c0000201 00000080"));
    }

    #[test]
    fn resolved_decode() {
        let r = Resolved::decode(&hex!("01 04 c0000201 00000e10")).unwrap();
        assert_eq!(
            r.answer(),
            &ResolvedAnswer::Ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
        );
        assert_eq!(r.ttl(), Some(3600));
        assert_eq!(r.answer_type(), AddrType::IPV4);

        let r = Resolved::decode(&hex!("f0 00")).unwrap();
        assert_eq!(r.answer(), &ResolvedAnswer::TransientError);
        assert_eq!(r.ttl(), None);

        // Declared answer length overruns the body.
        assert!(Resolved::decode(&hex!("01 10 c0000201")).is_err());
        assert!(Resolved::decode(&[1]).is_err());
    }

    #[test]
    fn truncated_roundtrip() {
        let t = Truncated::decode(&[DestroyReason::REQUESTED.into()]).unwrap();
        assert_eq!(t.reason(), DestroyReason::REQUESTED);
        let mut out = [0_u8; 1];
        assert_eq!(t.encode(&mut out).unwrap(), 1);
        assert_eq!(out[0], u8::from(DestroyReason::REQUESTED));
    }
}
