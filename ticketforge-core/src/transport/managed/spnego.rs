//! GSS-API token framing.
//!
//! - [`krb5_token`]: an AP-REQ behind the RFC 1964 krb5 mechanism header
//!   (`[APPLICATION 0]`, mechanism OID, TOK_ID `01 00`)
//! - [`NegTokenInit`]: the SPNEGO initial token (RFC 4178) offering one or more
//!   mechanisms and carrying the optimistic mechanism token

use yasna::models::ObjectIdentifier;
use yasna::{ASN1Error, ASN1ErrorKind, ASN1Result, Tag};

use crate::transport::negotiate::Mechanism;

/// TOK_ID of a krb5 AP-REQ token.
pub const TOK_ID_AP_REQ: [u8; 2] = [0x01, 0x00];

fn oid(mech: Mechanism) -> ObjectIdentifier {
    ObjectIdentifier::from_slice(mech.oid_arcs())
}

/// Wrap a DER AP-REQ in the krb5 GSS header.
pub fn krb5_token(ap_req: &[u8]) -> Vec<u8> {
    let mut inner = yasna::construct_der(|w| w.write_oid(&oid(Mechanism::Krb5)));
    inner.extend_from_slice(&TOK_ID_AP_REQ);
    inner.extend_from_slice(ap_req);
    yasna::construct_der(|w| w.write_tagged(Tag::application(0), |w| w.write_der(&inner)))
}

/// Strip the krb5 GSS header and return the AP-REQ, if `token` has one.
pub fn parse_krb5_token(token: &[u8]) -> Option<&[u8]> {
    let (tag, rest) = token.split_first()?;
    if *tag != 0x60 {
        return None;
    }
    let (len, body) = read_length(rest)?;
    if body.len() != len {
        return None;
    }

    let mech = Mechanism::Krb5.oid_der();
    let (&oid_tag, after_tag) = body.split_first()?;
    let (&oid_len, after_len) = after_tag.split_first()?;
    if oid_tag != 0x06 || oid_len as usize != mech.len() || !after_len.starts_with(mech) {
        return None;
    }
    after_len[mech.len()..].strip_prefix(&TOK_ID_AP_REQ[..])
}

fn read_length(buf: &[u8]) -> Option<(usize, &[u8])> {
    let (&first, rest) = buf.split_first()?;
    if first < 0x80 {
        return Some((first as usize, rest));
    }
    let count = (first & 0x7f) as usize;
    if count == 0 || count > 4 || rest.len() < count {
        return None;
    }
    let len = rest[..count]
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Some((len, &rest[count..]))
}

/// SPNEGO `NegTokenInit` inside an `InitialContextToken`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegTokenInit {
    pub mech_types: Vec<Mechanism>,
    pub mech_token: Vec<u8>,
}

impl NegTokenInit {
    /// Offer krb5 with `mech_token` as the optimistic token.
    pub fn krb5(mech_token: Vec<u8>) -> Self {
        Self {
            mech_types: vec![Mechanism::Krb5],
            mech_token,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        yasna::construct_der(|w| {
            w.write_tagged_implicit(Tag::application(0), |w| {
                w.write_sequence(|w| {
                    w.next().write_oid(&oid(Mechanism::Spnego));
                    w.next().write_tagged(Tag::context(0), |w| {
                        w.write_sequence(|w| {
                            w.next().write_tagged(Tag::context(0), |w| {
                                w.write_sequence_of(|w| {
                                    for mech in &self.mech_types {
                                        w.next().write_oid(&oid(*mech));
                                    }
                                })
                            });
                            w.next()
                                .write_tagged(Tag::context(2), |w| w.write_bytes(&self.mech_token));
                        })
                    });
                })
            })
        })
    }

    /// Parse an initial SPNEGO token. Unknown mechanisms are dropped.
    pub fn decode(token: &[u8]) -> ASN1Result<Self> {
        yasna::parse_ber(token, |r| {
            r.read_tagged_implicit(Tag::application(0), |r| {
                r.read_sequence(|r| {
                    let this_mech = r.next().read_oid()?;
                    if this_mech != oid(Mechanism::Spnego) {
                        return Err(ASN1Error::new(ASN1ErrorKind::Invalid));
                    }
                    r.next().read_tagged(Tag::context(0), |r| {
                        r.read_sequence(|r| {
                            let oids = r
                                .next()
                                .read_tagged(Tag::context(0), |r| r.collect_sequence_of(|r| r.read_oid()))?;
                            r.read_optional(|r| r.read_tagged(Tag::context(1), |r| r.read_der()))?;
                            let mech_token = r
                                .read_optional(|r| r.read_tagged(Tag::context(2), |r| r.read_bytes()))?
                                .unwrap_or_default();
                            while r.read_optional(|r| r.read_der())?.is_some() {}

                            let mech_types = oids
                                .iter()
                                .filter_map(|o| {
                                    Mechanism::FALLBACK_ORDER
                                        .into_iter()
                                        .find(|m| oid(*m) == *o)
                                })
                                .collect();
                            Ok(Self {
                                mech_types,
                                mech_token,
                            })
                        })
                    })
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_krb5_token_header() {
        let token = krb5_token(b"\x6e\x03abc");
        assert_eq!(token[0], 0x60);
        assert_eq!(token[1] as usize, token.len() - 2);
        assert_eq!(&token[2..4], &[0x06, 0x09]);
        assert_eq!(&token[4..13], Mechanism::Krb5.oid_der());
        assert_eq!(&token[13..15], &TOK_ID_AP_REQ);
        assert_eq!(parse_krb5_token(&token), Some(&b"\x6e\x03abc"[..]));
    }

    #[test]
    fn test_krb5_token_long_form_length() {
        let ap_req = vec![0x42u8; 300];
        let token = krb5_token(&ap_req);
        assert_eq!(token[1], 0x82);
        assert_eq!(parse_krb5_token(&token), Some(&ap_req[..]));
    }

    #[test]
    fn test_parse_krb5_token_rejects_garbage() {
        assert_eq!(parse_krb5_token(&[]), None);
        assert_eq!(parse_krb5_token(&[0x30, 0x00]), None);
        assert_eq!(parse_krb5_token(&[0x60, 0x05, 0x06, 0x01, 0x00]), None);
    }

    #[test]
    fn test_neg_token_init_layout() {
        let inner = krb5_token(b"ap-req");
        let token = NegTokenInit::krb5(inner.clone()).encode();

        assert_eq!(token[0], 0x60);
        // thisMech is SPNEGO
        assert_eq!(&token[2..4], &[0x06, 0x06]);
        assert_eq!(&token[4..10], Mechanism::Spnego.oid_der());
        // negTokenInit [0]
        assert_eq!(token[10], 0xa0);

        let decoded = NegTokenInit::decode(&token).unwrap();
        assert_eq!(decoded.mech_types, vec![Mechanism::Krb5]);
        assert_eq!(decoded.mech_token, inner);
        assert_eq!(parse_krb5_token(&decoded.mech_token), Some(&b"ap-req"[..]));
    }

    #[test]
    fn test_decode_rejects_non_spnego() {
        let token = krb5_token(b"x");
        assert!(NegTokenInit::decode(&token).is_err());
    }
}
