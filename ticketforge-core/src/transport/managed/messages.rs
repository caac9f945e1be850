//! Kerberos V5 messages (RFC 4120) for a TGS exchange and an AP-REQ.
//!
//! The DER types come from `kerberos_asn1`. This module converts between
//! them and the credential cache's [`Principal`], builds the requests the
//! client sends, and classifies what the KDC answers.

use chrono::{DateTime, Timelike, Utc};
use kerberos_asn1::{
    ApReq, Asn1Object, Authenticator, Checksum, EncTgsRepPart, EncryptedData, KdcReqBody,
    KerberosTime, KrbError, PaData, PrincipalName, TgsRep, TgsReq, Ticket,
};
use thiserror::Error;

use super::ccache::Principal;

pub const NT_PRINCIPAL: i32 = 1;
pub const NT_SRV_INST: i32 = 2;

pub const PA_TGS_REQ: i32 = 1;

/// forwardable, renewable, canonicalize
pub const DEFAULT_KDC_OPTIONS: u32 = 0x4081_0000;
pub const AP_OPTION_MUTUAL_REQUIRED: u32 = 0x2000_0000;

/// RFC 4121 authenticator checksum type.
pub const GSS_CHECKSUM_TYPE: i32 = 0x8003;
pub const GSS_C_MUTUAL_FLAG: u32 = 2;
pub const GSS_C_CONF_FLAG: u32 = 16;
pub const GSS_C_INTEG_FLAG: u32 = 32;

/// Key usage numbers.
pub mod usage {
    pub const TGS_REQ_BODY_CHECKSUM: i32 = 6;
    pub const TGS_REQ_AUTHENTICATOR: i32 = 7;
    pub const TGS_REP_ENC_PART: i32 = 8;
    pub const AP_REQ_AUTHENTICATOR: i32 = 11;
}

const TAG_TGS_REP: u8 = 0x6d;
const TAG_KRB_ERROR: u8 = 0x7e;

/// Error type for message decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("malformed {what}: {message}")]
    Malformed { what: &'static str, message: String },

    #[error("unexpected Kerberos message (tag {tag:#04x})")]
    Unexpected { tag: u8 },
}

fn decode<T: Asn1Object>(what: &'static str, data: &[u8]) -> Result<T, MessageError> {
    T::parse(data)
        .map(|(_, value)| value)
        .map_err(|e| MessageError::Malformed {
            what,
            message: format!("{:?}", e),
        })
}

pub fn principal_name(principal: &Principal) -> PrincipalName {
    PrincipalName {
        name_type: principal.name_type,
        name_string: principal.components.clone(),
    }
}

pub fn principal_from(realm: &str, name: &PrincipalName) -> Principal {
    Principal::new(name.name_type, realm, name.name_string.clone())
}

/// The RFC 4121 authenticator checksum with null channel bindings.
pub fn gss_checksum(flags: u32) -> Checksum {
    let mut value = Vec::with_capacity(24);
    value.extend_from_slice(&16u32.to_le_bytes());
    value.extend_from_slice(&[0u8; 16]);
    value.extend_from_slice(&flags.to_le_bytes());
    Checksum {
        cksumtype: GSS_CHECKSUM_TYPE,
        checksum: value,
    }
}

pub fn kerberos_time(t: DateTime<Utc>) -> KerberosTime {
    t.with_nanosecond(0).unwrap_or(t).into()
}

fn utc(t: &KerberosTime) -> DateTime<Utc> {
    ***t
}

pub fn encrypted(etype: i32, cipher: Vec<u8>) -> EncryptedData {
    EncryptedData {
        etype,
        kvno: None,
        cipher,
    }
}

/// Decode a ticket stored in the credential cache.
pub fn parse_ticket(der: &[u8]) -> Result<Ticket, MessageError> {
    decode("ticket", der)
}

/// The TGS-REQ body asking for `server` until `till`.
pub fn tgs_req_body(
    server: &Principal,
    till: DateTime<Utc>,
    nonce: u32,
    etypes: &[i32],
) -> KdcReqBody {
    KdcReqBody {
        kdc_options: DEFAULT_KDC_OPTIONS.into(),
        realm: server.realm.clone(),
        sname: Some(principal_name(server)),
        till: kerberos_time(till),
        nonce,
        etypes: etypes.to_vec(),
        ..Default::default()
    }
}

pub fn tgs_req(body: KdcReqBody, pa_tgs_req: &ApReq) -> TgsReq {
    TgsReq {
        padata: Some(vec![PaData {
            padata_type: PA_TGS_REQ,
            padata_value: pa_tgs_req.build(),
        }]),
        req_body: body,
        ..Default::default()
    }
}

/// An authenticator for `client` stamped with `now`.
pub fn authenticator(
    client: &Principal,
    cksum: Option<Checksum>,
    now: DateTime<Utc>,
    seq_number: Option<u32>,
) -> Authenticator {
    Authenticator {
        crealm: client.realm.clone(),
        cname: principal_name(client),
        cksum,
        cusec: now.timestamp_subsec_micros().try_into().unwrap_or_default(),
        ctime: kerberos_time(now),
        seq_number,
        ..Default::default()
    }
}

pub fn ap_req(ap_options: u32, ticket: Ticket, authenticator: EncryptedData) -> ApReq {
    ApReq {
        ap_options: ap_options.into(),
        ticket,
        authenticator,
        ..Default::default()
    }
}

/// What a KDC answered to a TGS-REQ.
#[derive(Debug, Clone)]
pub enum KdcReply {
    Tgs(TgsRep),
    Error(KrbError),
}

impl KdcReply {
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        match data.first().copied() {
            Some(TAG_TGS_REP) => decode("TGS-REP", data).map(Self::Tgs),
            Some(TAG_KRB_ERROR) => decode("KRB-ERROR", data).map(Self::Error),
            Some(tag) => Err(MessageError::Unexpected { tag }),
            None => Err(MessageError::Malformed {
                what: "KDC reply",
                message: "empty".to_string(),
            }),
        }
    }
}

/// The decrypted part of a TGS-REP, with times and flags unpacked.
#[derive(Debug, Clone)]
pub struct ReplyPart {
    pub keytype: i32,
    pub keyvalue: Vec<u8>,
    pub nonce: u32,
    pub flags: u32,
    pub auth_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub renew_till: Option<DateTime<Utc>>,
    pub server: Principal,
}

impl ReplyPart {
    pub fn decode(plain: &[u8]) -> Result<Self, MessageError> {
        let part: EncTgsRepPart = decode("EncTGSRepPart", plain)?;
        Ok(Self {
            keytype: part.key.keytype,
            keyvalue: part.key.keyvalue.clone(),
            nonce: part.nonce,
            flags: part.flags.flags,
            auth_time: utc(&part.authtime),
            start_time: part.starttime.as_ref().map(utc),
            end_time: utc(&part.endtime),
            renew_till: part.renew_till.as_ref().map(utc),
            server: principal_from(&part.srealm, &part.sname),
        })
    }
}

/// The RFC 4120 name of an error code, when it is a common one.
pub fn error_name(code: i32) -> &'static str {
    match code {
        6 => "KDC_ERR_C_PRINCIPAL_UNKNOWN",
        7 => "KDC_ERR_S_PRINCIPAL_UNKNOWN",
        12 => "KDC_ERR_POLICY",
        13 => "KDC_ERR_BADOPTION",
        14 => "KDC_ERR_ETYPE_NOSUPP",
        24 => "KDC_ERR_PREAUTH_FAILED",
        25 => "KDC_ERR_PREAUTH_REQUIRED",
        31 => "KRB_AP_ERR_BAD_INTEGRITY",
        32 => "KRB_AP_ERR_TKT_EXPIRED",
        37 => "KRB_AP_ERR_SKEW",
        41 => "KRB_AP_ERR_MODIFIED",
        68 => "KDC_ERR_WRONG_REALM",
        _ => "KRB_ERR_UNKNOWN",
    }
}

/// `NAME (code): e-text`
pub fn describe_error(err: &KrbError) -> String {
    let mut text = format!("{} ({})", error_name(err.error_code), err.error_code);
    if let Some(e_text) = &err.e_text {
        text.push_str(": ");
        text.push_str(e_text);
    }
    text
}


#[cfg(test)]
mod tests {
    use super::kdc_side::*;
    use super::*;
    use chrono::TimeZone;

    fn alice() -> Principal {
        Principal::new(NT_PRINCIPAL, "EXAMPLE.COM", vec!["alice".to_string()])
    }

    fn http() -> Principal {
        Principal::new(
            NT_SRV_INST,
            "EXAMPLE.COM",
            vec!["HTTP".to_string(), "svc.example.com".to_string()],
        )
    }

    #[test]
    fn test_gss_checksum_layout() {
        let cksum = gss_checksum(GSS_C_MUTUAL_FLAG | GSS_C_INTEG_FLAG);
        assert_eq!(cksum.cksumtype, 0x8003);
        assert_eq!(cksum.checksum.len(), 24);
        assert_eq!(&cksum.checksum[..4], &[16, 0, 0, 0]);
        assert!(cksum.checksum[4..20].iter().all(|b| *b == 0));
        assert_eq!(&cksum.checksum[20..], &[34, 0, 0, 0]);
    }

    #[test]
    fn test_principal_name_conversion() {
        let name = principal_name(&http());
        assert_eq!(name.name_type, NT_SRV_INST);
        assert_eq!(name.name_string, vec!["HTTP", "svc.example.com"]);
        assert_eq!(principal_from("EXAMPLE.COM", &name), http());
    }

    #[test]
    fn test_tgs_req_carries_ap_req() {
        let till = Utc.with_ymd_and_hms(2026, 3, 1, 22, 0, 0).unwrap();
        let body = tgs_req_body(&http(), till, 42, &[18, 17]);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let auth = authenticator(&alice(), None, now, None);
        let pa = ap_req(0, fake_ticket(&Principal::tgt("EXAMPLE.COM"), b"tgt"), encrypted(18, auth.build()));

        let wire = tgs_req(body, &pa).build();
        assert_eq!(wire[0], 0x6c);

        let decoded = decode_tgs_req(&wire);
        assert_eq!(decoded.req_body.nonce, 42);
        assert_eq!(decoded.req_body.realm, "EXAMPLE.COM");
        assert_eq!(decoded.req_body.etypes, vec![18, 17]);
        assert_eq!(
            decoded.req_body.sname.as_ref().map(|s| s.name_string.clone()),
            Some(vec!["HTTP".to_string(), "svc.example.com".to_string()])
        );

        let padata = decoded.padata.unwrap();
        assert_eq!(padata[0].padata_type, PA_TGS_REQ);
        let inner = decode_ap_req(&padata[0].padata_value);
        assert_eq!(inner.ticket.realm, "EXAMPLE.COM");
        assert_eq!(inner.ticket.enc_part.cipher, b"tgt");
    }

    #[test]
    fn test_authenticator_time_has_no_fraction() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::microseconds(250_123);
        let auth = decode_authenticator(&authenticator(&alice(), None, now, Some(7)).build());
        assert_eq!(utc(&auth.ctime), Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        assert_eq!(auth.seq_number, Some(7));
        assert_eq!(auth.crealm, "EXAMPLE.COM");
    }

    #[test]
    fn test_decode_krb_error() {
        let reply = krb_error(7, "EXAMPLE.COM", &http());
        match KdcReply::decode(&reply).unwrap() {
            KdcReply::Error(err) => {
                assert_eq!(err.error_code, 7);
                assert_eq!(describe_error(&err), "KDC_ERR_S_PRINCIPAL_UNKNOWN (7)");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_other_messages() {
        assert_eq!(
            KdcReply::decode(&[0x30, 0x00]).unwrap_err(),
            MessageError::Unexpected { tag: 0x30 }
        );
        assert!(matches!(
            KdcReply::decode(&[]),
            Err(MessageError::Malformed { .. })
        ));
        assert!(matches!(
            KdcReply::decode(&[TAG_TGS_REP, 0x05, 0x00]),
            Err(MessageError::Malformed { what: "TGS-REP", .. })
        ));
    }

    #[test]
    fn test_parse_ticket_rejects_garbage() {
        assert!(parse_ticket(b"\x61\x03tgt").is_err());
        let der = fake_ticket_der(&http(), b"marker");
        assert_eq!(parse_ticket(&der).unwrap().enc_part.cipher, b"marker");
    }

    #[test]
    fn test_error_names() {
        assert_eq!(error_name(37), "KRB_AP_ERR_SKEW");
        assert_eq!(error_name(9999), "KRB_ERR_UNKNOWN");
    }
}
