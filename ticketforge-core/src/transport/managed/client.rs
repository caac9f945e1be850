//! SPNEGO initiator backed by a file credential cache.
//!
//! [`SpnegoClient`] follows the GSS calling sequence: an explicit
//! [`acquire_credential`](SpnegoClient::acquire_credential) step that locates
//! the ticket-granting ticket, an [`init_sec_context`](SpnegoClient::init_sec_context)
//! step that obtains a service ticket (from the cache or the KDC) and builds the
//! AP-REQ, and [`marshal`](SpnegoClient::marshal) to serialize the result.

use chrono::{DateTime, Utc};
use kerberos_asn1::{Asn1Object, Checksum};

use super::ccache::{CCache, Credential, Principal, SessionKey};
use super::crypto::{Enctype, Key};
use super::kdc::KdcExchange;
use super::krb5conf::Krb5Config;
use super::messages::{self, KdcReply, ReplyPart, usage};
use super::spnego::{self, NegTokenInit};
use crate::spn::ServicePrincipal;
use crate::store::SecretBytes;
use crate::transport::TicketError;

/// Enctypes offered in TGS requests, strongest first.
const REQUESTED_ETYPES: [i32; 2] = [18, 17];

/// An initiator credential: the TGT the client will present.
#[derive(Debug, Clone)]
pub struct InitiatorCredential {
    pub client: Principal,
    pub tgt: Credential,
}

/// Builds SPNEGO tokens from a credential cache.
#[derive(Debug)]
pub struct SpnegoClient<K: KdcExchange> {
    cache: CCache,
    config: Krb5Config,
    kdc: K,
    debug: bool,
    credential: Option<InitiatorCredential>,
    /// Service tickets obtained during this session.
    issued: Vec<Credential>,
}

impl<K: KdcExchange> SpnegoClient<K> {
    pub fn new(cache: CCache, config: Krb5Config, kdc: K) -> Self {
        Self {
            cache,
            config,
            kdc,
            debug: false,
            credential: None,
            issued: Vec::new(),
        }
    }

    pub fn set_debug(&mut self, enabled: bool) {
        self.debug = enabled;
    }

    /// The principal the credential cache belongs to.
    pub fn default_principal(&self) -> &Principal {
        &self.cache.default_principal
    }

    /// Locate a usable TGT for the default principal.
    pub fn acquire_credential(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<&InitiatorCredential, TicketError> {
        let client = self.cache.default_principal.clone();
        let tgt = self
            .cache
            .find_tgt(&client.realm, now)
            .cloned()
            .ok_or_else(|| TicketError::Acquisition {
                message: format!("no valid ticket-granting ticket for {} in credential cache", client),
            })?;

        if self.debug {
            tracing::debug!(client = %client, expires = %tgt.end_time, "initiator credential acquired");
        }
        Ok(self
            .credential
            .insert(InitiatorCredential { client, tgt }))
    }

    /// Build the SPNEGO initial token for `spn`.
    ///
    /// Requires [`acquire_credential`](Self::acquire_credential) first.
    pub fn init_sec_context(
        &mut self,
        spn: &ServicePrincipal,
        now: DateTime<Utc>,
    ) -> Result<NegTokenInit, TicketError> {
        let credential = self
            .credential
            .clone()
            .ok_or_else(|| TicketError::Acquisition {
                message: "initiator credential not acquired".to_string(),
            })?;

        let server = self.service_principal(spn, &credential.client);
        let service_ticket = self.service_ticket(&credential, &server, now)?;
        let ap_req = build_ap_req(&credential.client, &service_ticket, now)?;

        if self.debug {
            tracing::debug!(spn = %spn, server = %server, len = ap_req.len(), "AP-REQ built");
        }
        Ok(NegTokenInit::krb5(spnego::krb5_token(&ap_req)))
    }

    /// Serialize the token for the wire.
    pub fn marshal(&self, token: &NegTokenInit) -> Vec<u8> {
        token.encode()
    }

    /// `service/host@REALM`, with the realm taken from the identity, then
    /// `[domain_realm]`, then the client's realm.
    pub fn service_principal(&self, spn: &ServicePrincipal, client: &Principal) -> Principal {
        let realm = spn
            .realm()
            .map(str::to_string)
            .or_else(|| self.config.realm_for_host(spn.host()).map(str::to_string))
            .unwrap_or_else(|| client.realm.clone());
        Principal::new(
            messages::NT_SRV_INST,
            realm,
            vec![spn.service().to_string(), spn.host().to_string()],
        )
    }

    fn service_ticket(
        &mut self,
        credential: &InitiatorCredential,
        server: &Principal,
        now: DateTime<Utc>,
    ) -> Result<Credential, TicketError> {
        let issued = self
            .issued
            .iter()
            .filter(|c| c.server.same_name(server) && c.is_valid_at(now))
            .max_by_key(|c| c.end_time);
        if let Some(cached) = issued.or_else(|| self.cache.find_service(server, now)) {
            if self.debug {
                tracing::debug!(server = %server, "reusing cached service ticket");
            }
            return Ok(cached.clone());
        }

        let ticket = self.request_service_ticket(credential, server, now)?;
        self.issued.push(ticket.clone());
        Ok(ticket)
    }

    fn request_service_ticket(
        &self,
        credential: &InitiatorCredential,
        server: &Principal,
        now: DateTime<Utc>,
    ) -> Result<Credential, TicketError> {
        let client = &credential.client;
        let tgt = &credential.tgt;
        let tgt_key = Key::new(tgt.key.enctype, tgt.key.value.expose()).map_err(|e| {
            TicketError::Acquisition {
                message: format!("ticket-granting ticket session key: {}", e),
            }
        })?;

        let tgt_ticket = messages::parse_ticket(&tgt.ticket).map_err(|e| {
            TicketError::Acquisition {
                message: format!("ticket-granting ticket in credential cache: {}", e),
            }
        })?;

        let nonce = rand::random::<u32>() & 0x7fff_ffff;
        let body = messages::tgs_req_body(server, tgt.end_time, nonce, &REQUESTED_ETYPES);
        let body_checksum = Checksum {
            cksumtype: tgt_key.enctype().checksum_type(),
            checksum: tgt_key.checksum(usage::TGS_REQ_BODY_CHECKSUM, &body.build()),
        };
        let authenticator = messages::authenticator(client, Some(body_checksum), now, None);
        let sealed = tgt_key
            .encrypt(usage::TGS_REQ_AUTHENTICATOR, &authenticator.build())
            .map_err(negotiation)?;
        let pa_tgs_req = messages::ap_req(
            0,
            tgt_ticket,
            messages::encrypted(tgt_key.enctype().id(), sealed),
        );
        let request = messages::tgs_req(body, &pa_tgs_req).build();

        let kdcs = self.config.kdcs(&client.realm);
        if self.debug {
            tracing::debug!(server = %server, realm = %client.realm, kdcs = kdcs.len(), "sending TGS-REQ");
        }
        let reply = self
            .kdc
            .exchange(&client.realm, &kdcs, &request)
            .map_err(|e| TicketError::Connection {
                message: e.to_string(),
            })?;

        let rep = match KdcReply::decode(&reply).map_err(negotiation)? {
            KdcReply::Tgs(rep) => rep,
            KdcReply::Error(err) => {
                return Err(TicketError::Negotiation {
                    message: format!(
                        "KDC refused ticket for {}: {}",
                        server,
                        messages::describe_error(&err)
                    ),
                });
            }
        };

        let plain = tgt_key
            .decrypt(usage::TGS_REP_ENC_PART, &rep.enc_part.cipher)
            .map_err(negotiation)?;
        let part = ReplyPart::decode(&plain).map_err(negotiation)?;

        if part.nonce != nonce {
            return Err(TicketError::Negotiation {
                message: "KDC reply nonce does not match request".to_string(),
            });
        }
        if part.server.components.first().map(String::as_str) == Some("krbtgt")
            && !part.server.same_name(server)
        {
            return Err(TicketError::Negotiation {
                message: format!(
                    "KDC returned a referral to {} (cross-realm referrals are not followed)",
                    part.server
                ),
            });
        }
        Enctype::from_i32(part.keytype).map_err(negotiation)?;

        if self.debug {
            tracing::debug!(server = %server, expires = %part.end_time, "service ticket issued");
        }

        Ok(Credential {
            client: client.clone(),
            server: server.clone(),
            key: SessionKey {
                enctype: part.keytype,
                value: SecretBytes::new(part.keyvalue),
            },
            auth_time: part.auth_time,
            start_time: part.start_time.unwrap_or(part.auth_time),
            end_time: part.end_time,
            renew_till: part.renew_till.unwrap_or(part.end_time),
            is_skey: false,
            flags: part.flags,
            ticket: rep.ticket.build().into(),
        })
    }
}

fn build_ap_req(
    client: &Principal,
    service_ticket: &Credential,
    now: DateTime<Utc>,
) -> Result<Vec<u8>, TicketError> {
    let key = Key::new(service_ticket.key.enctype, service_ticket.key.value.expose())
        .map_err(negotiation)?;
    let ticket = messages::parse_ticket(&service_ticket.ticket).map_err(negotiation)?;

    let authenticator = messages::authenticator(
        client,
        Some(messages::gss_checksum(
            messages::GSS_C_MUTUAL_FLAG | messages::GSS_C_CONF_FLAG | messages::GSS_C_INTEG_FLAG,
        )),
        now,
        Some(rand::random::<u32>() & 0x3fff_ffff),
    );
    let sealed = key
        .encrypt(usage::AP_REQ_AUTHENTICATOR, &authenticator.build())
        .map_err(negotiation)?;

    Ok(messages::ap_req(
        messages::AP_OPTION_MUTUAL_REQUIRED,
        ticket,
        messages::encrypted(key.enctype().id(), sealed),
    )
    .build())
}

fn negotiation(e: impl std::fmt::Display) -> TicketError {
    TicketError::Negotiation {
        message: e.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;
    use crate::transport::managed::ccache::fixture;
    use crate::transport::managed::messages::kdc_side::{
        decode_ap_req, decode_authenticator, fake_ticket_der,
    };

    const TGT_KEY: [u8; 32] = [0x11; 32];

    fn alice() -> Principal {
        Principal::new(1, "EXAMPLE.COM", vec!["alice".to_string()])
    }

    fn http() -> Principal {
        Principal::new(2, "EXAMPLE.COM", vec!["HTTP".into(), "svc.example.com".into()])
    }

    fn cache_with_tgt(end: DateTime<Utc>) -> CCache {
        let krbtgt = Principal::tgt("EXAMPLE.COM");
        CCache {
            version: 0x0504,
            default_principal: alice(),
            credentials: vec![fixture::credential(
                &alice(),
                krbtgt.clone(),
                &TGT_KEY,
                end,
                &fake_ticket_der(&krbtgt, b"tgt"),
            )],
        }
    }

    fn config() -> Krb5Config {
        Krb5Config::parse(
            "[libdefaults]\n default_realm = EXAMPLE.COM\n[realms]\n EXAMPLE.COM = {\n  kdc = kdc.example.com\n }\n[domain_realm]\n .corp.example.net = CORP.EXAMPLE.NET\n",
        )
        .unwrap()
    }

    fn spn() -> ServicePrincipal {
        ServicePrincipal::parse("HTTP/svc.example.com").unwrap()
    }

    fn client_with(kdc: FakeKdc, now: DateTime<Utc>) -> SpnegoClient<FakeKdc> {
        SpnegoClient::new(cache_with_tgt(now + chrono::Duration::hours(8)), config(), kdc)
    }

    #[test]
    fn test_acquire_without_tgt_fails() {
        let now = Utc::now();
        let mut client =
            SpnegoClient::new(cache_with_tgt(now - chrono::Duration::hours(1)), config(), FakeKdc::new(&TGT_KEY));
        let err = client.acquire_credential(now).unwrap_err();
        assert!(matches!(err, TicketError::Acquisition { .. }));
    }

    #[test]
    fn test_init_before_acquire_fails() {
        let now = Utc::now();
        let mut client = client_with(FakeKdc::new(&TGT_KEY), now);
        assert!(matches!(
            client.init_sec_context(&spn(), now),
            Err(TicketError::Acquisition { .. })
        ));
    }

    #[test]
    fn test_full_exchange_builds_spnego_token() {
        let now = Utc::now();
        let kdc = FakeKdc::new(&TGT_KEY);
        let seen = kdc.seen.clone();
        let mut client = client_with(kdc, now);

        client.acquire_credential(now).unwrap();
        let token = client.init_sec_context(&spn(), now).unwrap();
        let wire = client.marshal(&token);

        {
            let seen = seen.lock();
            assert_eq!(seen.requests, 1);
            assert_eq!(seen.last_sname.as_deref(), Some("HTTP/svc.example.com"));
            assert!(seen.last_body_checksum_ok);
        }

        let decoded = NegTokenInit::decode(&wire).unwrap();
        let ap_req_der = spnego::parse_krb5_token(&decoded.mech_token).unwrap();
        let ap_req = decode_ap_req(ap_req_der);
        assert_eq!(ap_req.ap_options.flags, messages::AP_OPTION_MUTUAL_REQUIRED);
        assert_eq!(ap_req.ticket.enc_part.cipher, b"service-ticket");

        let service_key = Key::new(18, &SERVICE_KEY).unwrap();
        let auth = decode_authenticator(
            &service_key
                .decrypt(usage::AP_REQ_AUTHENTICATOR, &ap_req.authenticator.cipher)
                .unwrap(),
        );
        assert_eq!(auth.crealm, "EXAMPLE.COM");
        assert_eq!(auth.cname.name_string, vec!["alice".to_string()]);
        assert!(auth.seq_number.is_some());
        let cksum = auth.cksum.unwrap();
        assert_eq!(cksum.cksumtype, messages::GSS_CHECKSUM_TYPE);
        assert_eq!(cksum.checksum[20] & 2, 2);
    }

    #[test]
    fn test_second_request_reuses_issued_ticket() {
        let now = Utc::now();
        let kdc = FakeKdc::new(&TGT_KEY);
        let seen = kdc.seen.clone();
        let mut client = client_with(kdc, now);

        client.acquire_credential(now).unwrap();
        client.init_sec_context(&spn(), now).unwrap();
        client.init_sec_context(&spn(), now).unwrap();
        assert_eq!(seen.lock().requests, 1);
    }

    #[test]
    fn test_cached_service_ticket_skips_kdc() {
        let now = Utc::now();
        let mut cache = cache_with_tgt(now + chrono::Duration::hours(8));
        cache.credentials.push(fixture::credential(
            &alice(),
            http(),
            &SERVICE_KEY,
            now + chrono::Duration::hours(2),
            &fake_ticket_der(&http(), b"svc"),
        ));
        let kdc = FakeKdc::new(&TGT_KEY);
        let seen = kdc.seen.clone();
        let mut client = SpnegoClient::new(cache, config(), kdc);

        client.acquire_credential(now).unwrap();
        let token = client.init_sec_context(&spn(), now).unwrap();
        assert_eq!(seen.lock().requests, 0);

        let ap_req = decode_ap_req(spnego::parse_krb5_token(&token.mech_token).unwrap());
        assert_eq!(ap_req.ticket.enc_part.cipher, b"svc");
    }

    #[test]
    fn test_malformed_cached_tgt_is_acquisition_error() {
        let now = Utc::now();
        let mut cache = cache_with_tgt(now + chrono::Duration::hours(8));
        cache.credentials[0].ticket = bytes::Bytes::from_static(b"\x61\x03tgt");
        let mut client = SpnegoClient::new(cache, config(), FakeKdc::new(&TGT_KEY));

        client.acquire_credential(now).unwrap();
        match client.init_sec_context(&spn(), now).unwrap_err() {
            TicketError::Acquisition { message } => assert!(message.contains("ticket-granting")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_kdc_error_is_negotiation_failure() {
        let now = Utc::now();
        let mut kdc = FakeKdc::new(&TGT_KEY);
        kdc.behavior = Behavior::Refuse(7);
        let mut client = client_with(kdc, now);

        client.acquire_credential(now).unwrap();
        match client.init_sec_context(&spn(), now).unwrap_err() {
            TicketError::Negotiation { message } => {
                assert!(message.contains("KDC_ERR_S_PRINCIPAL_UNKNOWN"), "{message}");
                assert!(message.contains("HTTP/svc.example.com@EXAMPLE.COM"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_nonce_mismatch_rejected() {
        let now = Utc::now();
        let mut kdc = FakeKdc::new(&TGT_KEY);
        kdc.behavior = Behavior::WrongNonce;
        let mut client = client_with(kdc, now);
        client.acquire_credential(now).unwrap();
        assert!(matches!(
            client.init_sec_context(&spn(), now),
            Err(TicketError::Negotiation { .. })
        ));
    }

    #[test]
    fn test_referral_not_followed() {
        let now = Utc::now();
        let mut kdc = FakeKdc::new(&TGT_KEY);
        kdc.behavior = Behavior::Referral;
        let mut client = client_with(kdc, now);
        client.acquire_credential(now).unwrap();
        match client.init_sec_context(&spn(), now).unwrap_err() {
            TicketError::Negotiation { message } => assert!(message.contains("referral")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_service_realm_resolution() {
        let now = Utc::now();
        let client = client_with(FakeKdc::new(&TGT_KEY), now);
        let alice = alice();

        let explicit = ServicePrincipal::parse("HTTP/web.example.com@OTHER.ORG").unwrap();
        assert_eq!(client.service_principal(&explicit, &alice).realm, "OTHER.ORG");

        let mapped = ServicePrincipal::parse("HTTP/app.corp.example.net").unwrap();
        assert_eq!(client.service_principal(&mapped, &alice).realm, "CORP.EXAMPLE.NET");

        let fallback = client.service_principal(&spn(), &alice);
        assert_eq!(fallback.realm, "EXAMPLE.COM");
        assert_eq!(fallback.components, vec!["HTTP".to_string(), "svc.example.com".to_string()]);
        assert_eq!(fallback.name_type, messages::NT_SRV_INST);
    }
}
