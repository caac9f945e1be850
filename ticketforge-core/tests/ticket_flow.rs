//! Integration tests for the broker's ticket flow.
//!
//! These tests drive a [`TicketBroker`] backed by scripted transports and check:
//! - Cached tokens are served until their lifetime runs out
//! - Expired tokens are re-acquired through a fresh transport
//! - Failures evict the cache and never leave a transport open
//! - Malformed identities never reach a backend

use bytes::Bytes;
use std::time::Duration;
use ticketforge_core::{
    BrokerSettings, CachePolicy, Namespace, ServicePrincipal, Session, TicketBroker, TicketError,
    TicketTransport, TicketforgeError, TokenCache,
    transport::scripted::{Script, ScriptedFactory, ScriptedTransport, Step},
};

fn spn() -> ServicePrincipal {
    ServicePrincipal::parse("HTTP/svc.example.com").unwrap()
}

/// Broker with a paused-time friendly setup: no sweeper, no timeout timer.
fn broker(script: &Script) -> TicketBroker<ScriptedFactory> {
    TicketBroker::new(
        ScriptedFactory::new(script.clone()),
        TokenCache::with_sweep_interval(Duration::ZERO),
        BrokerSettings {
            acquire_timeout: None,
            ..BrokerSettings::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_token_expires_after_ten_minutes() {
    let script = Script::new();
    script.push_outcome(Ok(Bytes::from_static(b"first")));
    script.set_ticket(&b"second"[..]);
    let broker = broker(&script);
    let session = Session::new();

    let token = broker.select(&session, spn(), None).await.unwrap();
    assert_eq!(token.encoded.expose(), "Zmlyc3Q=");

    tokio::time::advance(Duration::from_secs(599)).await;
    let cached = broker.ticket(&spn(), CachePolicy::PreferCached).await.unwrap();
    assert!(cached.from_cache);
    assert_eq!(cached.encoded.expose(), "Zmlyc3Q=");
    assert_eq!(cached.expires_in, Duration::from_secs(1));
    assert_eq!(script.ticket_requests(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(broker.cache().get_in(Namespace::Token, spn().as_str()).is_none());

    let fresh = broker.ticket(&spn(), CachePolicy::PreferCached).await.unwrap();
    assert!(!fresh.from_cache);
    assert_eq!(fresh.encoded.expose(), "c2Vjb25k");
    assert_eq!(script.ticket_requests(), 2);

    // Every acquisition ran on its own transport, and each one was closed.
    assert_eq!(script.connects(), 2);
    assert_eq!(script.releases(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_custom_ttl_applies_to_cached_tokens() {
    let script = Script::new();
    script.set_ticket(&b"token"[..]);
    let broker = TicketBroker::new(
        ScriptedFactory::new(script.clone()),
        TokenCache::with_sweep_interval(Duration::ZERO),
        BrokerSettings {
            token_ttl: Duration::from_secs(30),
            acquire_timeout: None,
            ..BrokerSettings::default()
        },
    );

    broker.ticket(&spn(), CachePolicy::PreferCached).await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    broker.ticket(&spn(), CachePolicy::PreferCached).await.unwrap();

    assert_eq!(script.ticket_requests(), 2);
}

#[tokio::test]
async fn test_missing_credential_surfaces_connection_error() {
    let script = Script::new();
    script.set_connect(Step::Fail(TicketError::Connection {
        message: "no credentials cache found".into(),
    }));
    let broker = broker(&script);
    let session = Session::new();

    let err = broker.select(&session, spn(), None).await.unwrap_err();
    match err {
        TicketforgeError::Ticket(TicketError::Connection { message }) => {
            assert!(message.contains("credentials cache"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(session.token().is_none());
    assert_eq!(script.ticket_requests(), 0);
    assert_eq!(script.releases(), 0);
    assert!(broker.cache().is_empty());
}

#[tokio::test]
async fn test_switching_identity_keeps_tokens_apart() {
    let script = Script::new();
    script.push_outcome(Ok(Bytes::from_static(b"a")));
    script.push_outcome(Ok(Bytes::from_static(b"b")));
    let broker = broker(&script);
    let session = Session::new();
    let other = ServicePrincipal::parse("HTTP@other.example.com").unwrap();

    broker.select(&session, spn(), Some("Service".into())).await.unwrap();
    broker.select(&session, other.clone(), None).await.unwrap();

    assert_eq!(session.identity(), Some(other));
    assert_eq!(session.authorization_header().unwrap().expose(), "Negotiate Yg==");
    assert_eq!(
        broker.cache().list_keys(),
        vec!["token:HTTP/svc.example.com", "token:HTTP@other.example.com"]
    );
    assert_eq!(
        script.requested(),
        vec!["HTTP/svc.example.com", "HTTP@other.example.com"]
    );
}

#[test]
fn test_malformed_identity_never_reaches_backend() {
    let mut transport = ScriptedTransport::new().with_ticket(&b"token"[..]);
    let script = transport.handle();
    transport.connect().unwrap();

    for identity in ["", "nohostnoservice", "/host", "HTTP/", "HTTP/a/b", "HTTP@a@b"] {
        let err = transport.ticket_for(identity).unwrap_err();
        assert!(
            matches!(err, TicketError::InvalidSpnFormat(_)),
            "{identity:?} gave {err:?}"
        );
        assert!(err.is_permanent());
    }
    assert_eq!(script.ticket_requests(), 0);

    let ticket = transport.ticket_for("HTTP/svc.example.com").unwrap();
    assert_eq!(ticket.as_bytes(), b"token");
    transport.close();
}

#[test]
fn test_malformed_identity_rejected_at_parse() {
    let err = ServicePrincipal::parse("not-a-principal").unwrap_err();
    assert_eq!(err.spn(), "not-a-principal");
    assert!(err.to_string().contains("expected service/hostname or service@hostname"));
}
