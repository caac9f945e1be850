//! Concurrent refresh and cache access tests.
//!
//! Refreshes race independently; whichever commits last wins. These tests make
//! sure racing callers never corrupt session or cache state and never leak an
//! open transport.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ticketforge_core::{
    BrokerSettings, CachePolicy, Namespace, ServicePrincipal, Session, TicketBroker, TokenCache,
    transport::scripted::{Script, ScriptedFactory},
};
use tokio::task::JoinSet;

/// Number of concurrent tasks.
const CONCURRENCY: usize = 16;

/// Operations each task performs in the mixed cache workload.
const OPS_PER_TASK: usize = 100;

/// How long the backend blocks during a slow refresh.
const REFRESH_DELAY: Duration = Duration::from_millis(800);

fn spn() -> ServicePrincipal {
    ServicePrincipal::parse("HTTP/svc.example.com").unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_refresh_last_writer_wins() {
    let script = Script::new();
    for i in 0..CONCURRENCY {
        script.push_outcome(Ok(Bytes::from(format!("ticket-{i}"))));
    }
    let broker = Arc::new(TicketBroker::new(
        ScriptedFactory::new(script.clone()),
        TokenCache::new(),
        BrokerSettings::default(),
    ));
    let session = Arc::new(Session::new());
    session.select(spn(), None);

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let broker = broker.clone();
        let session = session.clone();
        set.spawn(async move { broker.refresh(&session).await });
    }

    let mut issued = HashSet::new();
    while let Some(result) = set.join_next().await {
        let token = result.expect("task should not panic").expect("refresh should succeed");
        issued.insert(token.encoded.expose().to_string());
    }

    assert_eq!(issued.len(), CONCURRENCY);
    assert_eq!(script.ticket_requests(), CONCURRENCY);
    assert_eq!(script.connects(), CONCURRENCY);
    assert_eq!(script.releases(), CONCURRENCY);

    // The session holds one complete token from some refresh.
    let current = session.token().expect("session should hold a token");
    assert!(issued.contains(current.expose()));
    let cached = broker
        .cache()
        .get_in(Namespace::Token, spn().as_str())
        .expect("cache should hold a token");
    assert!(issued.contains(cached.expose()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_reads_do_not_wait_for_refresh() {
    let script = Script::new();
    script.push_outcome(Ok(Bytes::from_static(b"old")));
    script.push_outcome(Ok(Bytes::from_static(b"new")));
    let broker = Arc::new(TicketBroker::new(
        ScriptedFactory::new(script.clone()),
        TokenCache::new(),
        BrokerSettings::default(),
    ));
    let session = Arc::new(Session::new());
    broker.select(&session, spn(), None).await.unwrap();

    script.set_delay(Some(REFRESH_DELAY));
    let pending = {
        let broker = broker.clone();
        let session = session.clone();
        tokio::spawn(async move { broker.refresh(&session).await })
    };

    // Wait until the backend is inside the slow request.
    tokio::time::timeout(Duration::from_secs(5), async {
        while script.ticket_requests() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("refresh should reach the backend");

    let started = std::time::Instant::now();
    let snapshot = session.snapshot();
    let header = session.authorization_header().expect("old token should be readable");
    assert!(started.elapsed() < REFRESH_DELAY / 4);
    assert!(!pending.is_finished());

    assert_eq!(snapshot.identity, Some(spn()));
    assert_eq!(snapshot.token.expect("old token").encoded.expose(), "b2xk");
    assert_eq!(header.expose(), "Negotiate b2xk");

    let token = pending.await.expect("task should not panic").expect("refresh should succeed");
    assert_eq!(token.encoded.expose(), "bmV3");
    assert_eq!(session.token().unwrap().expose(), "bmV3");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_ticket_requests_share_cache() {
    let script = Script::new();
    script.set_ticket(&b"shared"[..]);
    let broker = Arc::new(TicketBroker::new(
        ScriptedFactory::new(script.clone()),
        TokenCache::new(),
        BrokerSettings::default(),
    ));
    broker.ticket(&spn(), CachePolicy::PreferCached).await.unwrap();

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let broker = broker.clone();
        set.spawn(async move { broker.ticket(&spn(), CachePolicy::PreferCached).await });
    }
    while let Some(result) = set.join_next().await {
        let ticket = result.expect("task should not panic").expect("ticket should succeed");
        assert!(ticket.from_cache);
        assert_eq!(ticket.encoded.expose(), "c2hhcmVk");
    }

    assert_eq!(script.ticket_requests(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_cache_workload() {
    let cache = TokenCache::with_sweep_interval(Duration::from_millis(5));

    let mut set = JoinSet::new();
    for task in 0..CONCURRENCY {
        let cache = cache.clone();
        set.spawn(async move {
            for i in 0..OPS_PER_TASK {
                let key = format!("token:task{task}-{}", i % 10);
                match i % 4 {
                    0 | 1 => cache.set(key, format!("v{i}"), Duration::from_secs(60)),
                    2 => {
                        let _ = cache.get(&key);
                    }
                    _ => {
                        cache.delete(&key);
                    }
                }
            }
            task
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic");
    }

    for key in cache.list_keys() {
        let value = cache.get(&key).expect("listed key should be live");
        assert!(value.expose().starts_with('v'));
    }
    assert!(cache.len() <= CONCURRENCY * 10);
    cache.shutdown();
}
