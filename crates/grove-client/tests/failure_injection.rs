//! Session failures: retry-once, cancellation and poller resilience.

mod common;

use common::{identity, seeded_remote, FlakyTransport, StalledTransport};
use grove_client::{watch, Client, ClientConfig, Error, ErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn flaky_client(transport: FlakyTransport) -> Client {
    let config = ClientConfig::new("memory://flaky").with_identity(identity());
    Client::with_transport(config, Arc::new(transport)).unwrap()
}

#[tokio::test]
async fn test_failed_open_is_retried_once() {
    let (repo, seed) = seeded_remote("flaky-open");
    let transport = FlakyTransport::new(repo);
    let opens = Arc::clone(&transport.opens);
    transport.failing_opens.store(1, Ordering::SeqCst);
    let mut client = flaky_client(transport);

    let refs = client.list_refs(&CancellationToken::new()).await.unwrap();
    assert_eq!(refs[0].id, seed.commit);
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_second_failure_surfaces() {
    let (repo, _) = seeded_remote("flaky-twice");
    let transport = FlakyTransport::new(repo);
    let opens = Arc::clone(&transport.opens);
    transport.failing_opens.store(2, Ordering::SeqCst);
    let mut client = flaky_client(transport);

    let err = client.list_refs(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let (repo, _) = seeded_remote("flaky-missing");
    let transport = FlakyTransport::new(repo);
    let opens = Arc::clone(&transport.opens);
    let mut client = flaky_client(transport);

    let absent = grove_client::ObjectId::from_bytes([0x42; 20]).to_hex();
    let err = client
        .get_object(&absent, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_broken_cached_session_is_replaced() {
    let (repo, seed) = seeded_remote("flaky-fetch");
    let transport = FlakyTransport::new(repo);
    let opens = Arc::clone(&transport.opens);
    let failing_fetches = Arc::clone(&transport.failing_fetches);
    let mut client = flaky_client(transport);
    let cancel = CancellationToken::new();

    client.list_refs(&cancel).await.unwrap();
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    failing_fetches.store(1, Ordering::SeqCst);
    let tree = client.get_tree(&seed.commit.to_hex(), &cancel).await.unwrap();
    assert_eq!(tree.id(), seed.tree);
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancellation_is_not_retried() {
    let opens = Arc::new(AtomicUsize::new(0));
    let transport = StalledTransport {
        opens: Arc::clone(&opens),
    };
    let mut client =
        Client::with_transport(ClientConfig::new("memory://stalled"), Arc::new(transport)).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), client.list_refs(&cancel))
        .await
        .expect("cancellation returns promptly");
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_poller_keeps_last_value_when_listing_fails() {
    let (repo, seed) = seeded_remote("flaky-poll");
    let transport = FlakyTransport::new(repo);
    let failing_opens = Arc::clone(&transport.failing_opens);
    let mut client = flaky_client(transport);

    let (ticks, stream) = futures::channel::mpsc::unbounded::<()>();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);

    // Initial listing succeeds, then both attempts of the first re-list fail.
    let driver = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        watch(&mut client, "main", stream, &cancel, |id| {
            recorded.lock().unwrap().push(id.to_string());
        })
        .await
    });

    while seen.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    failing_opens.store(2, Ordering::SeqCst);
    ticks.unbounded_send(()).unwrap();
    ticks.unbounded_send(()).unwrap();
    drop(ticks);

    driver.await.unwrap().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![seed.commit.to_hex()]);
    assert_eq!(failing_opens.load(Ordering::SeqCst), 0);
}
