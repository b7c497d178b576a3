//! Change polling: watch refs and report when they move.

use crate::client::Client;
use crate::{Error, Result};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use grove_storage::Ref;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A ref observed at a new value by [`watch_many`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Endpoint of the client that saw the change.
    pub endpoint: String,
    /// The watched reference, as given.
    pub reference: String,
    /// New hex id; empty when the ref no longer exists.
    pub id: String,
}

/// A tick stream that yields every `period`, starting one period from now.
pub fn interval_ticks(period: Duration) -> BoxStream<'static, ()> {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    stream::unfold(interval, |mut interval| async move {
        interval.tick().await;
        Some(((), interval))
    })
    .boxed()
}

/// Finds `reference` by exact name, then as a branch name.
fn lookup(refs: &[Ref], reference: &str) -> String {
    let branch = format!("refs/heads/{reference}");
    refs.iter()
        .find(|r| r.name == reference)
        .or_else(|| refs.iter().find(|r| r.name == branch))
        .map(|r| r.id.to_hex())
        .unwrap_or_default()
}

/// Watches one ref.
///
/// `callback` receives the current hex id (empty when the ref is absent)
/// once at start, then after every tick on which it changed. Returns `Ok`
/// when `ticks` ends and [`Error::Cancelled`] when `cancel` fires.
pub async fn watch<S, F>(
    client: &mut Client,
    reference: &str,
    mut ticks: S,
    cancel: &CancellationToken,
    mut callback: F,
) -> Result<()>
where
    S: Stream<Item = ()> + Unpin,
    F: FnMut(&str),
{
    let refs = client.list_refs(cancel).await?;
    let mut current = lookup(&refs, reference);
    callback(current.as_str());
    client.invalidate_connection().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            tick = ticks.next() => {
                if tick.is_none() {
                    debug!(reference, "tick stream ended");
                    return Ok(());
                }
            }
        }

        client.invalidate_connection().await;
        match client.list_refs(cancel).await {
            Ok(refs) => {
                let value = lookup(&refs, reference);
                if value != current {
                    debug!(reference, from = %current, to = %value, "ref moved");
                    current = value;
                    callback(current.as_str());
                }
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!(reference, error = %e, "polling refs failed"),
        }
    }
}

/// Watches several refs, each through its own client, and delivers every
/// change to one callback.
///
/// `make_ticks` is called once per target. Returns once every watcher has
/// stopped; the first watcher error, if any, is returned.
pub async fn watch_many<M, S, F>(
    targets: Vec<(Client, String)>,
    mut make_ticks: M,
    cancel: &CancellationToken,
    mut callback: F,
) -> Result<()>
where
    M: FnMut() -> S,
    S: Stream<Item = ()> + Unpin + Send + 'static,
    F: FnMut(Change),
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watchers = JoinSet::new();

    for (mut client, reference) in targets {
        let tx = tx.clone();
        let ticks = make_ticks();
        let cancel = cancel.clone();
        watchers.spawn(async move {
            let endpoint = client.config().endpoint.clone();
            let result = watch(&mut client, &reference, ticks, &cancel, |id| {
                // The receiver outlives every watcher unless the caller is gone.
                let _ = tx.send(Change {
                    endpoint: endpoint.clone(),
                    reference: reference.clone(),
                    id: id.to_string(),
                });
            })
            .await;
            if let Err(e) = &result {
                if !matches!(e, Error::Cancelled) {
                    warn!(%endpoint, %reference, error = %e, "watcher stopped");
                }
            }
            result
        });
    }
    drop(tx);

    while let Some(change) = rx.recv().await {
        callback(change);
    }

    let mut outcome = Ok(());
    while let Some(joined) = watchers.join_next().await {
        let result = joined.map_err(Error::from).and_then(|r| r);
        if outcome.is_ok() {
            outcome = result;
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_storage::ObjectId;

    #[test]
    fn test_lookup() {
        let id = ObjectId::from_bytes([1; 20]);
        let refs = vec![Ref::new("HEAD", id), Ref::new("refs/heads/main", id)];
        assert_eq!(lookup(&refs, "main"), id.to_hex());
        assert_eq!(lookup(&refs, "refs/heads/main"), id.to_hex());
        assert_eq!(lookup(&refs, "HEAD"), id.to_hex());
        assert_eq!(lookup(&refs, "missing"), "");
    }

    #[tokio::test]
    async fn test_interval_ticks_wait_one_period_first() {
        let period = Duration::from_millis(20);
        let mut ticks = interval_ticks(period);
        let start = Instant::now();
        ticks.next().await;
        assert!(start.elapsed() >= period);
        ticks.next().await;
        assert!(start.elapsed() >= period * 2);
    }
}
