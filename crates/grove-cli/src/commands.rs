//! CLI command implementations.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use grove_client::{interval_ticks, Changes, Client, Error, PathChange, Ref};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn print_refs(out: &mut impl Write, refs: &[Ref]) -> Result<()> {
    for r in refs {
        writeln!(out, "{} {}", r.id, r.name)?;
    }
    Ok(())
}

/// List every ref, HEAD first.
pub async fn refs(client: &mut Client, cancel: &CancellationToken, out: &mut impl Write) -> Result<()> {
    let refs = client.list_refs(cancel).await?;
    print_refs(out, &refs)
}

/// List branches.
pub async fn branches(
    client: &mut Client,
    cancel: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let refs = client.list_branches(cancel).await?;
    print_refs(out, &refs)
}

/// List tags.
pub async fn tags(client: &mut Client, cancel: &CancellationToken, out: &mut impl Write) -> Result<()> {
    let refs = client.list_tags(cancel).await?;
    print_refs(out, &refs)
}

/// Print every file of a commit's tree as `<id>\t<path>`.
pub async fn tree(
    client: &mut Client,
    commit: &str,
    cancel: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let tree = client.get_tree(commit, cancel).await?;
    for (path, id) in tree.files() {
        writeln!(out, "{id}\t{path}")?;
    }
    Ok(())
}

/// Write an object's raw content.
pub async fn cat(
    client: &mut Client,
    hash: &str,
    cancel: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let content = client.get_object(hash, cancel).await?;
    out.write_all(&content)?;
    out.flush()?;
    Ok(())
}

pub async fn log_message(
    client: &mut Client,
    commit: &str,
    cancel: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let message = client.get_commit_message(commit, cancel).await?;
    write!(out, "{message}")?;
    if !message.ends_with('\n') {
        writeln!(out)?;
    }
    Ok(())
}

/// Splits a `--write` argument into the repository path and the local file.
pub fn parse_write(arg: &str) -> Result<(String, PathBuf)> {
    match arg.split_once('=') {
        Some((path, file)) if !path.is_empty() && !file.is_empty() => {
            Ok((path.to_string(), PathBuf::from(file)))
        }
        _ => bail!("expected PATH=FILE, got {arg:?}"),
    }
}

/// Collects `--write` and `--delete` arguments into a change set.
pub async fn collect_changes(writes: &[String], deletes: &[String]) -> Result<Changes> {
    let mut changes = Changes::new();
    for arg in writes {
        let (path, file) = parse_write(arg)?;
        let content = tokio::fs::read(&file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        if changes.insert(path.clone(), PathChange::Write(Bytes::from(content))).is_some() {
            bail!("{path} is given more than once");
        }
    }
    for path in deletes {
        if changes.insert(path.clone(), PathChange::Delete).is_some() {
            bail!("{path} is given more than once");
        }
    }
    Ok(changes)
}

pub async fn push(
    client: &mut Client,
    reference: &str,
    changes: &Changes,
    message: &str,
    cancel: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    tracing::info!(reference, changes = changes.len(), "pushing");
    let commit = client.push(reference, changes, message, cancel).await?;
    writeln!(out, "{commit}")?;
    Ok(())
}

pub async fn branch(
    client: &mut Client,
    name: &str,
    from: Option<&str>,
    message: &str,
    cancel: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let source = from.unwrap_or_default();
    tracing::info!(name, source, "creating branch");
    let commit = client.create_branch(name, source, message, cancel).await?;
    writeln!(out, "{commit}")?;
    Ok(())
}

/// Print the ref's value now and every time it changes, until cancelled.
pub async fn watch(
    client: &mut Client,
    reference: &str,
    interval: Duration,
    cancel: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    if interval.is_zero() {
        bail!("interval must be positive");
    }
    let mut failed = None;
    let result = grove_client::watch(client, reference, interval_ticks(interval), cancel, |id| {
        let line = if id.is_empty() { "(absent)" } else { id };
        if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            if failed.is_none() {
                failed = Some(e);
            }
            cancel.cancel();
        }
    })
    .await;

    if let Some(e) = failed {
        return Err(anyhow!(e).context("writing output"));
    }
    match result {
        Ok(()) | Err(Error::Cancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
