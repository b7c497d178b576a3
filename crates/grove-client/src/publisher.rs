//! Publishing commits: `push` and `create_branch`.

use crate::builder::{build_tree, validate_changes, Changes};
use crate::config::Identity;
use crate::connection::{cancellable, Connection};
use crate::packager::package_closure;
use crate::transport::Session;
use crate::{Error, Result};
use grove_git::{Command, Filter, PushReport};
use grove_storage::{Commit, ObjectId, ObjectStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Qualifies a bare branch name to `refs/heads/<name>`.
pub(crate) fn qualify(name: &str) -> Result<String> {
    let qualified = if name.starts_with("refs/") {
        name.to_string()
    } else {
        format!("refs/heads/{name}")
    };
    let valid = !name.is_empty()
        && !qualified.ends_with('/')
        && !qualified.ends_with(".lock")
        && !qualified.contains("..")
        && !qualified.contains("@{")
        && qualified
            .split('/')
            .all(|segment| !segment.is_empty() && !segment.starts_with('.'))
        && !qualified.chars().any(|c| {
            c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\')
        });
    if valid {
        Ok(qualified)
    } else {
        Err(Error::InvalidReference(name.to_string()))
    }
}

fn identity(identity: Option<&Identity>) -> Result<&Identity> {
    let identity = identity.ok_or(Error::MissingIdentity)?;
    identity.validate()?;
    Ok(identity)
}

/// Everything a publish operation needs from the client.
pub(crate) struct Publisher<'a> {
    pub(crate) conn: &'a mut Connection,
    pub(crate) store: &'a mut ObjectStore,
    pub(crate) identity: Option<&'a Identity>,
    pub(crate) filter: Option<Filter>,
}

impl Publisher<'_> {
    /// Commits `changes` on top of `reference` and pushes the result.
    pub(crate) async fn push(
        self,
        reference: &str,
        changes: &Changes,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectId> {
        let identity = identity(self.identity)?;
        let name = qualify(reference)?;
        validate_changes(changes)?;

        let mut session = self.conn.open_push_session(cancel).await?;
        let old = session
            .advertisement()
            .find(&name)
            .map(|r| r.id)
            .unwrap_or(ObjectId::ZERO);

        if !old.is_zero() && !self.store.contains(&old) {
            debug!(%old, "fetching base commit before merging");
            self.conn.fetch(self.store, &[old], self.filter, cancel).await?;
        }

        let tree = build_tree(self.store, old, changes)?;
        let signature = identity.signature_now();
        let commit = Commit {
            tree,
            parents: if old.is_zero() { Vec::new() } else { vec![old] },
            author: signature.clone(),
            committer: signature,
            message: message.to_string(),
        };
        let new = self.store.put(commit.to_object());
        let pack = package_closure(self.store, new)?;

        send(session.as_mut(), Command::new(&name, old, new), pack, cancel).await?;
        self.conn.invalidate().await;
        info!(reference = %name, %old, %new, "pushed commit");
        Ok(new)
    }

    /// Creates branch `name` at `source`, or at a new orphan commit when
    /// `source` is empty.
    pub(crate) async fn create_branch(
        self,
        name: &str,
        source: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectId> {
        let target = qualify(name)?;
        let orphan_identity = if source.is_empty() {
            Some(identity(self.identity)?)
        } else {
            None
        };

        let mut session = self.conn.open_push_session(cancel).await?;
        if session.advertisement().find(&target).is_some() {
            return Err(Error::BranchExists(target));
        }

        let id = match orphan_identity {
            Some(identity) => {
                let tree = build_tree(self.store, ObjectId::ZERO, &Changes::new())?;
                let signature = identity.signature_now();
                let commit = Commit {
                    tree,
                    parents: Vec::new(),
                    author: signature.clone(),
                    committer: signature,
                    message: message.to_string(),
                };
                self.store.put(commit.to_object())
            }
            None => {
                let id = resolve_source(session.as_ref(), source)?;
                self.conn.fetch(self.store, &[id], self.filter, cancel).await?;
                id
            }
        };

        let pack = package_closure(self.store, id)?;
        send(
            session.as_mut(),
            Command::new(&target, ObjectId::ZERO, id),
            pack,
            cancel,
        )
        .await?;
        self.conn.invalidate().await;
        info!(reference = %target, %id, orphan = source.is_empty(), "created branch");
        Ok(id)
    }
}

/// Resolves a branch source: a literal hash, an exact ref name, or a branch.
fn resolve_source(session: &dyn Session, source: &str) -> Result<ObjectId> {
    if let Ok(id) = ObjectId::from_hex(source) {
        return Ok(id);
    }
    let advertisement = session.advertisement();
    advertisement
        .find(source)
        .or_else(|| advertisement.find(&format!("refs/heads/{source}")))
        .map(|r| r.id)
        .ok_or_else(|| Error::not_found("ref", source))
}

/// Pushes one command over `session` and checks the report.
async fn send(
    session: &mut dyn Session,
    command: Command,
    pack: Vec<u8>,
    cancel: &CancellationToken,
) -> Result<()> {
    let reference = command.ref_name.clone();
    let report = cancellable(cancel, session.push(&[command], pack)).await?;
    check_report(&report, &reference)?;
    if let Err(e) = session.close().await {
        debug!(error = %e, "closing push session failed");
    }
    Ok(())
}

fn check_report(report: &PushReport, reference: &str) -> Result<()> {
    if !report.unpack_ok() {
        return Err(Error::Rejected {
            reference: reference.to_string(),
            reason: report.unpack.clone(),
        });
    }
    match report.status(reference) {
        Some(status) if status.is_ok() => Ok(()),
        Some(status) => Err(Error::Rejected {
            reference: reference.to_string(),
            reason: status.error.clone().unwrap_or_default(),
        }),
        None => Err(Error::Rejected {
            reference: reference.to_string(),
            reason: "remote reported no status".to_string(),
        }),
    }
}
