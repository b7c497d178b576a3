//! Grove client.
//!
//! Reads, writes and watches trees in a remote git repository without a
//! working copy. A [`Client`] is bound to one endpoint; it materializes the
//! tree of any commit, reads single objects, commits change sets on top of a
//! branch with a compare-and-swap ref update, and creates branches. The
//! [`poller`] module watches refs for changes.
//!
//! ```no_run
//! use grove_client::{Changes, Client, ClientConfig, Identity, PathChange};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> grove_client::Result<()> {
//! let config = ClientConfig::new("https://example.com/org/repo.git")
//!     .with_identity(Identity::new("Grove Bot", "bot@example.com")?);
//! let mut client = Client::new(config)?;
//! let cancel = CancellationToken::new();
//!
//! let mut changes = Changes::new();
//! changes.insert("docs/README.md".into(), PathChange::Write("hello\n".into()));
//! let commit = client.push("main", &changes, "Update readme", &cancel).await?;
//! let tree = client.get_tree(&commit.to_hex(), &cancel).await?;
//! println!("{:?}", tree.paths());
//! # Ok(())
//! # }
//! ```

mod builder;
mod client;
mod config;
mod connection;
mod endpoint;
mod error;
mod packager;
pub mod poller;
mod publisher;
pub mod transport;
mod tree;

pub use builder::{build_tree, Changes, PathChange};
pub use client::Client;
pub use config::{ClientConfig, Identity};
pub use endpoint::Endpoint;
pub use error::{Error, ErrorKind, Result};
pub use packager::package_closure;
pub use poller::{interval_ticks, watch, watch_many, Change};
pub use tree::TreeNode;

pub use grove_storage::{ObjectId, ObjectStore, Ref};
