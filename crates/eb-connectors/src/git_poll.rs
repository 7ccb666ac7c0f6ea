//! Git polling source. Polls a local repository's branch tip at a fixed
//! interval using `git2` (synchronous, so each poll runs on the blocking
//! pool) and emits one message per commit newly reachable since the last
//! observed tip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eb_core::{Message, MessageStream, Operator, ReplyData, Result, Source, SourceAdapter};
use git2::{Oid, Repository};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use validator::Validate;

fn default_branch() -> String {
    "main".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GitPollConfig {
    #[validate(length(min = 1))]
    pub repo_path: String,
    #[serde(default = "default_branch")]
    #[validate(length(min = 1))]
    pub branch: String,
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,
}

/// Git commits carry no application ack, nak, or reply.
struct GitPollAdapter;

#[async_trait]
impl SourceAdapter for GitPollAdapter {
    async fn fetch_metadata(&self, _id: &[u8]) -> anyhow::Result<HashMap<String, String>> {
        Err(anyhow::anyhow!("git commit messages carry metadata eagerly"))
    }
    async fn fetch_payload(&self, _id: &[u8]) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("git commit messages carry payload eagerly"))
    }
    async fn ack(&self, _id: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn nak(&self, _id: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn reply(&self, _id: &[u8], _reply: ReplyData) -> anyhow::Result<bool> {
        Ok(false)
    }
}

struct DiscoveredCommit {
    id: Oid,
    author_name: String,
    author_email: String,
    timestamp: i64,
    message: String,
}

/// Opens the repository, resolves `branch`'s tip, and walks commits
/// reachable from the tip but not from `since` (exclusive). Blocking:
/// must run via `spawn_blocking`.
fn poll_once(repo_path: &str, branch: &str, since: Option<Oid>) -> anyhow::Result<(Oid, Vec<DiscoveredCommit>)> {
    let repo = Repository::open(repo_path)?;
    let reference = repo.find_branch(branch, git2::BranchType::Local)?;
    let tip = reference
        .get()
        .target()
        .ok_or_else(|| anyhow::anyhow!("branch '{branch}' has no target commit"))?;

    if Some(tip) == since {
        return Ok((tip, Vec::new()));
    }

    let mut revwalk = repo.revwalk()?;
    revwalk.push(tip)?;
    if let Some(since) = since {
        revwalk.hide(since)?;
    } else {
        // First poll: only report the current tip, not the whole history.
        let mut commits = Vec::new();
        let commit = repo.find_commit(tip)?;
        commits.push(to_discovered(&commit));
        return Ok((tip, commits));
    }

    let mut commits = Vec::new();
    for oid in revwalk {
        let oid = oid?;
        let commit = repo.find_commit(oid)?;
        commits.push(to_discovered(&commit));
    }
    commits.reverse();
    Ok((tip, commits))
}

fn to_discovered(commit: &git2::Commit) -> DiscoveredCommit {
    let author = commit.author();
    DiscoveredCommit {
        id: commit.id(),
        author_name: author.name().unwrap_or_default().to_string(),
        author_email: author.email().unwrap_or_default().to_string(),
        timestamp: commit.time().seconds(),
        message: commit.message().unwrap_or_default().to_string(),
    }
}

pub struct GitPollSource {
    config: GitPollConfig,
    cancel: Option<CancellationToken>,
}

impl GitPollSource {
    fn new(config: GitPollConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }
}

impl Operator for GitPollSource {
    fn name(&self) -> &str {
        "git_poll"
    }
}

#[async_trait]
impl Source for GitPollSource {
    async fn produce(&mut self, buffer: usize) -> Result<MessageStream> {
        let adapter: Arc<dyn SourceAdapter> = Arc::new(GitPollAdapter);
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let repo_path = self.config.repo_path.clone();
        let branch = self.config.branch.clone();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        tokio::spawn(async move {
            let mut since: Option<Oid> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                if cancel.is_cancelled() {
                    break;
                }

                let repo_path = repo_path.clone();
                let branch = branch.clone();
                let result = tokio::task::spawn_blocking(move || poll_once(&repo_path, &branch, since)).await;
                let (new_tip, commits) = match result {
                    Ok(Ok(v)) => v,
                    Ok(Err(err)) => {
                        warn!(error = %err, "git poll error");
                        continue;
                    }
                    Err(err) => {
                        warn!(error = %err, "git poll task panicked");
                        continue;
                    }
                };
                since = Some(new_tip);

                for commit in commits {
                    let mut metadata = HashMap::new();
                    metadata.insert("commit_id".to_string(), commit.id.to_string());
                    metadata.insert("author_name".to_string(), commit.author_name);
                    metadata.insert("author_email".to_string(), commit.author_email);
                    metadata.insert("timestamp".to_string(), commit.timestamp.to_string());
                    let id = commit.id.to_string().into_bytes();
                    let msg = Message::with_source_data(id, adapter.clone(), metadata, commit.message.into_bytes());
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        Ok(())
    }
}

pub fn build_source(options: Value) -> anyhow::Result<Box<dyn Source>> {
    let config: GitPollConfig = crate::parse_options("git_poll", options)?;
    Ok(Box::new(GitPollSource::new(config)))
}
