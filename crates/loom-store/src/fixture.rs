//! JSON fixtures for populating a [`MemoryStore`].
//!
//! A fixture lists messages in receive order, inline blobs and git
//! repositories as a linear history of full file snapshots:
//!
//! ```json
//! {
//!   "whoami": "@me",
//!   "messages": [{ "key": "%repo", "author": "@me", "timestamp": 1, "content": { "type": "git-repo" } }],
//!   "blobs": { "&avatar": "..." },
//!   "repos": [{ "id": "%repo", "branch": "master", "commits": [
//!     { "message": "init", "author": "me", "timestamp": 1, "files": { "README.md": "hello" } }
//!   ] }]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::DateTime;
use serde::Deserialize;
use tracing::info;

use crate::StoreError;
use crate::git::{MemoryGitRepo, Signature};
use crate::memory::MemoryStore;
use crate::types::{FeedId, NewMessage};

#[derive(Debug, Deserialize)]
pub struct Fixture {
    pub whoami: FeedId,
    #[serde(default)]
    pub messages: Vec<NewMessage>,
    #[serde(default)]
    pub blobs: BTreeMap<String, String>,
    #[serde(default)]
    pub repos: Vec<RepoFixture>,
}

#[derive(Debug, Deserialize)]
pub struct RepoFixture {
    pub id: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub commits: Vec<CommitFixture>,
}

#[derive(Debug, Deserialize)]
pub struct CommitFixture {
    pub message: String,
    pub author: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Seconds since the epoch.
    pub timestamp: i64,
    /// Complete file contents at this commit.
    pub files: BTreeMap<String, String>,
}

fn default_branch() -> String {
    "master".to_string()
}

impl Fixture {
    /// Read and parse a fixture file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Build a store holding everything in this fixture.
    pub fn into_store(self) -> Result<Arc<MemoryStore>, StoreError> {
        let store = MemoryStore::new(self.whoami);
        let message_count = self.messages.len();
        for message in self.messages {
            store.append(message);
        }
        for (id, data) in self.blobs {
            store.add_blob(id, data);
        }
        for repo in self.repos {
            store.add_repo(build_repo(repo)?);
        }
        info!(
            messages = message_count,
            repos = store.repo_count(),
            "loaded fixture into memory store"
        );
        Ok(store)
    }
}

fn build_repo(fixture: RepoFixture) -> Result<MemoryGitRepo, StoreError> {
    let repo = MemoryGitRepo::new(fixture.id);
    let mut head: Option<String> = None;
    for commit in fixture.commits {
        let date = DateTime::from_timestamp(commit.timestamp, 0).ok_or_else(|| {
            StoreError::Malformed(format!("commit timestamp {} out of range", commit.timestamp))
        })?;
        let email = commit
            .email
            .unwrap_or_else(|| format!("{}@localhost", commit.author));
        let tree = repo.put_files(commit.files);
        let id = repo.put_commit(
            tree,
            head.take().into_iter().collect(),
            Signature {
                name: commit.author,
                email,
                date,
            },
            &commit.message,
        );
        head = Some(id);
    }
    if let Some(head) = head {
        repo.set_ref(format!("heads/{}", fixture.branch), head);
    }
    Ok(repo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GitRepo, LogStore};
    use std::io::Write;

    const FIXTURE: &str = r#"{
        "whoami": "@me",
        "messages": [
            { "key": "%repo", "author": "@me", "timestamp": 1000, "content": { "type": "git-repo" } },
            { "author": "@me", "timestamp": 2000, "content": { "type": "about", "about": "@me", "name": "me" } }
        ],
        "blobs": { "&pic": "png" },
        "repos": [{ "id": "%repo", "commits": [
            { "message": "init", "author": "me", "timestamp": 1, "files": { "README.md": "hello" } },
            { "message": "more", "author": "me", "timestamp": 2, "files": { "README.md": "hello\nworld" } }
        ] }]
    }"#;

    #[tokio::test]
    async fn test_fixture_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FIXTURE.as_bytes()).unwrap();

        let store = Fixture::from_path(file.path()).unwrap().into_store().unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("%repo").await.unwrap().value.sequence, 1);

        let repo = store.repo("%repo").unwrap();
        let head = repo.get_commit("master").await.unwrap();
        assert_eq!(head.title, "more");
        assert_eq!(head.parents.len(), 1);
    }

    #[test]
    fn test_malformed_fixture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(
            Fixture::from_path(file.path()),
            Err(StoreError::Json(_))
        ));
    }
}
