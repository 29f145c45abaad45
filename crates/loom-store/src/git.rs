//! Git object types and an in-memory repository.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::StoreError;
use crate::store::GitRepo;

/// Hex id of a git object.
pub type ObjectId = String;

/// File mode of a subtree.
pub const MODE_TREE: u32 = 0o040000;
/// File mode of a regular file.
pub const MODE_FILE: u32 = 0o100644;
/// File mode of an executable file.
pub const MODE_EXEC: u32 = 0o100755;
/// File mode of a symlink.
pub const MODE_SYMLINK: u32 = 0o120000;
/// File mode of a submodule link.
pub const MODE_SUBMODULE: u32 = 0o160000;

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub mode: u32,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn is_tree(&self) -> bool {
        self.mode == MODE_TREE
    }
}

/// Author or committer line of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub date: DateTime<Utc>,
}

/// A parsed commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commit {
    pub id: ObjectId,
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

impl Commit {
    /// Whether author and committer differ and both should be shown.
    pub fn separate_author(&self) -> bool {
        self.author.name != self.committer.name || self.author.email != self.committer.email
    }
}

#[derive(Debug, Clone)]
enum Object {
    Blob(Vec<u8>),
    Tree(Vec<TreeEntry>),
    Commit(Commit),
}

/// In-memory git repository with content-derived object ids.
pub struct MemoryGitRepo {
    id: String,
    objects: DashMap<ObjectId, Object>,
    refs: DashMap<String, ObjectId>,
}

fn object_id(kind: &str, parts: impl Hash) -> ObjectId {
    let mut hasher = DefaultHasher::new();
    kind.hash(&mut hasher);
    parts.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

impl MemoryGitRepo {
    /// Create an empty repository announced by message `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            objects: DashMap::new(),
            refs: DashMap::new(),
        }
    }

    /// Store a blob and return its id.
    pub fn put_blob(&self, data: impl Into<Vec<u8>>) -> ObjectId {
        let data = data.into();
        let id = object_id("blob", &data);
        self.objects.insert(id.clone(), Object::Blob(data));
        id
    }

    /// Store a tree and return its id. Entries are kept sorted by name.
    pub fn put_tree(&self, mut entries: Vec<TreeEntry>) -> ObjectId {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let id = object_id("tree", &entries);
        self.objects.insert(id.clone(), Object::Tree(entries));
        id
    }

    /// Build nested trees from `(path, contents)` pairs and return the root id.
    pub fn put_files<P, C>(&self, files: impl IntoIterator<Item = (P, C)>) -> ObjectId
    where
        P: AsRef<str>,
        C: Into<Vec<u8>>,
    {
        let mut root = DirNode::default();
        for (path, contents) in files {
            let segments: Vec<&str> = path.as_ref().split('/').filter(|s| !s.is_empty()).collect();
            root.insert(&segments, self.put_blob(contents));
        }
        root.store(self)
    }

    /// Store a commit and return its id.
    pub fn put_commit(
        &self,
        tree: ObjectId,
        parents: Vec<ObjectId>,
        author: Signature,
        message: &str,
    ) -> ObjectId {
        let (title, body) = match message.split_once('\n') {
            Some((title, body)) => (title.to_string(), body.trim_start_matches('\n').to_string()),
            None => (message.to_string(), String::new()),
        };
        let id = object_id("commit", (&tree, &parents, &author, message));
        let commit = Commit {
            id: id.clone(),
            tree,
            parents,
            committer: author.clone(),
            author,
            title,
            body,
        };
        self.objects.insert(id.clone(), Object::Commit(commit));
        id
    }

    /// Point a ref (`heads/master`, `tags/v1`) at an object.
    pub fn set_ref(&self, name: impl Into<String>, id: ObjectId) {
        let name = name.into();
        trace!(repo = %self.id, name = %name, id = %id, "git: ref updated");
        self.refs.insert(name, id);
    }

    fn object(&self, id: &str) -> Result<Object, StoreError> {
        self.objects
            .get(id)
            .map(|o| o.value().clone())
            .ok_or_else(|| StoreError::not_found(id))
    }
}

#[derive(Default)]
struct DirNode {
    files: BTreeMap<String, ObjectId>,
    dirs: BTreeMap<String, DirNode>,
}

impl DirNode {
    fn insert(&mut self, segments: &[&str], blob: ObjectId) {
        match segments {
            [] => {}
            [name] => {
                self.files.insert(name.to_string(), blob);
            }
            [dir, rest @ ..] => self.dirs.entry(dir.to_string()).or_default().insert(rest, blob),
        }
    }

    fn store(self, repo: &MemoryGitRepo) -> ObjectId {
        let mut entries: Vec<TreeEntry> = self
            .files
            .into_iter()
            .map(|(name, id)| TreeEntry {
                name,
                mode: MODE_FILE,
                id,
            })
            .collect();
        for (name, dir) in self.dirs {
            entries.push(TreeEntry {
                name,
                mode: MODE_TREE,
                id: dir.store(repo),
            });
        }
        repo.put_tree(entries)
    }
}

#[async_trait]
impl GitRepo for MemoryGitRepo {
    fn id(&self) -> &str {
        &self.id
    }

    async fn resolve_ref(&self, rev: &str) -> Result<ObjectId, StoreError> {
        for candidate in [
            rev.to_string(),
            format!("heads/{}", rev),
            format!("tags/{}", rev),
        ] {
            if let Some(id) = self.refs.get(&candidate) {
                return Ok(id.value().clone());
            }
        }
        if self.objects.contains_key(rev) {
            return Ok(rev.to_string());
        }
        Err(StoreError::not_found(rev))
    }

    async fn ref_names(&self) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for r in self.refs.iter() {
            if let Some((kind, name)) = r.key().split_once('/') {
                groups.entry(kind.to_string()).or_default().push(name.to_string());
            }
        }
        for names in groups.values_mut() {
            names.sort();
        }
        Ok(groups)
    }

    async fn get_commit(&self, rev: &str) -> Result<Commit, StoreError> {
        let id = self.resolve_ref(rev).await?;
        match self.object(&id)? {
            Object::Commit(commit) => Ok(commit),
            _ => Err(StoreError::Malformed(format!("{} is not a commit", id))),
        }
    }

    async fn read_tree(&self, tree_id: &str) -> Result<Vec<TreeEntry>, StoreError> {
        match self.object(tree_id)? {
            Object::Tree(entries) => Ok(entries),
            _ => Err(StoreError::Malformed(format!("{} is not a tree", tree_id))),
        }
    }

    async fn read_blob(&self, blob_id: &str) -> Result<Vec<u8>, StoreError> {
        match self.object(blob_id)? {
            Object::Blob(data) => Ok(data),
            _ => Err(StoreError::Malformed(format!("{} is not a blob", blob_id))),
        }
    }

    async fn has_object(&self, id: &str) -> bool {
        self.objects.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    fn sig() -> Signature {
        Signature {
            name: "alice".to_string(),
            email: "alice@example.com".to_string(),
            date: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_ids_are_content_derived() {
        let repo = MemoryGitRepo::new("%repo");
        let a = repo.put_files([("src/main.rs", "fn main() {}")]);
        let b = repo.put_files([("src/main.rs", "fn main() {}")]);
        let c = repo.put_files([("src/main.rs", "fn main() { todo!() }")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_nested_trees() {
        let repo = MemoryGitRepo::new("%repo");
        let tree = repo.put_files([("README.md", "hi"), ("src/lib.rs", ""), ("src/a/b.rs", "")]);
        let root = repo.read_tree(&tree).await.unwrap();
        let names: Vec<_> = root.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["README.md", "src"]);
        assert!(root[1].is_tree());

        let commit = repo.put_commit(tree, vec![], sig(), "init");
        repo.set_ref("heads/master", commit);
        let src = repo.read_dir("master", &["src".to_string()]).await.unwrap();
        assert_eq!(src.len(), 2);
    }

    #[tokio::test]
    async fn test_read_log_follows_first_parent() {
        let repo = MemoryGitRepo::new("%repo");
        let t1 = repo.put_files([("a", "1")]);
        let t2 = repo.put_files([("a", "2")]);
        let c1 = repo.put_commit(t1, vec![], sig(), "first");
        let c2 = repo.put_commit(t2, vec![c1.clone()], sig(), "second\n\nbody text");
        repo.set_ref("heads/master", c2.clone());

        let log: Vec<_> = repo.read_log("master").try_collect().await.unwrap();
        assert_eq!(log, vec![c2.clone(), c1]);

        let commit = repo.get_commit(&c2).await.unwrap();
        assert_eq!(commit.title, "second");
        assert_eq!(commit.body, "body text");
    }

    #[tokio::test]
    async fn test_unknown_rev() {
        let repo = MemoryGitRepo::new("%repo");
        assert!(matches!(
            repo.get_commit("nope").await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
