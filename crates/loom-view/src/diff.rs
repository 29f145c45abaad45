//! File-level diffs between two trees.
//!
//! The two sides may come from different repositories, which is how a pull
//! request from a fork is compared with its target.

use std::collections::BTreeMap;

use futures_util::StreamExt;
use futures_util::stream;
use loom_store::git::{MODE_SUBMODULE, MODE_TREE};
use loom_store::{GitRepo, ObjectId, TreeEntry};
use similar::{ChangeTag, TextDiff};
use tracing::{debug, trace};

use crate::{DIFF_FETCH_CONCURRENCY, ViewError};

/// Lines of unchanged context around each hunk.
const CONTEXT_LINES: usize = 3;

/// Extensions shown as images instead of being diffed.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpeg", "jpg", "gif", "tif", "svg", "bmp"];

/// One changed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: Vec<String>,
    pub id_before: Option<ObjectId>,
    pub id_after: Option<ObjectId>,
    pub mode_before: Option<u32>,
    pub mode_after: Option<u32>,
}

/// How a path changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    /// Same content, different file mode.
    ModeChanged { before: u32, after: u32 },
    Changed,
}

impl DiffEntry {
    pub fn kind(&self) -> ChangeKind {
        match (&self.id_before, &self.id_after) {
            (None, _) => ChangeKind::Added,
            (_, None) => ChangeKind::Deleted,
            (Some(before), Some(after)) => match (self.mode_before, self.mode_after) {
                (Some(m0), Some(m1)) if m0 != m1 && before == after => ChangeKind::ModeChanged {
                    before: m0,
                    after: m1,
                },
                _ => ChangeKind::Changed,
            },
        }
    }

    pub fn filename(&self) -> String {
        self.path.join("/")
    }

    /// Lowercased extension of the last path segment.
    pub fn extension(&self) -> Option<String> {
        let name = self.path.last()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    pub fn is_image(&self) -> bool {
        self.extension()
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
    }

    pub fn is_submodule(&self) -> bool {
        self.mode_after == Some(MODE_SUBMODULE)
    }

    /// Which side to link to when viewing the file: the new side unless
    /// the file was deleted.
    pub fn view_side(&self) -> Side {
        if self.id_after.is_some() {
            Side::After
        } else {
            Side::Before
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Before,
    After,
}

/// A pair of repositories and revisions being compared.
#[derive(Clone, Copy)]
pub struct DiffSides<'a> {
    pub before: &'a dyn GitRepo,
    pub after: &'a dyn GitRepo,
}

impl<'a> DiffSides<'a> {
    /// Both sides in the same repository.
    pub fn same(repo: &'a dyn GitRepo) -> Self {
        Self {
            before: repo,
            after: repo,
        }
    }

    /// Diff the trees of two revisions. A missing `before` revision
    /// compares against the empty tree, as for a root commit.
    pub async fn diff(&self, before: Option<&str>, after: &str) -> Result<Vec<DiffEntry>, ViewError> {
        let tree_before = match before {
            Some(rev) => Some(self.before.get_commit(rev).await?.tree),
            None => None,
        };
        let tree_after = self.after.get_commit(after).await?.tree;
        self.diff_trees(tree_before, Some(tree_after)).await
    }

    /// Diff two trees recursively. Entries come back sorted by path.
    pub async fn diff_trees(
        &self,
        before: Option<ObjectId>,
        after: Option<ObjectId>,
    ) -> Result<Vec<DiffEntry>, ViewError> {
        let mut entries = Vec::new();
        let mut pending = vec![(Vec::<String>::new(), before, after)];

        while let Some((path, before, after)) = pending.pop() {
            if before.is_some() && before == after {
                continue;
            }
            let left = read_tree(self.before, before.as_deref()).await?;
            let right = read_tree(self.after, after.as_deref()).await?;

            let mut names: BTreeMap<&str, (Option<&TreeEntry>, Option<&TreeEntry>)> = BTreeMap::new();
            for entry in &left {
                names.entry(entry.name.as_str()).or_default().0 = Some(entry);
            }
            for entry in &right {
                names.entry(entry.name.as_str()).or_default().1 = Some(entry);
            }

            for (name, (l, r)) in names {
                if let (Some(l), Some(r)) = (l, r)
                    && l.id == r.id
                    && l.mode == r.mode
                {
                    continue;
                }
                let mut child = path.clone();
                child.push(name.to_string());

                let (tree_l, tree_r) = (subtree_id(l), subtree_id(r));
                if tree_l.is_some() || tree_r.is_some() {
                    pending.push((child.clone(), tree_l, tree_r));
                }

                let (file_l, file_r) = (file_entry(l), file_entry(r));
                if file_l.is_some() || file_r.is_some() {
                    entries.push(DiffEntry {
                        path: child,
                        id_before: file_l.map(|e| e.id.clone()),
                        id_after: file_r.map(|e| e.id.clone()),
                        mode_before: file_l.map(|e| e.mode),
                        mode_after: file_r.map(|e| e.mode),
                    });
                }
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(files = entries.len(), "diff: trees compared");
        Ok(entries)
    }

    /// Full text of both sides of `entry`. A missing side is empty and a
    /// submodule reads as the commit it points at.
    pub async fn full_text_for(&self, entry: &DiffEntry) -> Result<(String, String), ViewError> {
        let before = object_text(self.before, entry.id_before.as_deref(), entry.mode_before);
        let after = object_text(self.after, entry.id_after.as_deref(), entry.mode_after);
        tokio::try_join!(before, after)
    }

    /// Line diffs for every entry, fetched with bounded concurrency.
    /// A failure to load one file is reported on that file only.
    pub async fn file_diffs(&self, entries: Vec<DiffEntry>) -> Vec<FileDiff> {
        stream::iter(entries)
            .map(|entry| async move {
                let content = self.content(&entry).await;
                FileDiff { entry, content }
            })
            .buffered(DIFF_FETCH_CONCURRENCY)
            .collect()
            .await
    }

    async fn content(&self, entry: &DiffEntry) -> Result<FileContent, ViewError> {
        if entry.is_image() {
            return Ok(FileContent::Image);
        }
        if entry.id_before.is_some() && entry.id_before == entry.id_after {
            return Ok(FileContent::Unchanged);
        }
        let (before, after) = self.full_text_for(entry).await?;
        trace!(path = %entry.filename(), "diff: fetched both sides");
        Ok(FileContent::Lines(line_diff(&before, &after)))
    }
}

fn subtree_id(entry: Option<&TreeEntry>) -> Option<ObjectId> {
    entry.filter(|e| e.mode == MODE_TREE).map(|e| e.id.clone())
}

fn file_entry(entry: Option<&TreeEntry>) -> Option<&TreeEntry> {
    entry.filter(|e| e.mode != MODE_TREE)
}

async fn read_tree(repo: &dyn GitRepo, id: Option<&str>) -> Result<Vec<TreeEntry>, ViewError> {
    match id {
        Some(id) => Ok(repo.read_tree(id).await?),
        None => Ok(Vec::new()),
    }
}

async fn object_text(repo: &dyn GitRepo, id: Option<&str>, mode: Option<u32>) -> Result<String, ViewError> {
    let Some(id) = id else {
        return Ok(String::new());
    };
    if mode == Some(MODE_SUBMODULE) {
        return Ok(format!("Subproject commit {}", id));
    }
    let data = repo.read_blob(id).await?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// A changed file with its rendered content.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDiff {
    pub entry: DiffEntry,
    pub content: Result<FileContent, ViewError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileContent {
    /// Not diffed; link to the raw file instead.
    Image,
    /// Only the mode changed.
    Unchanged,
    Lines(Vec<Hunk>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    Added,
    Removed,
    Context,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLine {
    pub tag: LineTag,
    /// 1-based line number on the old side.
    pub old_line: Option<usize>,
    /// 1-based line number on the new side.
    pub new_line: Option<usize>,
    pub text: String,
}

impl DiffLine {
    /// Anchor id for this line within `filename`.
    pub fn anchor(&self, filename: &str) -> String {
        let num = |n: Option<usize>| n.map(|n| n.to_string()).unwrap_or_default();
        format!("{}-{}-{}", filename, num(self.old_line), num(self.new_line))
    }
}

/// A run of changes with surrounding context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    pub fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_lines, self.new_start, self.new_lines
        )
    }
}

/// Line diff of two texts, grouped into hunks.
pub fn line_diff(before: &str, after: &str) -> Vec<Hunk> {
    let diff = TextDiff::from_lines(before, after);
    diff.grouped_ops(CONTEXT_LINES)
        .iter()
        .filter_map(|group| {
            let first = group.first()?;
            let last = group.last()?;
            let old_range = first.old_range().start..last.old_range().end;
            let new_range = first.new_range().start..last.new_range().end;

            let lines = group
                .iter()
                .flat_map(|op| diff.iter_changes(op))
                .map(|change| DiffLine {
                    tag: match change.tag() {
                        ChangeTag::Insert => LineTag::Added,
                        ChangeTag::Delete => LineTag::Removed,
                        ChangeTag::Equal => LineTag::Context,
                    },
                    old_line: change.old_index().map(|i| i + 1),
                    new_line: change.new_index().map(|i| i + 1),
                    text: change.value().trim_end_matches(['\n', '\r']).to_string(),
                })
                .collect();

            Some(Hunk {
                old_start: old_range.start + 1,
                old_lines: old_range.len(),
                new_start: new_range.start + 1,
                new_lines: new_range.len(),
                lines,
            })
        })
        .collect()
}
