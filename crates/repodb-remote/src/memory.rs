use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use repodb_types::ObjectId;
use serde::Serialize;

use crate::error::{RemoteError, RemoteResult};
use crate::object::{Commit, DirEntry, EntryKind, EntryMode, Tree, TreeEntry, TreeUpdate};
use crate::traits::RemoteStore;

/// Branch created by [`InMemoryRemote::new`].
pub const DEFAULT_BRANCH: &str = "main";

/// A commit that moved a branch, as recorded by [`InMemoryRemote`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggedCommit {
    pub id: ObjectId,
    pub branch: String,
    pub message: String,
    /// Paths layered onto the parent tree by this commit.
    pub paths: Vec<String>,
}

enum Object {
    Blob(Vec<u8>),
    Tree(Tree),
    Commit(Commit),
}

#[derive(Serialize)]
struct CommitHeader<'a> {
    tree: &'a ObjectId,
    parents: &'a [ObjectId],
    message: &'a str,
    seq: u64,
}

#[derive(Default)]
struct State {
    objects: HashMap<ObjectId, Object>,
    branches: HashMap<String, ObjectId>,
    tree_paths: HashMap<ObjectId, Vec<String>>,
    commit_paths: HashMap<ObjectId, Vec<String>>,
    log: Vec<LoggedCommit>,
    commit_seq: u64,
    fail_remaining: u32,
    race_pending: bool,
}

impl State {
    fn take_failure(&mut self, op: &str) -> RemoteResult<()> {
        if self.fail_remaining > 0 {
            self.fail_remaining -= 1;
            return Err(RemoteError::TransientNetwork(format!("injected failure in {op}")));
        }
        Ok(())
    }

    fn put_blob(&mut self, content: &[u8]) -> ObjectId {
        let id = ObjectId::hash_object("blob", content);
        self.objects
            .entry(id.clone())
            .or_insert_with(|| Object::Blob(content.to_vec()));
        id
    }

    fn put_tree(&mut self, tree: Tree) -> RemoteResult<ObjectId> {
        let id = tree.compute_id()?;
        self.objects.entry(id.clone()).or_insert(Object::Tree(tree));
        Ok(id)
    }

    fn put_commit(&mut self, message: &str, tree: &ObjectId, parents: &[ObjectId]) -> RemoteResult<ObjectId> {
        self.commit_seq += 1;
        let header = CommitHeader {
            tree,
            parents,
            message,
            seq: self.commit_seq,
        };
        let bytes = serde_json::to_vec(&header).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let id = ObjectId::hash_object("commit", &bytes);
        let commit = Commit {
            id: id.clone(),
            tree: tree.clone(),
            parents: parents.to_vec(),
            message: message.to_string(),
        };
        self.objects.insert(id.clone(), Object::Commit(commit));
        Ok(id)
    }

    fn tree(&self, id: &ObjectId) -> RemoteResult<&Tree> {
        match self.objects.get(id) {
            Some(Object::Tree(tree)) => Ok(tree),
            Some(_) => Err(RemoteError::Malformed(format!("{id} is not a tree"))),
            None => Err(RemoteError::NotFound(format!("tree {id}"))),
        }
    }

    fn commit(&self, id: &ObjectId) -> RemoteResult<&Commit> {
        match self.objects.get(id) {
            Some(Object::Commit(commit)) => Ok(commit),
            Some(_) => Err(RemoteError::Malformed(format!("{id} is not a commit"))),
            None => Err(RemoteError::NotFound(format!("commit {id}"))),
        }
    }

    fn head(&self, branch: &str) -> RemoteResult<ObjectId> {
        self.branches
            .get(branch)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("branch {branch}")))
    }

    fn head_tree(&self, branch: &str) -> RemoteResult<ObjectId> {
        let head = self.head(branch)?;
        Ok(self.commit(&head)?.tree.clone())
    }

    fn insert_path(
        &mut self,
        base: Option<&ObjectId>,
        segments: &[&str],
        mode: EntryMode,
        blob: &ObjectId,
    ) -> RemoteResult<ObjectId> {
        let mut tree = match base {
            Some(id) => self.tree(id)?.clone(),
            None => Tree::empty(),
        };
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| RemoteError::Malformed("empty tree path".into()))?;
        if rest.is_empty() {
            tree.upsert(TreeEntry::new(mode, *first, blob.clone()));
        } else {
            let child = tree
                .get(first)
                .filter(|e| e.mode == EntryMode::Directory)
                .map(|e| e.object_id.clone());
            let subtree = self.insert_path(child.as_ref(), rest, mode, blob)?;
            tree.upsert(TreeEntry::new(EntryMode::Directory, *first, subtree));
        }
        self.put_tree(tree)
    }

    fn resolve(&self, root: &ObjectId, path: &str) -> Option<(EntryMode, ObjectId)> {
        let mut current = (EntryMode::Directory, root.clone());
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if current.0 != EntryMode::Directory {
                return None;
            }
            let entry = self.tree(&current.1).ok()?.get(segment)?;
            current = (entry.mode, entry.object_id.clone());
        }
        Some(current)
    }

    fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> bool {
        let mut queue = VecDeque::from([descendant.clone()]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if &id == ancestor {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Ok(commit) = self.commit(&id) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        false
    }

    fn advance(&mut self, branch: &str, commit: &ObjectId) {
        let message = self
            .commit(commit)
            .map(|c| c.message.clone())
            .unwrap_or_default();
        let paths = self.commit_paths.get(commit).cloned().unwrap_or_default();
        self.branches.insert(branch.to_string(), commit.clone());
        self.log.push(LoggedCommit {
            id: commit.clone(),
            branch: branch.to_string(),
            message,
            paths,
        });
    }

    fn external_commit(&mut self, branch: &str, path: &str, content: &[u8]) -> RemoteResult<ObjectId> {
        let head = self.head(branch)?;
        let base = self.commit(&head)?.tree.clone();
        let blob = self.put_blob(content);
        let segments = split_path(path)?;
        let tree = self.insert_path(Some(&base), &segments, EntryMode::Regular, &blob)?;
        let commit = self.put_commit(&format!("External write: {path}"), &tree, &[head])?;
        self.commit_paths.insert(commit.clone(), vec![path.to_string()]);
        self.advance(branch, &commit);
        Ok(commit)
    }
}

fn split_path(path: &str) -> RemoteResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() || segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(RemoteError::Malformed(format!("invalid tree path {path:?}")));
    }
    Ok(segments)
}

fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// In-memory remote with a content-addressed object graph.
///
/// Intended for tests and embedding. It keeps a log of every commit that
/// moved a branch, and can inject transient failures or a concurrent
/// writer racing the next ref update.
pub struct InMemoryRemote {
    state: Mutex<State>,
}

impl InMemoryRemote {
    /// Create a remote with a `main` branch pointing at an empty root commit.
    ///
    /// The root commit is not part of the commit log.
    pub fn new() -> Self {
        Self::with_branch(DEFAULT_BRANCH)
    }

    /// Create a remote whose only branch is `branch`.
    pub fn with_branch(branch: &str) -> Self {
        let mut state = State::default();
        let root = state
            .put_tree(Tree::empty())
            .and_then(|tree| state.put_commit("Initial commit", &tree, &[]));
        if let Ok(root) = root {
            state.branches.insert(branch.to_string(), root);
        }
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` remote calls fail with a transient network error.
    pub fn fail_next(&self, n: u32) {
        self.state().fail_remaining = n;
    }

    /// Have another writer commit to the branch just before the next
    /// `update_branch`, so that update is rejected as a conflict.
    pub fn race_next_update(&self) {
        self.state().race_pending = true;
    }

    /// Commit `content` at `path` directly, as an out-of-band writer would.
    pub fn write_external(&self, branch: &str, path: &str, content: &[u8]) -> RemoteResult<ObjectId> {
        self.state().external_commit(branch, path, content)
    }

    /// Current bytes at `path` on `branch`, if it is a file.
    pub fn file(&self, branch: &str, path: &str) -> Option<Vec<u8>> {
        let state = self.state();
        let root = state.head_tree(branch).ok()?;
        match state.resolve(&root, path)? {
            (EntryMode::Directory, _) => None,
            (_, id) => match state.objects.get(&id) {
                Some(Object::Blob(bytes)) => Some(bytes.clone()),
                _ => None,
            },
        }
    }

    /// Current JSON document at `path` on `branch`.
    pub fn json(&self, branch: &str, path: &str) -> Option<serde_json::Value> {
        self.file(branch, path)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    /// Every commit that moved a branch, oldest first.
    pub fn commit_log(&self) -> Vec<LoggedCommit> {
        self.state().log.clone()
    }

    /// Number of commits that moved a branch.
    pub fn commit_count(&self) -> usize {
        self.state().log.len()
    }

    /// Number of logged commits that wrote `path`.
    pub fn commits_touching(&self, path: &str) -> usize {
        self.state()
            .log
            .iter()
            .filter(|c| c.paths.iter().any(|p| p == path))
            .count()
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn branch_head(&self, branch: &str) -> RemoteResult<ObjectId> {
        let mut state = self.state();
        state.take_failure("branch_head")?;
        state.head(branch)
    }

    async fn commit(&self, id: &ObjectId) -> RemoteResult<Commit> {
        let mut state = self.state();
        state.take_failure("commit")?;
        state.commit(id).cloned()
    }

    async fn create_blob(&self, content: &[u8]) -> RemoteResult<ObjectId> {
        let mut state = self.state();
        state.take_failure("create_blob")?;
        Ok(state.put_blob(content))
    }

    async fn create_tree(&self, base: &ObjectId, updates: &[TreeUpdate]) -> RemoteResult<ObjectId> {
        let mut state = self.state();
        state.take_failure("create_tree")?;
        state.tree(base)?;
        let mut current = base.clone();
        for update in updates {
            if !state.objects.contains_key(&update.blob) {
                return Err(RemoteError::NotFound(format!("blob {}", update.blob)));
            }
            let segments = split_path(&update.path)?;
            current = state.insert_path(Some(&current), &segments, update.mode, &update.blob)?;
        }
        let paths = updates.iter().map(|u| u.path.clone()).collect();
        state.tree_paths.insert(current.clone(), paths);
        Ok(current)
    }

    async fn create_commit(
        &self,
        message: &str,
        tree: &ObjectId,
        parents: &[ObjectId],
    ) -> RemoteResult<ObjectId> {
        let mut state = self.state();
        state.take_failure("create_commit")?;
        state.tree(tree)?;
        for parent in parents {
            state.commit(parent)?;
        }
        let id = state.put_commit(message, tree, parents)?;
        let paths = state.tree_paths.get(tree).cloned().unwrap_or_default();
        state.commit_paths.insert(id.clone(), paths);
        Ok(id)
    }

    async fn update_branch(&self, branch: &str, commit: &ObjectId) -> RemoteResult<()> {
        let mut state = self.state();
        state.take_failure("update_branch")?;
        if state.race_pending {
            state.race_pending = false;
            let seq = state.commit_seq;
            state.external_commit(branch, &format!(".race/{seq}"), b"concurrent writer")?;
        }
        state.commit(commit)?;
        let head = state.head(branch)?;
        if !state.is_ancestor(&head, commit) {
            return Err(RemoteError::Conflict {
                branch: branch.to_string(),
                reason: format!("{} is not a fast-forward of {}", commit.short_hex(), head.short_hex()),
            });
        }
        state.advance(branch, commit);
        Ok(())
    }

    async fn read_file(&self, branch: &str, path: &str) -> RemoteResult<Vec<u8>> {
        let mut state = self.state();
        state.take_failure("read_file")?;
        let root = state.head_tree(branch)?;
        match state.resolve(&root, path) {
            None => Err(RemoteError::NotFound(path.to_string())),
            Some((EntryMode::Directory, _)) => {
                Err(RemoteError::Malformed(format!("{path} is a directory")))
            }
            Some((_, id)) => match state.objects.get(&id) {
                Some(Object::Blob(bytes)) => Ok(bytes.clone()),
                _ => Err(RemoteError::Malformed(format!("{path} does not point at a blob"))),
            },
        }
    }

    async fn list_dir(&self, branch: &str, path: &str) -> RemoteResult<Vec<DirEntry>> {
        let mut state = self.state();
        state.take_failure("list_dir")?;
        let root = state.head_tree(branch)?;
        let tree_id = match state.resolve(&root, path) {
            None => return Err(RemoteError::NotFound(path.to_string())),
            Some((EntryMode::Directory, id)) => id,
            Some(_) => return Err(RemoteError::Malformed(format!("{path} is not a directory"))),
        };
        let tree = state.tree(&tree_id)?;
        Ok(tree
            .entries
            .iter()
            .map(|e| DirEntry {
                name: e.name.clone(),
                path: join_path(path, &e.name),
                kind: if e.mode == EntryMode::Directory {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
            })
            .collect())
    }
}
