//! Directory-backed code store.
//!
//! Layout:
//!
//! ```text
//! <root>/<namespace>/<id>/code   source text
//! <root>/<namespace>/<id>/hash   digest of the source text
//! ```
//!
//! Writes go to a temp file first. A create hard-links the temp file into
//! place, which fails when the target already exists; a replace renames the
//! temp file over the target. Both are atomic at the filesystem level, so
//! separate processes can share one root.
//!
//! A create that loses half way undoes only its own link. A concurrent
//! replace may have renamed a new file over that link, and the replace has
//! already been acknowledged, so it must survive the rollback.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use uuid::Uuid;

use crate::error::StoreError;
use crate::function::{validate_key, Function, FunctionPage, FunctionSummary};
use crate::traits::{CodeStore, PostOutcome};

const CODE_FILE: &str = "code";
const HASH_FILE: &str = "hash";

pub struct LocalDiskCodeStore {
    root: PathBuf,
}

impl LocalDiskCodeStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|error| StoreError::RootPathInvalid {
                path: root.clone(),
                error,
            })?;

        let attr = fs::metadata(&root)
            .await
            .map_err(|error| StoreError::RootPathInvalid {
                path: root.clone(),
                error,
            })?;
        if !attr.is_dir() {
            return Err(StoreError::RootPathInvalid {
                path: root,
                error: io::Error::other("Root path must be a directory."),
            });
        }
        if attr.permissions().readonly() {
            return Err(StoreError::RootPathInvalid {
                path: root,
                error: io::Error::other("Root directory must be writable"),
            });
        }

        match fs::canonicalize(&root).await {
            Ok(root) => Ok(Self { root }),
            Err(error) => Err(StoreError::RootPathInvalid { path: root, error }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn function_dir(&self, namespace: &str, id: &str) -> Result<PathBuf, StoreError> {
        validate_key(namespace)?;
        validate_key(id)?;
        Ok(self.root.join(namespace).join(id))
    }

    async fn write_temp(dir: &Path, contents: &str) -> Result<PathBuf, StoreError> {
        let temp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        fs::write(&temp, contents)
            .await
            .map_err(|e| StoreError::io(&temp, e))?;
        Ok(temp)
    }

    /// Link `contents` into `target` unless it exists.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(id))` - The link was made; `id` identifies the linked file.
    /// * `Ok(None)` - `target` already existed.
    async fn set_if_absent(
        dir: &Path,
        target: &Path,
        contents: &str,
    ) -> Result<Option<FileId>, StoreError> {
        let temp = Self::write_temp(dir, contents).await?;
        let linked = match fs::metadata(&temp).await {
            Ok(attr) => fs::hard_link(&temp, target)
                .await
                .map(|()| FileId::of(&attr)),
            Err(e) => Err(e),
        };
        remove_ignoring_missing(&temp).await?;

        match linked {
            Ok(id) => Ok(Some(id)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(StoreError::io(target, e)),
        }
    }

    /// Remove `target` if it is still the file we linked as `ours`.
    ///
    /// The target is first renamed aside, which takes it out of everyone's
    /// reach atomically. A file that turns out to belong to someone else is
    /// linked back, unless a newer write has taken its place meanwhile.
    async fn unlink_own(dir: &Path, target: &Path, ours: FileId) -> Result<(), StoreError> {
        let aside = dir.join(format!(".undo-{}", Uuid::new_v4()));
        match fs::rename(target, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(target, e)),
        }

        let attr = fs::metadata(&aside)
            .await
            .map_err(|e| StoreError::io(&aside, e))?;
        if FileId::of(&attr) != ours {
            tracing::debug!(path = %target.display(), "create rollback kept a replaced file");
            match fs::hard_link(&aside, target).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    remove_ignoring_missing(&aside).await?;
                    return Err(StoreError::io(target, e));
                }
            }
        }
        remove_ignoring_missing(&aside).await
    }

    async fn replace(dir: &Path, target: &Path, contents: &str) -> Result<(), StoreError> {
        let temp = Self::write_temp(dir, contents).await?;
        if let Err(e) = fs::rename(&temp, target).await {
            remove_ignoring_missing(&temp).await?;
            return Err(StoreError::io(target, e));
        }
        Ok(())
    }

    async fn sorted_entries(dir: &Path) -> Result<Vec<String>, StoreError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(dir, e))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

/// Identity of a file on disk, stable across renames and hard links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn of(attr: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        FileId {
            dev: attr.dev(),
            ino: attr.ino(),
        }
    }

    // Without inode numbers, size and modification time stand in.
    #[cfg(not(unix))]
    fn of(attr: &std::fs::Metadata) -> Self {
        let modified = attr
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        FileId {
            dev: attr.len(),
            ino: modified,
        }
    }
}

async fn remove_ignoring_missing(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

#[async_trait]
impl CodeStore for LocalDiskCodeStore {
    async fn list_functions(
        &self,
        page: usize,
        per_page: usize,
    ) -> Result<FunctionPage, StoreError> {
        let mut all = Vec::new();
        for namespace in Self::sorted_entries(&self.root).await? {
            let namespace_dir = self.root.join(&namespace);
            for id in Self::sorted_entries(&namespace_dir).await? {
                if fs::try_exists(namespace_dir.join(&id).join(CODE_FILE))
                    .await
                    .unwrap_or(false)
                {
                    all.push(FunctionSummary {
                        namespace: namespace.clone(),
                        id,
                    });
                }
            }
        }
        Ok(FunctionPage::paginate(all, page, per_page))
    }

    async fn post_code(
        &self,
        namespace: &str,
        id: &str,
        function: &Function,
    ) -> Result<PostOutcome, StoreError> {
        let dir = self.function_dir(namespace, id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let code_path = dir.join(CODE_FILE);
        let hash_path = dir.join(HASH_FILE);

        // The code link decides the race: only its winner goes on to set the
        // hash, so concurrent creators never undo each other.
        let code_link = Self::set_if_absent(&dir, &code_path, &function.code).await?;
        let hash_created = match code_link {
            Some(_) => Self::set_if_absent(&dir, &hash_path, &function.hash)
                .await?
                .is_some(),
            None => !fs::try_exists(&hash_path).await.unwrap_or(true),
        };
        let outcome = PostOutcome {
            code_created: code_link.is_some(),
            hash_created,
        };

        // The hash key was already taken, by a stale entry or a concurrent
        // put: take back our code link so a conflict writes nothing.
        if let (Some(ours), false) = (code_link, hash_created) {
            Self::unlink_own(&dir, &code_path, ours).await?;
        }

        tracing::debug!(
            namespace,
            id,
            created = outcome.is_created(),
            "post code"
        );
        Ok(outcome)
    }

    async fn put_code(
        &self,
        namespace: &str,
        id: &str,
        function: &Function,
    ) -> Result<(), StoreError> {
        let dir = self.function_dir(namespace, id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        Self::replace(&dir, &dir.join(CODE_FILE), &function.code).await?;
        Self::replace(&dir, &dir.join(HASH_FILE), &function.hash).await?;
        tracing::debug!(namespace, id, hash = %function.hash, "put code");
        Ok(())
    }

    async fn get_code(&self, namespace: &str, id: &str) -> Result<Option<Function>, StoreError> {
        let code_path = self.function_dir(namespace, id)?.join(CODE_FILE);
        match fs::read_to_string(&code_path).await {
            // The hash is recomputed from what was read, so a reader that
            // lands between the two renames of a put still sees a matching pair.
            Ok(code) => Ok(Some(Function::new(id, code))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(code_path, e)),
        }
    }

    async fn delete_code(&self, namespace: &str, id: &str) -> Result<(), StoreError> {
        let dir = self.function_dir(namespace, id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(dir, e)),
        }
    }
}
