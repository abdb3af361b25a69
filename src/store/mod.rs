//! On-disk project store.
//!
//! Each project is a directory under the store root holding `story.json` and
//! `sourcebook.json`. Every read-modify-write cycle on a project runs under
//! that project's lock, so concurrent streams targeting the same project
//! cannot lose each other's updates.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STORY_FILE: &str = "story.json";
pub const SOURCEBOOK_FILE: &str = "sourcebook.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt project file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid project id: {0:?}")]
    InvalidProjectId(String),

    #[error("project {0} already exists")]
    AlreadyExists(String),

    #[error("background store task failed: {0}")]
    Background(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Chapter {
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Story {
    pub title: String,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

impl Story {
    pub fn chapter_mut(&mut self, index: usize) -> Result<&mut Chapter, StoreError> {
        self.chapters
            .get_mut(index)
            .ok_or_else(|| StoreError::NotFound(format!("chapter {index}")))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SourcebookEntry {
    pub name: String,
    pub description: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Sourcebook {
    #[serde(default)]
    pub entries: Vec<SourcebookEntry>,
}

impl Sourcebook {
    pub fn find(&self, name: &str) -> Option<&SourcebookEntry> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug)]
pub struct ProjectStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write lock for one project. Entries nobody holds are pruned here.
    pub fn lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(project_id.to_string()).or_default())
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn project_dir(&self, project_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !project_id.is_empty()
            && project_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidProjectId(project_id.to_string()));
        }
        Ok(self.root.join(project_id))
    }

    pub fn create_project(&self, project_id: &str, title: &str) -> Result<Story, StoreError> {
        let dir = self.project_dir(project_id)?;
        let lock = self.lock(project_id);
        let _guard = lock.lock();
        let path = dir.join(STORY_FILE);
        if path.exists() {
            return Err(StoreError::AlreadyExists(project_id.to_string()));
        }
        fs::create_dir_all(&dir)?;
        let story = Story {
            title: title.to_string(),
            chapters: Vec::new(),
        };
        write_json(&path, &story)?;
        crate::log_info!("Created project {} at {}", project_id, dir.display());
        Ok(story)
    }

    /// Load the project, creating it only when it does not exist yet.
    /// A corrupt or unreadable project is an error, never overwritten.
    pub fn open_or_create(&self, project_id: &str, title: &str) -> Result<Story, StoreError> {
        match self.load_story(project_id) {
            Err(StoreError::NotFound(_)) => match self.create_project(project_id, title) {
                Err(StoreError::AlreadyExists(_)) => self.load_story(project_id),
                created => created,
            },
            loaded => loaded,
        }
    }

    pub fn load_story(&self, project_id: &str) -> Result<Story, StoreError> {
        let path = self.project_dir(project_id)?.join(STORY_FILE);
        read_json::<Story>(&path)?.ok_or_else(|| StoreError::NotFound(format!("project {project_id}")))
    }

    /// Read-modify-write the story under the project lock.
    pub fn update_story<R>(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut Story) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let path = self.project_dir(project_id)?.join(STORY_FILE);
        let lock = self.lock(project_id);
        let _guard = lock.lock();
        let mut story = read_json::<Story>(&path)?
            .ok_or_else(|| StoreError::NotFound(format!("project {project_id}")))?;
        let result = f(&mut story)?;
        write_json(&path, &story)?;
        Ok(result)
    }

    /// A project without a sourcebook file has an empty sourcebook
    pub fn load_sourcebook(&self, project_id: &str) -> Result<Sourcebook, StoreError> {
        let dir = self.project_dir(project_id)?;
        if !dir.join(STORY_FILE).exists() {
            return Err(StoreError::NotFound(format!("project {project_id}")));
        }
        Ok(read_json::<Sourcebook>(&dir.join(SOURCEBOOK_FILE))?.unwrap_or_default())
    }

    pub fn update_sourcebook<R>(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut Sourcebook) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let dir = self.project_dir(project_id)?;
        let lock = self.lock(project_id);
        let _guard = lock.lock();
        if !dir.join(STORY_FILE).exists() {
            return Err(StoreError::NotFound(format!("project {project_id}")));
        }
        let path = dir.join(SOURCEBOOK_FILE);
        let mut sourcebook = read_json::<Sourcebook>(&path)?.unwrap_or_default();
        let result = f(&mut sourcebook)?;
        write_json(&path, &sourcebook)?;
        Ok(result)
    }

    /// Persist generated prose: append to `chapter`, or to a new chapter when `None`.
    pub fn append_generated(
        &self,
        project_id: &str,
        chapter: Option<usize>,
        text: &str,
    ) -> Result<usize, StoreError> {
        self.update_story(project_id, |story| match chapter {
            Some(index) => {
                story.chapter_mut(index)?.content.push_str(text);
                Ok(index)
            }
            None => {
                let index = story.chapters.len();
                story.chapters.push(Chapter {
                    title: format!("Chapter {}", index + 1),
                    content: text.to_string(),
                });
                Ok(index)
            }
        })
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Write through a temporary file so readers never see a partial document.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let raw = serde_json::to_string_pretty(value).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ProjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_create_and_load_project() {
        let (_dir, store) = store();
        store.create_project("moonlit", "Moonlit").unwrap();
        let story = store.load_story("moonlit").unwrap();
        assert_eq!(story.title, "Moonlit");
        assert!(story.chapters.is_empty());
        assert!(store.load_sourcebook("moonlit").unwrap().entries.is_empty());
    }

    #[test]
    fn test_existing_project_is_not_recreated() {
        let (_dir, store) = store();
        store.create_project("moonlit", "Moonlit").unwrap();
        store.append_generated("moonlit", None, "Kept.").unwrap();
        assert!(matches!(
            store.create_project("moonlit", "Other"),
            Err(StoreError::AlreadyExists(_))
        ));
        let story = store.load_story("moonlit").unwrap();
        assert_eq!(story.title, "Moonlit");
        assert_eq!(story.chapters[0].content, "Kept.");
    }

    #[test]
    fn test_open_or_create_keeps_corrupt_projects() {
        let (dir, store) = store();
        assert_eq!(store.open_or_create("fresh", "Fresh").unwrap().title, "Fresh");
        assert_eq!(store.open_or_create("fresh", "Again").unwrap().title, "Fresh");

        store.create_project("broken", "Broken").unwrap();
        let path = dir.path().join("broken").join(STORY_FILE);
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            store.open_or_create("broken", "Broken"),
            Err(StoreError::Corrupt { .. })
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[test]
    fn test_idle_locks_are_pruned() {
        let (_dir, store) = store();
        for i in 0..50 {
            let id = format!("p{i}");
            store.create_project(&id, "P").unwrap();
            store.append_generated(&id, None, "x").unwrap();
        }
        assert!(store.tracked_locks() <= 1);

        let held = store.lock("busy");
        store.lock("other");
        assert_eq!(store.tracked_locks(), 2);
        drop(held);
        store.lock("third");
        assert_eq!(store.tracked_locks(), 1);
    }

    #[test]
    fn test_missing_and_invalid_projects() {
        let (_dir, store) = store();
        assert!(matches!(store.load_story("ghost"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.load_story("../etc"),
            Err(StoreError::InvalidProjectId(_))
        ));
        assert!(matches!(
            store.load_sourcebook("ghost"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_append_generated_text() {
        let (_dir, store) = store();
        store.create_project("p1", "P").unwrap();
        assert_eq!(store.append_generated("p1", None, "It began.").unwrap(), 0);
        assert_eq!(store.append_generated("p1", Some(0), " Then.").unwrap(), 0);
        let story = store.load_story("p1").unwrap();
        assert_eq!(story.chapters[0].content, "It began. Then.");
        assert_eq!(story.chapters[0].title, "Chapter 1");
        assert!(matches!(
            store.append_generated("p1", Some(4), "x"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let (dir, store) = store();
        store.create_project("p2", "P").unwrap();
        fs::write(dir.path().join("p2").join(STORY_FILE), "{not json").unwrap();
        assert!(matches!(store.load_story("p2"), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_concurrent_appends_are_serialized() {
        let (_dir, store) = store();
        store.create_project("shared", "Shared").unwrap();
        store.append_generated("shared", None, "").unwrap();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        store.append_generated("shared", Some(0), "x").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let story = store.load_story("shared").unwrap();
        assert_eq!(story.chapters[0].content.len(), 160);
    }
}
