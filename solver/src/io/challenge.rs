//! Challenge directories and session result persistence.
//!
//! Layout:
//! ```text
//! <challenge-dir>/challenge.toml      title, category, description
//! <challenge-dir>/<material files>
//! <output_dir>/<challenge>/<session-id>.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::io::config::write_atomic;
use crate::session::Transcript;

pub const CHALLENGE_FILE: &str = "challenge.toml";

/// Listing depth below the challenge root.
const MAX_LISTING_DEPTH: usize = 4;

/// Challenge metadata handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeMeta {
    /// Directory name; used as the output folder.
    pub name: String,
    pub title: String,
    pub category: String,
    pub description: String,
    /// Material files relative to `root`, sorted.
    pub files: Vec<String>,
    /// Canonical challenge directory; tools run inside it.
    pub root: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChallengeFile {
    title: Option<String>,
    category: String,
    description: String,
}

/// Load `challenge.toml` and list the material files of `dir`.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn load_challenge(dir: &Path) -> Result<ChallengeMeta> {
    let root = dir
        .canonicalize()
        .with_context(|| format!("resolve challenge directory {}", dir.display()))?;
    if !root.is_dir() {
        return Err(anyhow!("{} is not a directory", root.display()));
    }
    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("challenge directory has no usable name"))?;

    let meta_path = root.join(CHALLENGE_FILE);
    let raw = fs::read_to_string(&meta_path)
        .with_context(|| format!("read {}", meta_path.display()))?;
    let file: ChallengeFile =
        toml::from_str(&raw).with_context(|| format!("parse {}", meta_path.display()))?;

    let mut files = Vec::new();
    list_files(&root, &root, 0, &mut files)?;
    files.sort();

    Ok(ChallengeMeta {
        title: file.title.unwrap_or_else(|| name.clone()),
        name,
        category: file.category,
        description: file.description.trim().to_string(),
        files,
        root,
    })
}

fn list_files(root: &Path, dir: &Path, depth: usize, out: &mut Vec<String>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("list {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", path.display()))?;
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        if depth == 0 && relative == Path::new(CHALLENGE_FILE) {
            continue;
        }
        if file_type.is_dir() {
            if depth + 1 < MAX_LISTING_DEPTH {
                list_files(root, &path, depth + 1, out)?;
            }
        } else {
            out.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Destination for finished session records.
pub trait ResultSink: Send + Sync {
    fn persist(&self, transcript: &Transcript) -> Result<PathBuf>;
}

/// Writes `<output_dir>/<challenge>/<session-id>.json`.
pub struct DirSink {
    output_dir: PathBuf,
}

impl DirSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn path_for(&self, transcript: &Transcript) -> PathBuf {
        self.output_dir
            .join(&transcript.challenge.name)
            .join(format!("{}.json", transcript.session_id))
    }
}

impl ResultSink for DirSink {
    #[instrument(skip_all, fields(session = %transcript.session_id))]
    fn persist(&self, transcript: &Transcript) -> Result<PathBuf> {
        let path = self.path_for(transcript);
        let mut payload =
            serde_json::to_string_pretty(transcript).context("serialize transcript")?;
        payload.push('\n');
        write_atomic(&path, &payload)?;
        info!(path = %path.display(), state = ?transcript.state, "transcript written");
        Ok(path)
    }
}

/// Read a transcript previously written by [`DirSink`].
pub fn read_transcript(path: &Path) -> Result<Transcript> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse transcript {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_metadata_and_lists_materials() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("warmup");
        fs::create_dir_all(dir.join("nested")).expect("mkdir");
        fs::write(
            dir.join(CHALLENGE_FILE),
            "title = \"Warmup\"\ncategory = \"misc\"\ndescription = \"  Decode it. \"\n",
        )
        .expect("write");
        fs::write(dir.join("b.txt"), "b").expect("write");
        fs::write(dir.join("nested").join("a.bin"), "a").expect("write");

        let meta = load_challenge(&dir).expect("load");
        assert_eq!(meta.name, "warmup");
        assert_eq!(meta.title, "Warmup");
        assert_eq!(meta.category, "misc");
        assert_eq!(meta.description, "Decode it.");
        assert_eq!(meta.files, vec!["b.txt".to_string(), "nested/a.bin".to_string()]);
        assert!(meta.root.is_absolute());
    }

    #[test]
    fn title_defaults_to_directory_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("untitled");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(CHALLENGE_FILE), "").expect("write");
        let meta = load_challenge(&dir).expect("load");
        assert_eq!(meta.title, "untitled");
        assert!(meta.files.is_empty());
    }

    #[test]
    fn missing_challenge_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_challenge(temp.path()).unwrap_err();
        assert!(format!("{err:#}").contains(CHALLENGE_FILE));
    }
}
