//! Protection policy: the protected root, name patterns and the
//! administrative credential.
//!
//! The configuration file is line oriented:
//!
//! ```text
//! $argon2id$v=19$m=65536,t=3,p=4$...   <- credential hash
//! /srv/data                            <- protected root
//! *.lock                               <- patterns, one per line
//! ```

use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use tracing::{debug, info};

use crate::credential::{rehash_like, validate_hash, verify_credential};
use crate::error::{ConfigError, CredentialError};
use crate::paths::LOG_FILE_NAME;

pub const DEFAULT_MAX_PATTERNS: usize = 100;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
pub struct PolicyStore {
    source: Option<PathBuf>,
    root: PathBuf,
    patterns: Vec<Pattern>,
    credential: String,
    artifact_names: Vec<OsString>,
    artifact_paths: Vec<PathBuf>,
}

/// Split a path into its parent directory and base name.
pub fn split_path(path: &Path) -> Option<(PathBuf, OsString)> {
    let name = path.file_name()?;
    let parent = path.parent()?;
    Some((parent.to_path_buf(), name.to_os_string()))
}

impl PolicyStore {
    /// Load the policy from a configuration file.
    ///
    /// The file itself is registered as a self artifact so that credential
    /// rotation never trips enforcement.
    pub fn load(path: &Path, max_patterns: usize) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::parse(&text, max_patterns)?.with_self_artifact_path(path);
        Ok(Self {
            source: Some(path.to_path_buf()),
            ..store
        })
    }

    /// Parse configuration text. A relative root is resolved against the
    /// current working directory.
    pub fn parse(text: &str, max_patterns: usize) -> Result<Self, ConfigError> {
        let mut lines = text.lines();

        let credential = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or(ConfigError::MissingCredential)?
            .to_string();
        validate_hash(&credential).map_err(ConfigError::InvalidCredential)?;

        let root_line = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or(ConfigError::MissingRoot)?;
        let root = fs::canonicalize(root_line).map_err(|source| ConfigError::PathResolution {
            path: root_line.to_string(),
            source,
        })?;
        if !root.is_dir() {
            return Err(ConfigError::RootNotDirectory(root));
        }
        info!(root = %root.display(), "protected directory set");

        let mut patterns = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if patterns.len() >= max_patterns {
                debug!(pattern = line, limit = max_patterns, "pattern limit reached, ignoring");
                continue;
            }
            let pattern = Pattern::new(line).map_err(|e| ConfigError::InvalidPattern {
                pattern: line.to_string(),
                reason: e.msg.to_string(),
            })?;
            info!(pattern = line, "loaded pattern");
            patterns.push(pattern);
        }

        Ok(Self {
            source: None,
            root,
            patterns,
            credential,
            artifact_names: vec![OsString::from(LOG_FILE_NAME)],
            artifact_paths: Vec::new(),
        })
    }

    /// Exempt a base name everywhere in the tree.
    pub fn with_self_artifact(mut self, name: impl Into<OsString>) -> Self {
        let name = name.into();
        if !self.artifact_names.contains(&name) {
            self.artifact_names.push(name);
        }
        self
    }

    /// Exempt one specific file the service writes, and its staging copies.
    pub fn with_self_artifact_path(mut self, path: &Path) -> Self {
        let path = absolute_artifact(path);
        if !self.artifact_paths.contains(&path) {
            self.artifact_paths.push(path);
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Pattern::as_str)
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Files the service writes itself. Exempt paths also cover the
    /// `.{name}.{suffix}` staging copies written next to them while a
    /// rotated credential is persisted.
    pub fn is_self_artifact(&self, path: &Path) -> bool {
        let Some((dir, name)) = split_path(path) else {
            return false;
        };
        if self.artifact_names.contains(&name) {
            return true;
        }
        self.artifact_paths.iter().any(|artifact| {
            artifact == path
                || (artifact.parent() == Some(dir.as_path())
                    && artifact
                        .file_name()
                        .is_some_and(|a| is_staging_name(&name, a)))
        })
    }

    /// Whether `dir` is the protected root or lies beneath it.
    pub fn contains_dir(&self, dir: &Path) -> bool {
        match fs::canonicalize(dir) {
            Ok(canonical) => canonical.starts_with(&self.root),
            Err(_) => false,
        }
    }

    /// Match a base name against the patterns. Names that are not valid
    /// UTF-8 are matched in their lossy form, so `*.lock` still covers them.
    pub fn name_matches(&self, name: &OsStr) -> bool {
        let lossy = name.to_string_lossy();
        if name.to_str().is_none() {
            debug!(name = %lossy, "matching non UTF-8 name in lossy form");
        }
        self.patterns
            .iter()
            .any(|p| p.matches_with(&lossy, MATCH_OPTIONS))
    }

    /// Whether `path` names a protected file.
    pub fn is_match(&self, path: &Path) -> bool {
        let Some((dir, name)) = split_path(path) else {
            return false;
        };
        if self.is_self_artifact(path) {
            return false;
        }
        if !self.contains_dir(&dir) {
            return false;
        }
        self.name_matches(&name)
    }

    pub fn verify_credential(&self, candidate: &str) -> bool {
        verify_credential(&self.credential, candidate)
    }

    /// Replace the credential after verifying the current one.
    ///
    /// The new hash is written to the configuration file before the
    /// in-memory copy changes, so a failed write leaves the old credential
    /// valid everywhere.
    pub fn rotate_credential(&mut self, current: &str, new: &str) -> Result<(), CredentialError> {
        if !self.verify_credential(current) {
            return Err(CredentialError::Rejected);
        }
        let hash = rehash_like(&self.credential, new)?;
        if let Some(source) = &self.source {
            persist_credential(source, &hash)?;
        }
        self.credential = hash;
        info!("credential rotated");
        Ok(())
    }
}

/// Absolute form of an artifact path. The file may not exist yet, so only
/// its parent is canonicalized.
fn absolute_artifact(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    match split_path(path) {
        Some((dir, name)) => {
            let dir = if dir.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                dir
            };
            fs::canonicalize(&dir).unwrap_or(dir).join(name)
        }
        None => path.to_path_buf(),
    }
}

/// Whether `name` has the `.{artifact}.{suffix}` staging form.
fn is_staging_name(name: &OsStr, artifact: &OsStr) -> bool {
    let (name, artifact) = (name.as_bytes(), artifact.as_bytes());
    name.len() > artifact.len() + 2
        && name[0] == b'.'
        && name[1..].starts_with(artifact)
        && name[artifact.len() + 1] == b'.'
}

fn persist_credential(path: &Path, hash: &str) -> Result<(), ConfigError> {
    let persist_err = |source| ConfigError::Persist {
        path: path.to_path_buf(),
        source,
    };
    let text = fs::read_to_string(path).map_err(persist_err)?;
    let rest = match text.split_once('\n') {
        Some((_, rest)) => rest,
        None => "",
    };

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config".to_string());
    let staging = parent.join(format!(".{}.{:08x}", file_name, rand::random::<u32>()));

    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&staging)?;
        writeln!(file, "{hash}")?;
        file.write_all(rest.as_bytes())?;
        file.sync_all()?;
        if let Ok(meta) = fs::metadata(path) {
            fs::set_permissions(&staging, meta.permissions())?;
        }
        fs::rename(&staging, path)
    };
    write().map_err(|source| {
        let _ = fs::remove_file(&staging);
        persist_err(source)
    })
}
