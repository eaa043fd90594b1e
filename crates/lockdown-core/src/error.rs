//! Error types for the lockdown policy and attribute layers.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration is missing the credential line")]
    MissingCredential,

    #[error("stored credential is not a valid hash: {0}")]
    InvalidCredential(String),

    #[error("configuration is missing the protected root line")]
    MissingRoot,

    #[error("cannot resolve protected root '{path}': {source}")]
    PathResolution {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protected root {0} is not a directory")]
    RootNotDirectory(PathBuf),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("cannot write configuration {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum AttrError {
    #[error("open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read attribute flags of {path}: {source}")]
    GetFlags {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("write attribute flags of {path}: {source}")]
    SetFlags {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("change permissions of {path}: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("credential rejected")]
    Rejected,

    #[error("new credential must not be empty")]
    Empty,

    #[error("credential hashing failed: {0}")]
    Hash(String),

    #[error(transparent)]
    Persist(#[from] ConfigError),
}
