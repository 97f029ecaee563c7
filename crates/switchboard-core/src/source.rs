//! Source URL validation and resolution.
//!
//! A source is identified by its URL string. Network schemes pass through to
//! the encoder untouched; `file://` sources are resolved against the
//! recordings root so a relay can replay an earlier capture, with path
//! traversal rejected outright.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("unsupported source url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("file source escapes the recordings directory: {0}")]
    Traversal(String),
    #[error("file source not found: {0}")]
    NotFound(String),
    #[error("invalid name {0:?}: must not contain '/', '\\' or \"..\"")]
    InvalidName(String),
}

/// A validated source, ready to hand to an encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    /// Network pull — the encoder dials the URL itself.
    Network(String),
    /// Local file under the recordings root.
    File(PathBuf),
}

impl ResolvedSource {
    /// The string to place in the encoder's `-i` argument.
    pub fn input_arg(&self) -> String {
        match self {
            ResolvedSource::Network(url) => url.clone(),
            ResolvedSource::File(path) => path.display().to_string(),
        }
    }
}

/// Validate `source_url` and resolve it for encoder consumption.
///
/// `file://` bodies are relative paths under `recordings_dir`; absolute
/// paths and `..` components are traversal and rejected. The file must
/// exist at resolution time.
pub fn resolve(source_url: &str, recordings_dir: &Path) -> Result<ResolvedSource, SourceError> {
    if let Some(rel) = source_url.strip_prefix("file://") {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute()
            || rel_path
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(SourceError::Traversal(source_url.to_string()));
        }
        let full = recordings_dir.join(rel_path);
        if !full.is_file() {
            return Err(SourceError::NotFound(source_url.to_string()));
        }
        return Ok(ResolvedSource::File(full));
    }

    for scheme in ["rtsp://", "rtmp://", "http://", "https://"] {
        if source_url.starts_with(scheme) && source_url.len() > scheme.len() {
            return Ok(ResolvedSource::Network(source_url.to_string()));
        }
    }
    Err(SourceError::UnsupportedScheme(source_url.to_string()))
}

/// Validate a name used as a path component (input names, recording names).
pub fn validate_name(name: &str) -> Result<(), SourceError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
    {
        return Err(SourceError::InvalidName(name.to_string()));
    }
    Ok(())
}
