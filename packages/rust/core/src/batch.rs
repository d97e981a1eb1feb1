//! Batch submission inputs: sources, batch metadata, validation, titles.

use std::fmt;
use std::path::{Path, PathBuf};

use url::Url;
use worldforge_shared::{Result, Visibility, WorldforgeError};

/// Where an item's document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    /// A local file, uploaded before extraction.
    File { path: PathBuf },
    /// A remote document, handed to the extractor as is.
    Url { url: Url },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Url,
}

impl SourceRef {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    pub fn url(url: Url) -> Self {
        Self::Url { url }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::File { .. } => SourceKind::File,
            Self::Url { .. } => SourceKind::Url,
        }
    }

    /// Title used for deduplication and as the rulebook title.
    ///
    /// Files use their stem. URLs use the last non-empty path segment,
    /// percent-decoded and without extension, or the host when the path is empty.
    pub fn derive_title(&self) -> String {
        match self {
            Self::File { path } => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().trim().to_string())
                .filter(|stem| !stem.is_empty())
                .unwrap_or_else(|| path.display().to_string()),
            Self::Url { url } => title_from_url(url),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { path } => write!(f, "{}", path.display()),
            Self::Url { url } => write!(f, "{url}"),
        }
    }
}

fn title_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(|raw| {
            urlencoding::decode(raw)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| raw.to_string())
        });

    let stem = segment.and_then(|name| {
        Path::new(&name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().trim().to_string())
            .filter(|stem| !stem.is_empty())
    });

    stem.or_else(|| url.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Metadata shared by every item of a batch and by the world assembled from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMeta {
    pub game_system: String,
    pub category: String,
    pub world_name: String,
    pub world_description: Option<String>,
    pub genre: String,
    pub visibility: Visibility,
}

/// Reject a submission before anything is queued or persisted.
pub fn validate_batch(items: &[SourceRef], meta: &BatchMeta) -> Result<()> {
    if items.is_empty() {
        return Err(WorldforgeError::validation(
            "a batch needs at least one file or URL",
        ));
    }
    if meta.game_system.trim().is_empty() {
        return Err(WorldforgeError::validation("game system must not be empty"));
    }
    if meta.world_name.trim().is_empty() {
        return Err(WorldforgeError::validation("world name must not be empty"));
    }
    Ok(())
}

/// Processing order: files first, then URLs, each group in submission order.
pub fn processing_order(items: Vec<SourceRef>) -> Vec<SourceRef> {
    let (mut files, urls): (Vec<_>, Vec<_>) = items
        .into_iter()
        .partition(|item| item.kind() == SourceKind::File);
    files.extend(urls);
    files
}

/// Parse newline-separated URL text. Blank lines are skipped.
pub fn parse_url_list(text: &str) -> Result<Vec<Url>> {
    text.lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(line_no, line)| {
            let url = Url::parse(line).map_err(|e| {
                WorldforgeError::validation(format!("line {line_no}: invalid URL '{line}': {e}"))
            })?;
            match url.scheme() {
                "http" | "https" => Ok(url),
                other => Err(WorldforgeError::validation(format!(
                    "line {line_no}: unsupported URL scheme '{other}'"
                ))),
            }
        })
        .collect()
}
