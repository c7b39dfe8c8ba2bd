//! Slash-delimited patch paths.
//!
//! A patch path is written `/segment/segment/...`. Inside a segment, `~` is
//! escaped as `~0` and `/` as `~1`, so identity segments such as
//! `did:ng:o:abc|https://example.org/people/1` survive the round trip.
//!
//! [`PatchPath`] holds the decoded segments of a path that has at least one
//! segment; a patch never addresses the root.
//!
//! ```rust
//! # use scopesync::patch::PatchPath;
//! let path = PatchPath::new("people").push("g|https://x.org/p1").push("name");
//! assert_eq!(path.to_string(), "/people/g|https:~1~1x.org~1p1/name");
//!
//! let parsed: PatchPath = "/people/g|https:~1~1x.org~1p1/name".parse()?;
//! assert_eq!(parsed, path);
//! assert_eq!(parsed.key(), "name");
//! # Ok::<(), scopesync::patch::PathError>(())
//! ```

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Error type for path parsing failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    /// The path does not start with the `/` separator.
    #[error("Path '{path}' does not start with '/'")]
    NotAbsolute { path: String },

    /// The path has no segments and would address the root.
    #[error("Path '{path}' addresses the root")]
    Root { path: String },
}

/// Decodes one escaped path segment.
pub fn unescape_segment(segment: &str) -> String {
    if !segment.contains('~') {
        return segment.to_string();
    }
    segment.replace("~1", "/").replace("~0", "~")
}

/// Escapes one path segment.
pub fn escape_segment(segment: &str) -> String {
    if !segment.contains('/') && !segment.contains('~') {
        return segment.to_string();
    }
    segment.replace('~', "~0").replace('/', "~1")
}

/// Encodes decoded segments into the wire form of a path.
pub fn encode_segments<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(&escape_segment(segment.as_ref()));
    }
    out
}

/// An owned, decoded path with at least one segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchPath {
    segments: Vec<String>,
}

impl PatchPath {
    /// Creates a single-segment path.
    pub fn new(segment: impl Into<String>) -> Self {
        Self {
            segments: vec![segment.into()],
        }
    }

    /// Builds a path from already decoded segments. Returns `None` if there are none.
    pub fn from_segments<I, S>(segments: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        (!segments.is_empty()).then_some(Self { segments })
    }

    /// Parses the wire form of a path.
    ///
    /// Empty segments (from doubled or trailing slashes) are ignored.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err(PathError::NotAbsolute {
                path: path.to_string(),
            });
        };
        let segments: Vec<String> = rest
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(unescape_segment)
            .collect();
        if segments.is_empty() {
            return Err(PathError::Root {
                path: path.to_string(),
            });
        }
        Ok(Self { segments })
    }

    /// Appends a segment.
    pub fn push(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        self.clone().push(segment)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// All segments except the last.
    pub fn parent_segments(&self) -> &[String] {
        &self.segments[..self.segments.len() - 1]
    }

    /// The last segment: the property name or identity the path targets.
    pub fn key(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// Number of segments. Never zero, since the root is not addressable.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.segments.len()
    }
}

impl fmt::Display for PatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_segments(&self.segments))
    }
}

impl FromStr for PatchPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PatchPath::parse(s)
    }
}

impl From<PatchPath> for String {
    fn from(path: PatchPath) -> Self {
        path.to_string()
    }
}

impl From<&PatchPath> for String {
    fn from(path: &PatchPath) -> Self {
        path.to_string()
    }
}
