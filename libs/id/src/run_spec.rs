//! Run spec identifiers.

use crate::{string_serde, IdError};

/// Absolute, slash-separated path naming a declared workload, e.g. `/prod/web`.
///
/// Segments are lowercase ASCII alphanumerics with interior dashes. Dots and
/// underscores are reserved: derived IDs use them as separators, which keeps
/// the safe form (`prod_web`) reversible.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunSpecId(String);

impl RunSpecId {
    /// Parses a run spec path.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let Some(rest) = s.strip_prefix('/') else {
            return Err(IdError::format(format!("run spec id '{s}' must be absolute")));
        };
        if rest.is_empty() {
            return Err(IdError::format("run spec id cannot be the root path"));
        }
        for segment in rest.split('/') {
            validate_segment(segment)?;
        }
        Ok(Self(s.to_string()))
    }

    /// Rebuilds the path from its safe form (`prod_web` → `/prod/web`).
    pub fn from_safe_path(safe: &str) -> Result<Self, IdError> {
        if safe.is_empty() {
            return Err(IdError::Empty);
        }
        Self::parse(&format!("/{}", safe.replace('_', "/")))
    }

    /// The path with slashes replaced, suitable for embedding in other IDs.
    #[must_use]
    pub fn safe_path(&self) -> String {
        self.0.trim_start_matches('/').replace('/', "_")
    }

    /// Path segments, outermost group first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.trim_start_matches('/').split('/')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Checks one path or container-name segment.
pub(crate) fn validate_segment(segment: &str) -> Result<(), IdError> {
    let invalid = |message: &str| IdError::InvalidSegment {
        segment: segment.to_string(),
        message: message.to_string(),
    };

    if segment.is_empty() {
        return Err(invalid("segment is empty"));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("only [a-z0-9-] allowed"));
    }
    if segment.starts_with('-') || segment.ends_with('-') {
        return Err(invalid("must not start or end with '-'"));
    }
    Ok(())
}

impl std::fmt::Display for RunSpecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RunSpecId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

string_serde!(RunSpecId);
