use std::cmp::Ordering;
use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactVersion(String);

impl ArtifactVersion {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("artifact version must not be empty"));
        }
        if trimmed.len() > 128 {
            return Err(anyhow!("artifact version is too long: {trimmed}"));
        }
        if trimmed == "." || trimmed == ".." || trimmed.contains("..") {
            return Err(anyhow!("artifact version must not contain '..': {trimmed}"));
        }
        if trimmed
            .chars()
            .any(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | '+')))
        {
            return Err(anyhow!(
                "artifact version contains invalid character(s): {trimmed}"
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        if let (Ok(left), Ok(right)) = (
            semver::Version::parse(&self.0),
            semver::Version::parse(&other.0),
        ) {
            return left.cmp(&right);
        }
        natural_cmp(&self.0, &other.0)
    }

    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Greater
    }
}

impl TryFrom<String> for ArtifactVersion {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ArtifactVersion> for String {
    fn from(value: ArtifactVersion) -> Self {
        value.0
    }
}

impl fmt::Display for ArtifactVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactIdentity {
    pub version: ArtifactVersion,
    pub sha256: String,
}

impl ArtifactIdentity {
    pub fn new(version: ArtifactVersion, sha256: impl Into<String>) -> Self {
        Self {
            version,
            sha256: sha256.into(),
        }
    }

    pub fn tag(&self) -> String {
        let prefix: String = self.sha256.chars().take(12).collect();
        format!("{}+{}", self.version, prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRequirement {
    Latest,
    Exact(ArtifactVersion),
}

impl VersionRequirement {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        Ok(Self::Exact(ArtifactVersion::new(trimmed)?))
    }

    pub fn is_satisfied_by(&self, version: &ArtifactVersion) -> bool {
        match self {
            Self::Latest => true,
            Self::Exact(required) => required == version,
        }
    }
}

impl fmt::Display for VersionRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(version) => write!(f, "{version}"),
        }
    }
}

fn natural_cmp(left: &str, right: &str) -> Ordering {
    let left_parts = split_runs(left);
    let right_parts = split_runs(right);

    for (l, r) in left_parts.iter().zip(right_parts.iter()) {
        let ordering = match (l, r) {
            (Run::Digits(l), Run::Digits(r)) => compare_digit_runs(l, r),
            (Run::Text(l), Run::Text(r)) => l.to_ascii_lowercase().cmp(&r.to_ascii_lowercase()),
            (Run::Digits(_), Run::Text(_)) => Ordering::Less,
            (Run::Text(_), Run::Digits(_)) => Ordering::Greater,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    left_parts
        .len()
        .cmp(&right_parts.len())
        .then_with(|| left.cmp(right))
}

fn compare_digit_runs(left: &str, right: &str) -> Ordering {
    let left = left.trim_start_matches('0');
    let right = right.trim_start_matches('0');
    left.len().cmp(&right.len()).then_with(|| left.cmp(right))
}

enum Run<'a> {
    Digits(&'a str),
    Text(&'a str),
}

fn split_runs(value: &str) -> Vec<Run<'_>> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut in_digits: Option<bool> = None;

    for (index, ch) in value.char_indices() {
        let is_digit = ch.is_ascii_digit();
        match in_digits {
            Some(current) if current != is_digit => {
                runs.push(make_run(&value[start..index], current));
                start = index;
                in_digits = Some(is_digit);
            }
            None => in_digits = Some(is_digit),
            _ => {}
        }
    }
    if let Some(current) = in_digits {
        runs.push(make_run(&value[start..], current));
    }
    runs
}

fn make_run(slice: &str, digits: bool) -> Run<'_> {
    if digits {
        Run::Digits(slice)
    } else {
        Run::Text(slice)
    }
}
