//! Job type tags.

use std::borrow::Cow;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

const MAX_JOB_TYPE_LEN: usize = 64;

/// Tag identifying which domain handler owns a job (e.g. `bug-heat-update`).
///
/// Domain modules usually declare their tags as constants:
///
/// ```
/// use backlog_core::JobType;
///
/// pub const INITIALISE_SERIES: JobType = JobType::from_static("initialise-series");
/// assert_eq!(INITIALISE_SERIES.as_str(), "initialise-series");
/// ```
///
/// Tags are lowercase ASCII letters, digits, `-` and `_`, start with a letter
/// and are at most 64 bytes long. Runtime strings go through
/// [`JobType::parse`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobType(Cow<'static, str>);

impl JobType {
    /// Tag for a constant.
    ///
    /// # Panics
    ///
    /// On a malformed tag. In a `const` item this is a compile error.
    pub const fn from_static(tag: &'static str) -> Self {
        if !is_well_formed(tag.as_bytes()) {
            panic!("malformed job type tag");
        }
        Self(Cow::Borrowed(tag))
    }

    pub fn parse(tag: impl Into<String>) -> Result<Self, RecordError> {
        let tag = tag.into();
        validate(&tag)?;
        Ok(Self(Cow::Owned(tag)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

const fn is_well_formed(tag: &[u8]) -> bool {
    if tag.is_empty() || tag.len() > MAX_JOB_TYPE_LEN || !tag[0].is_ascii_lowercase() {
        return false;
    }
    let mut i = 1;
    while i < tag.len() {
        let c = tag[i];
        if !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'-' || c == b'_') {
            return false;
        }
        i += 1;
    }
    true
}

fn validate(tag: &str) -> Result<(), RecordError> {
    if tag.is_empty() {
        return Err(RecordError::invalid_job_type("job type must not be empty"));
    }
    if tag.len() > MAX_JOB_TYPE_LEN {
        return Err(RecordError::invalid_job_type(format!(
            "job type exceeds {MAX_JOB_TYPE_LEN} bytes"
        )));
    }
    if !tag.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(RecordError::invalid_job_type(format!(
            "job type must start with a lowercase letter: {tag}"
        )));
    }
    if let Some(bad) = tag
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
    {
        return Err(RecordError::invalid_job_type(format!(
            "unexpected character {bad:?} in {tag}"
        )));
    }
    Ok(())
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobType {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobType {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<JobType> for String {
    fn from(value: JobType) -> Self {
        value.0.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn static_and_parsed_tags_compare_equal() {
        const BUG_HEAT: JobType = JobType::from_static("bug-heat-update");
        assert_eq!(BUG_HEAT, JobType::parse("bug-heat-update").unwrap());
    }

    #[test]
    #[should_panic(expected = "malformed job type tag")]
    fn static_tags_are_validated() {
        let _ = JobType::from_static("Not A Tag");
    }

    #[test]
    fn rejects_malformed_tags() {
        for bad in ["", "Upper", "1starts-with-digit", "has space", "dots.not.allowed"] {
            assert!(JobType::parse(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(JobType::parse("x".repeat(65)).is_err());
        assert!(JobType::parse("snap_store-upload2").is_ok());
    }

    proptest! {
        /// Property: every well-formed tag parses and displays unchanged.
        #[test]
        fn well_formed_tags_parse(tag in "[a-z][a-z0-9_-]{0,63}") {
            let parsed = JobType::parse(tag.clone()).unwrap();
            prop_assert_eq!(parsed.to_string(), tag);
        }
    }

    #[test]
    fn serde_validates_on_decode() {
        let ok: JobType = serde_json::from_str("\"translation-merge\"").unwrap();
        assert_eq!(ok.as_str(), "translation-merge");
        assert!(serde_json::from_str::<JobType>("\"Nope\"").is_err());
    }
}
