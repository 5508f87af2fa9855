//! Stdio specification and its normalization into per-slot descriptors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::command::Platform;
use crate::error::{ProcessError, Result};

/// Number of standard slots (stdin, stdout, stderr)
pub const STANDARD_SLOTS: usize = 3;

/// Named stdio mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String", into = "String")]
pub enum StdioKeyword {
    Pipe,
    Ignore,
    Inherit,
    Ipc,
    /// Pipe opened for overlapped I/O; plain pipe outside Windows
    Overlapped,
}

impl StdioKeyword {
    pub fn as_str(&self) -> &'static str {
        match self {
            StdioKeyword::Pipe => "pipe",
            StdioKeyword::Ignore => "ignore",
            StdioKeyword::Inherit => "inherit",
            StdioKeyword::Ipc => "ipc",
            StdioKeyword::Overlapped => "overlapped",
        }
    }
}

impl FromStr for StdioKeyword {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pipe" => Ok(StdioKeyword::Pipe),
            "ignore" => Ok(StdioKeyword::Ignore),
            "inherit" => Ok(StdioKeyword::Inherit),
            "ipc" => Ok(StdioKeyword::Ipc),
            "overlapped" => Ok(StdioKeyword::Overlapped),
            other => Err(ProcessError::InvalidStdioSpec(format!(
                "unknown stdio mode '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for StdioKeyword {
    type Error = ProcessError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StdioKeyword> for String {
    fn from(keyword: StdioKeyword) -> Self {
        keyword.as_str().to_string()
    }
}

impl fmt::Display for StdioKeyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the parent's own standard streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentStream {
    Stdin,
    Stdout,
    Stderr,
}

/// One caller-supplied slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StdioEntry {
    /// No preference; defaults to `pipe`
    Unset,
    Keyword(StdioKeyword),
    /// Pass this descriptor of the parent through
    Fd(i32),
    /// Share one of the parent's standard streams
    #[serde(skip)]
    Parent(ParentStream),
}

impl From<StdioKeyword> for StdioEntry {
    fn from(keyword: StdioKeyword) -> Self {
        StdioEntry::Keyword(keyword)
    }
}

impl From<i32> for StdioEntry {
    fn from(fd: i32) -> Self {
        StdioEntry::Fd(fd)
    }
}

impl From<ParentStream> for StdioEntry {
    fn from(stream: ParentStream) -> Self {
        StdioEntry::Parent(stream)
    }
}

impl<T: Into<StdioEntry>> From<Option<T>> for StdioEntry {
    fn from(entry: Option<T>) -> Self {
        entry.map_or(StdioEntry::Unset, Into::into)
    }
}

impl FromStr for StdioEntry {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse().map(StdioEntry::Keyword)
    }
}

/// Caller-facing stdio configuration: one mode for all standard slots, or
/// an explicit per-slot list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StdioSpec {
    Keyword(StdioKeyword),
    List(Vec<StdioEntry>),
}

impl Default for StdioSpec {
    fn default() -> Self {
        StdioSpec::Keyword(StdioKeyword::Pipe)
    }
}

impl StdioSpec {
    /// Parse a single mode keyword
    pub fn parse(keyword: &str) -> Result<Self> {
        keyword.parse().map(StdioSpec::Keyword)
    }

    /// Build a per-slot list from keywords
    pub fn from_keywords(keywords: &[&str]) -> Result<Self> {
        keywords
            .iter()
            .map(|k| k.parse())
            .collect::<Result<Vec<StdioEntry>>>()
            .map(StdioSpec::List)
    }

    pub fn list<I, E>(entries: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<StdioEntry>,
    {
        StdioSpec::List(entries.into_iter().map(Into::into).collect())
    }
}

impl From<StdioKeyword> for StdioSpec {
    fn from(keyword: StdioKeyword) -> Self {
        StdioSpec::Keyword(keyword)
    }
}

impl From<Vec<StdioEntry>> for StdioSpec {
    fn from(entries: Vec<StdioEntry>) -> Self {
        StdioSpec::List(entries)
    }
}

/// Resolved wiring of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioDescriptor {
    Pipe,
    Inherit,
    Ignore,
    Ipc,
    /// Duplicate this parent descriptor into the slot
    ExternalHandle(i32),
}

impl StdioDescriptor {
    fn from_keyword(keyword: StdioKeyword, platform: Platform) -> Result<Self> {
        Ok(match keyword {
            StdioKeyword::Pipe => StdioDescriptor::Pipe,
            StdioKeyword::Ignore => StdioDescriptor::Ignore,
            StdioKeyword::Inherit => StdioDescriptor::Inherit,
            StdioKeyword::Ipc => StdioDescriptor::Ipc,
            StdioKeyword::Overlapped => match platform {
                Platform::Windows => {
                    return Err(ProcessError::Unsupported(
                        "overlapped stdio is not implemented".to_string(),
                    ))
                }
                Platform::Posix => StdioDescriptor::Pipe,
            },
        })
    }

    fn from_entry(entry: StdioEntry, platform: Platform) -> Result<Self> {
        match entry {
            StdioEntry::Unset => Ok(StdioDescriptor::Pipe),
            StdioEntry::Keyword(keyword) => Self::from_keyword(keyword, platform),
            StdioEntry::Fd(fd) if fd < 0 => Err(ProcessError::InvalidStdioSpec(format!(
                "invalid file descriptor {}",
                fd
            ))),
            StdioEntry::Fd(fd) => Ok(StdioDescriptor::ExternalHandle(fd)),
            StdioEntry::Parent(_) => Ok(StdioDescriptor::Inherit),
        }
    }

    /// Whether the parent ends up holding a readable stream for this slot
    pub fn is_pipe(&self) -> bool {
        matches!(self, StdioDescriptor::Pipe)
    }
}

/// Normalize `spec` into at least three slot descriptors
///
/// - `[0, 1, 2]` means inherit everything
/// - a three-entry list with any unset entry means pipe everything; this
///   drops the other two entries and is kept for compatibility
/// - shorter lists are padded with `pipe`
/// - at most one slot may be `ipc`
pub fn resolve(spec: &StdioSpec, platform: Platform) -> Result<Vec<StdioDescriptor>> {
    let descriptors = match spec {
        StdioSpec::Keyword(keyword) => {
            vec![StdioDescriptor::from_keyword(*keyword, platform)?; STANDARD_SLOTS]
        }
        StdioSpec::List(entries) => {
            if entries.as_slice() == [StdioEntry::Fd(0), StdioEntry::Fd(1), StdioEntry::Fd(2)] {
                vec![StdioDescriptor::Inherit; STANDARD_SLOTS]
            } else if entries.len() == STANDARD_SLOTS && entries.contains(&StdioEntry::Unset) {
                vec![StdioDescriptor::Pipe; STANDARD_SLOTS]
            } else {
                let mut descriptors = entries
                    .iter()
                    .map(|entry| StdioDescriptor::from_entry(*entry, platform))
                    .collect::<Result<Vec<_>>>()?;
                if descriptors.len() < STANDARD_SLOTS {
                    descriptors.resize(STANDARD_SLOTS, StdioDescriptor::Pipe);
                }
                descriptors
            }
        }
    };

    let ipc_slots = descriptors
        .iter()
        .filter(|d| **d == StdioDescriptor::Ipc)
        .count();
    if ipc_slots > 1 {
        return Err(ProcessError::InvalidStdioSpec(
            "child processes support only one ipc slot".to_string(),
        ));
    }

    Ok(descriptors)
}

/// Index of the `ipc` slot, if any
pub fn ipc_slot(descriptors: &[StdioDescriptor]) -> Option<usize> {
    descriptors.iter().position(|d| *d == StdioDescriptor::Ipc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use StdioDescriptor::*;

    fn posix(spec: &StdioSpec) -> Result<Vec<StdioDescriptor>> {
        resolve(spec, Platform::Posix)
    }

    #[test]
    fn test_keyword_applies_to_all_standard_slots() {
        assert_eq!(posix(&StdioSpec::parse("inherit").unwrap()).unwrap(), vec![Inherit; 3]);
        assert_eq!(posix(&StdioSpec::parse("ignore").unwrap()).unwrap(), vec![Ignore; 3]);
        assert_eq!(posix(&StdioSpec::default()).unwrap(), vec![Pipe; 3]);
    }

    #[test]
    fn test_standard_fds_mean_inherit() {
        let spec = StdioSpec::list([0, 1, 2]);
        assert_eq!(posix(&spec).unwrap(), vec![Inherit; 3]);
    }

    #[test]
    fn test_other_fds_pass_through() {
        let spec = StdioSpec::list([0, 1, 5]);
        assert_eq!(
            posix(&spec).unwrap(),
            vec![ExternalHandle(0), ExternalHandle(1), ExternalHandle(5)]
        );
    }

    #[test]
    fn test_triple_with_unset_collapses_to_pipe() {
        let spec = StdioSpec::List(vec![
            StdioEntry::Keyword(StdioKeyword::Ignore),
            StdioEntry::Unset,
            StdioEntry::Keyword(StdioKeyword::Inherit),
        ]);
        assert_eq!(posix(&spec).unwrap(), vec![Pipe; 3]);
    }

    #[test]
    fn test_unset_outside_triple_defaults_to_pipe() {
        let spec = StdioSpec::List(vec![
            StdioEntry::Keyword(StdioKeyword::Ignore),
            StdioEntry::Unset,
        ]);
        assert_eq!(posix(&spec).unwrap(), vec![Ignore, Pipe, Pipe]);
    }

    #[test]
    fn test_parent_streams_inherit() {
        let spec = StdioSpec::list([
            StdioEntry::from(StdioKeyword::Pipe),
            StdioEntry::from(ParentStream::Stdout),
            StdioEntry::from(ParentStream::Stderr),
        ]);
        assert_eq!(posix(&spec).unwrap(), vec![Pipe, Inherit, Inherit]);
    }

    #[test]
    fn test_extra_slots_are_kept() {
        let spec = StdioSpec::from_keywords(&["pipe", "pipe", "pipe", "ipc", "ignore"]).unwrap();
        let resolved = posix(&spec).unwrap();
        assert_eq!(resolved, vec![Pipe, Pipe, Pipe, Ipc, Ignore]);
        assert_eq!(ipc_slot(&resolved), Some(3));
    }

    #[test]
    fn test_unknown_keyword_is_rejected() {
        assert!(matches!(
            StdioSpec::parse("pipes"),
            Err(ProcessError::InvalidStdioSpec(_))
        ));
        assert!(matches!(
            StdioSpec::from_keywords(&["pipe", "bogus"]),
            Err(ProcessError::InvalidStdioSpec(_))
        ));
    }

    #[test]
    fn test_negative_fd_is_rejected() {
        assert!(matches!(
            posix(&StdioSpec::list([-1])),
            Err(ProcessError::InvalidStdioSpec(_))
        ));
    }

    #[test]
    fn test_second_ipc_slot_is_rejected() {
        let spec = StdioSpec::from_keywords(&["pipe", "pipe", "pipe", "ipc", "ipc"]).unwrap();
        assert!(matches!(posix(&spec), Err(ProcessError::InvalidStdioSpec(_))));
    }

    #[test]
    fn test_overlapped_by_platform() {
        let spec = StdioSpec::parse("overlapped").unwrap();
        assert_eq!(posix(&spec).unwrap(), vec![Pipe; 3]);
        assert!(matches!(
            resolve(&spec, Platform::Windows),
            Err(ProcessError::Unsupported(_))
        ));
    }

    #[test]
    fn test_serde_accepts_duck_typed_entries() {
        let spec: StdioSpec = serde_json::from_str(r#"["inherit", null, 4, "ipc"]"#).unwrap();
        assert_eq!(
            spec,
            StdioSpec::List(vec![
                StdioEntry::Keyword(StdioKeyword::Inherit),
                StdioEntry::Unset,
                StdioEntry::Fd(4),
                StdioEntry::Keyword(StdioKeyword::Ipc),
            ])
        );

        let keyword: StdioSpec = serde_json::from_str(r#""ignore""#).unwrap();
        assert_eq!(keyword, StdioSpec::Keyword(StdioKeyword::Ignore));

        assert!(serde_json::from_str::<StdioSpec>(r#""bogus""#).is_err());
    }

    fn entry_strategy() -> impl Strategy<Value = StdioEntry> {
        prop_oneof![
            Just(StdioEntry::Keyword(StdioKeyword::Pipe)),
            Just(StdioEntry::Keyword(StdioKeyword::Ignore)),
            Just(StdioEntry::Keyword(StdioKeyword::Inherit)),
            (3..64i32).prop_map(StdioEntry::Fd),
        ]
    }

    proptest! {
        #[test]
        fn prop_short_lists_pad_with_pipe(
            entries in prop::collection::vec(entry_strategy(), 0..3)
        ) {
            let resolved = posix(&StdioSpec::List(entries.clone())).unwrap();
            prop_assert_eq!(resolved.len(), STANDARD_SLOTS);
            for slot in resolved.iter().skip(entries.len()) {
                prop_assert_eq!(*slot, Pipe);
            }
        }

        #[test]
        fn prop_long_lists_keep_length(entries in prop::collection::vec(entry_strategy(), 4..8)) {
            let resolved = posix(&StdioSpec::List(entries.clone())).unwrap();
            prop_assert_eq!(resolved.len(), entries.len());
        }
    }
}
