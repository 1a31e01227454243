//! Per-file lifecycle state machine.
//!
//! A file moves `discovered → parsing → parsed → relations → linked →
//! embedded`; any state may fall to `error`, and a handful of backward
//! transitions support retry, re-embed, and content-change re-parse. All
//! other transitions are rejected with a typed error. State is persisted on
//! the `File` node and same-state writes are no-ops.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{now_iso, GraphStore, PropertyMap};

/// Lifecycle state of a file in the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Discovered,
    Parsing,
    Parsed,
    Relations,
    Linked,
    Embedded,
    Error,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Discovered => "discovered",
            FileState::Parsing => "parsing",
            FileState::Parsed => "parsed",
            FileState::Relations => "relations",
            FileState::Linked => "linked",
            FileState::Embedded => "embedded",
            FileState::Error => "error",
        }
    }

    /// Whether reference resolution has completed for this file.
    pub fn is_linked(&self) -> bool {
        matches!(self, FileState::Linked | FileState::Embedded)
    }

    /// Position in the forward pipeline. `Error` sits outside it.
    fn rank(&self) -> Option<u8> {
        match self {
            FileState::Discovered => Some(0),
            FileState::Parsing => Some(1),
            FileState::Parsed => Some(2),
            FileState::Relations => Some(3),
            FileState::Linked => Some(4),
            FileState::Embedded => Some(5),
            FileState::Error => None,
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "discovered" => Ok(FileState::Discovered),
            "parsing" => Ok(FileState::Parsing),
            "parsed" => Ok(FileState::Parsed),
            "relations" => Ok(FileState::Relations),
            "linked" => Ok(FileState::Linked),
            "embedded" => Ok(FileState::Embedded),
            "error" => Ok(FileState::Error),
            other => Err(Error::Config(format!("unknown file state '{other}'"))),
        }
    }
}

/// Category of the failure that moved a file into the `error` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Parse,
    Link,
    Embed,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Link => "link",
            ErrorKind::Embed => "embed",
            ErrorKind::Io => "io",
        }
    }
}

/// Optional metadata carried by a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionMeta {
    pub content_hash: Option<String>,
    pub error_type: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl TransitionMeta {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            content_hash: None,
            error_type: Some(kind),
            error_message: Some(message.into()),
        }
    }
}

/// Whether a transition from `from` to `to` is allowed.
///
/// Allowed: forward along the pipeline (skips permitted, e.g. the unchanged
/// shortcut `parsing → linked`), any state → `error`, `error → parsing`
/// (retry), `embedded → linked` (re-embed without re-parse), and
/// `linked → parsing` (content change). Same-state transitions are
/// idempotent.
pub fn transition_allowed(from: FileState, to: FileState) -> bool {
    if from == to {
        return true;
    }
    match (from, to) {
        (_, FileState::Error) => true,
        (FileState::Error, FileState::Parsing) => true,
        (FileState::Error, _) => false,
        (FileState::Embedded, FileState::Linked) => true,
        (FileState::Linked, FileState::Parsing) => true,
        (a, b) => match (a.rank(), b.rank()) {
            (Some(ra), Some(rb)) => ra < rb,
            _ => false,
        },
    }
}

/// Persists state transitions onto `File` nodes through the graph store.
pub struct FileStateMachine<'a> {
    store: &'a dyn GraphStore,
}

impl<'a> FileStateMachine<'a> {
    pub fn new(store: &'a dyn GraphStore) -> Self {
        Self { store }
    }

    /// Read the current state stored on a `File` node.
    ///
    /// A file with no `state` property is treated as freshly discovered.
    pub async fn current(&self, file_uuid: &str) -> Result<FileState> {
        let node = self
            .store
            .get_node(file_uuid)
            .await?
            .ok_or_else(|| Error::store_fatal(format!("no such file node: {file_uuid}")))?;
        match node.prop_str("state") {
            Some(s) => s.parse(),
            None => Ok(FileState::Discovered),
        }
    }

    /// Transition a file to `to`, persisting the new state and metadata.
    ///
    /// Storing the current state again is a no-op. Invalid transitions return
    /// [`Error::InvalidTransition`] without writing.
    pub async fn transition(
        &self,
        file_uuid: &str,
        to: FileState,
        meta: TransitionMeta,
    ) -> Result<FileState> {
        let from = self.current(file_uuid).await?;
        if !transition_allowed(from, to) {
            return Err(Error::InvalidTransition { from, to });
        }
        if from == to {
            return Ok(to);
        }

        let mut props = PropertyMap::new();
        props.insert("state".into(), to.as_str().into());
        props.insert("stateUpdatedAt".into(), now_iso().into());
        if let Some(hash) = meta.content_hash {
            props.insert("hash".into(), hash.into());
        }
        if to == FileState::Error {
            if let Some(kind) = meta.error_type {
                props.insert("errorType".into(), kind.as_str().into());
            }
            if let Some(msg) = meta.error_message {
                props.insert("errorMessage".into(), msg.into());
            }
        } else {
            props.insert("errorType".into(), serde_json::Value::Null);
            props.insert("errorMessage".into(), serde_json::Value::Null);
        }
        self.store.update_properties(file_uuid, props).await?;
        Ok(to)
    }

    /// Route a file into `parsing` from whatever state it is in.
    ///
    /// `embedded` files step back through `linked` first; files stranded
    /// mid-pipeline (`parsed`, `relations`) are failed into `error` and
    /// retried from there, since the table has no direct backward edge.
    pub async fn begin_parsing(&self, file_uuid: &str) -> Result<()> {
        let mut current = self.current(file_uuid).await?;
        if current == FileState::Embedded {
            current = self
                .transition(file_uuid, FileState::Linked, TransitionMeta::default())
                .await?;
        }
        if !transition_allowed(current, FileState::Parsing) {
            self.transition(
                file_uuid,
                FileState::Error,
                TransitionMeta::error(ErrorKind::Io, "restarted mid-pipeline"),
            )
            .await?;
        }
        self.transition(file_uuid, FileState::Parsing, TransitionMeta::default())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FileState::*;

    #[test]
    fn forward_steps_allowed() {
        assert!(transition_allowed(Discovered, Parsing));
        assert!(transition_allowed(Parsing, Parsed));
        assert!(transition_allowed(Parsed, Relations));
        assert!(transition_allowed(Relations, Linked));
        assert!(transition_allowed(Linked, Embedded));
    }

    #[test]
    fn forward_skip_allowed() {
        // The unchanged-file shortcut.
        assert!(transition_allowed(Parsing, Linked));
        assert!(transition_allowed(Discovered, Embedded));
    }

    #[test]
    fn backward_rejected() {
        assert!(!transition_allowed(Parsed, Parsing));
        assert!(!transition_allowed(Linked, Relations));
        assert!(!transition_allowed(Embedded, Parsed));
        assert!(!transition_allowed(Parsing, Discovered));
    }

    #[test]
    fn any_state_may_fail() {
        for s in [Discovered, Parsing, Parsed, Relations, Linked, Embedded, Error] {
            assert!(transition_allowed(s, Error));
        }
    }

    #[test]
    fn error_retries_via_parsing_only() {
        assert!(transition_allowed(Error, Parsing));
        assert!(!transition_allowed(Error, Parsed));
        assert!(!transition_allowed(Error, Linked));
        assert!(!transition_allowed(Error, Discovered));
    }

    #[test]
    fn reembed_and_reparse_edges() {
        assert!(transition_allowed(Embedded, Linked));
        assert!(transition_allowed(Linked, Embedded));
        assert!(transition_allowed(Linked, Parsing));
    }

    #[test]
    fn same_state_is_idempotent() {
        for s in [Discovered, Parsing, Parsed, Relations, Linked, Embedded, Error] {
            assert!(transition_allowed(s, s));
        }
    }

    #[test]
    fn state_round_trips_through_strings() {
        for s in [Discovered, Parsing, Parsed, Relations, Linked, Embedded, Error] {
            assert_eq!(s.as_str().parse::<FileState>().unwrap(), s);
        }
    }

    #[test]
    fn unknown_state_string_rejected() {
        assert!("stuck".parse::<FileState>().is_err());
    }
}
