//! Sequence Parser
//!
//! Loads sequence documents from YAML and builds the `Sequence` tree:
//! subsequences are nested documents, and a backup is a reference to one of
//! them (or an external document passed at load time).
//!
//! ```yaml
//! sequence: main
//! backup: recovery
//! blocks:
//!   - { id: begin, type: Begin, outputs: [call] }
//!   - { id: call, type: Macro, inputs: [begin], outputs: [end],
//!       properties: { sequence: inner, iteration: 2 } }
//!   - { id: end, type: End, inputs: [call] }
//! subsequences:
//!   - sequence: inner
//!     blocks: [...]
//!   - sequence: recovery
//!     blocks: [...]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::{Block, Sequence};
use super::validator::validate_sequence;
use crate::error::SequenceError;

/// On-disk form of a sequence and its nested subsequences.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SequenceDocument {
    /// Sequence identifier
    pub sequence: String,

    /// Id of the subsequence run when this sequence fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,

    #[serde(default)]
    pub blocks: Vec<Block>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsequences: Vec<SequenceDocument>,

    /// Free data for editors, ignored by the engine
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// Options applied while loading a sequence.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Backups are only instantiated while the depth is below this limit
    pub max_depth: Option<usize>,
    /// External document used as the backup of the top-level sequence
    pub backup_file: Option<PathBuf>,
}

impl LoadOptions {
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }

    pub fn with_backup_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_file = Some(path.into());
        self
    }

    fn allows_depth(&self, depth: usize) -> bool {
        self.max_depth.map_or(true, |max| depth < max)
    }
}

/// Loads, builds and validates a sequence from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use seqrunner::sequence::{load_sequence, LoadOptions};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let sequence = load_sequence("main.yaml", &LoadOptions::default())?;
///     println!("Loaded {} blocks", sequence.len());
///     Ok(())
/// }
/// ```
pub fn load_sequence(
    path: impl AsRef<Path>,
    options: &LoadOptions,
) -> Result<Sequence, SequenceError> {
    let path = path.as_ref();
    info!("Loading sequence from: {}", path.display());
    let content = read_file(path)?;
    parse_sequence(&content, options)
}

/// Builds and validates a sequence from YAML text.
pub fn parse_sequence(content: &str, options: &LoadOptions) -> Result<Sequence, SequenceError> {
    let document: SequenceDocument = serde_yaml::from_str(content)?;
    debug!(
        "Parsed document '{}' ({} blocks, {} subsequences)",
        document.sequence,
        document.blocks.len(),
        document.subsequences.len()
    );

    let mut sequence = build_sequence(&document, 0, 0, options)?;

    if let Some(backup_path) = &options.backup_file {
        if options.allows_depth(0) {
            info!("Loading backup sequence from: {}", backup_path.display());
            let backup_doc: SequenceDocument = serde_yaml::from_str(&read_file(backup_path)?)?;
            let backup = build_sequence(&backup_doc, 1, 1, options)?;
            sequence.backup = Some(Arc::new(backup));
        }
    }

    validate_sequence(&sequence)?;
    info!(
        "Sequence '{}' loaded ({} blocks, {} subsequences)",
        sequence.id,
        sequence.len(),
        sequence.subsequences.len()
    );
    Ok(sequence)
}

fn read_file(path: &Path) -> Result<String, SequenceError> {
    fs::read_to_string(path).map_err(|source| SequenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Builds a sequence tree from a document at the given depth and level.
pub fn build_sequence(
    document: &SequenceDocument,
    depth: usize,
    level: usize,
    options: &LoadOptions,
) -> Result<Sequence, SequenceError> {
    let mut sequence = Sequence::new(document.sequence.as_str());
    sequence.depth = depth;
    sequence.level = level;

    for block in &document.blocks {
        sequence
            .add_block(block.clone())
            .map_err(SequenceError::Syntax)?;
    }

    for sub_doc in &document.subsequences {
        if sequence.subsequences.contains_key(sub_doc.sequence.trim()) {
            return Err(SequenceError::syntax(format!(
                "More than one subsequence with the ID : {}",
                sub_doc.sequence
            )));
        }
        let sub = build_sequence(sub_doc, depth, level + 1, options)?;
        sequence.subsequences.insert(sub.id.clone(), Arc::new(sub));
    }

    if let Some(backup_id) = &document.backup {
        if options.allows_depth(depth) {
            let backup_doc = document
                .subsequences
                .iter()
                .find(|doc| doc.sequence.trim() == backup_id.trim())
                .ok_or_else(|| {
                    SequenceError::syntax(format!(
                        "There is no subsequence called {} for backup",
                        backup_id
                    ))
                })?;
            let backup = build_sequence(backup_doc, depth + 1, level + 1, options)?;
            debug!(
                "Sequence '{}' uses '{}' as backup (depth {})",
                sequence.id, backup.id, backup.depth
            );
            sequence.backup = Some(Arc::new(backup));
        } else {
            debug!(
                "Backup of '{}' skipped: maximum depth reached",
                sequence.id
            );
        }
    }

    Ok(sequence)
}

/// Converts a sequence tree back to its document form.
pub fn to_document(sequence: &Sequence) -> SequenceDocument {
    let mut subsequences: Vec<SequenceDocument> =
        sequence.subsequences.values().map(|s| to_document(s)).collect();

    let backup = sequence.backup.as_ref().map(|backup| {
        if !sequence.subsequences.contains_key(&backup.id) {
            subsequences.push(to_document(backup));
        }
        backup.id.clone()
    });

    SequenceDocument {
        sequence: sequence.id.clone(),
        backup,
        blocks: sequence.blocks.clone(),
        subsequences,
        extra: BTreeMap::new(),
    }
}

/// Writes a sequence as a YAML document.
pub fn save_sequence(sequence: &Sequence, path: impl AsRef<Path>) -> Result<(), SequenceError> {
    let path = path.as_ref();
    let content = serde_yaml::to_string(&to_document(sequence))?;
    fs::write(path, content).map_err(|source| SequenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Sequence '{}' saved to {}", sequence.id, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MAIN: &str = r#"
sequence: main
backup: recovery
blocks:
  - id: begin
    type: Begin
    outputs: [call]
  - id: call
    type: Macro
    inputs: [begin]
    outputs: [end]
    properties:
      sequence: inner
      iteration: 2
  - id: end
    type: End
    inputs: [call]
subsequences:
  - sequence: inner
    blocks:
      - { id: begin, type: Begin, outputs: [act] }
      - { id: act, type: Action, inputs: [begin], outputs: [end],
          properties: { module: debug }, parameters: { log_value: hi } }
      - { id: end, type: End, inputs: [act] }
  - sequence: recovery
    blocks:
      - { id: begin, type: Begin, outputs: end }
      - { id: end, type: End, inputs: begin }
"#;

    const RESCUE: &str = r#"
sequence: rescue
blocks:
  - { id: start, type: Begin, outputs: [stop] }
  - { id: stop, type: End, inputs: [start] }
"#;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_parse_nested_sequence() {
        let seq = parse_sequence(MAIN, &LoadOptions::default()).unwrap();
        assert_eq!(seq.id, "main");
        assert_eq!(seq.len(), 3);

        let inner = seq.subsequences.get("inner").unwrap();
        assert_eq!(inner.level, 1);
        assert_eq!(inner.get_block("act").unwrap().parameters["log_value"], "hi");

        let backup = seq.backup.as_ref().unwrap();
        assert_eq!(backup.id, "recovery");
        assert_eq!(backup.depth, 1);
        assert_eq!(backup.level, 1);
    }

    #[test]
    fn test_max_depth_skips_backup() {
        let options = LoadOptions::default().with_max_depth(0);
        let seq = parse_sequence(MAIN, &options).unwrap();
        assert!(seq.backup.is_none());

        let options = LoadOptions::default().with_max_depth(1);
        assert!(parse_sequence(MAIN, &options).unwrap().backup.is_some());
    }

    #[test]
    fn test_unknown_backup() {
        let yaml = MAIN.replace("backup: recovery", "backup: nowhere");
        let err = parse_sequence(&yaml, &LoadOptions::default()).unwrap_err();
        assert!(err.is_syntax());
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_duplicate_subsequence() {
        let yaml = MAIN.replace("sequence: recovery", "sequence: inner");
        let err = parse_sequence(&yaml, &LoadOptions::default()).unwrap_err();
        assert!(err.is_syntax());
    }

    #[test]
    fn test_invalid_graph_rejected() {
        let yaml = MAIN.replace("inputs: [call]", "inputs: [begin]");
        let err = parse_sequence(&yaml, &LoadOptions::default()).unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_bad_yaml() {
        let err = parse_sequence("sequence: [", &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, SequenceError::Yaml(_)));
    }

    #[test]
    fn test_load_from_file_with_external_backup() {
        let main = write_temp(MAIN);
        let rescue = write_temp(RESCUE);

        let options = LoadOptions::default().with_backup_file(rescue.path());
        let seq = load_sequence(main.path(), &options).unwrap();
        let backup = seq.backup.as_ref().unwrap();
        assert_eq!(backup.id, "rescue");
        assert_eq!(backup.depth, 1);
    }

    #[test]
    fn test_missing_file() {
        let err = load_sequence("/nonexistent/main.yaml", &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, SequenceError::Io { .. }));
    }

    #[test]
    fn test_save_and_reload() {
        let seq = parse_sequence(MAIN, &LoadOptions::default()).unwrap();
        let file = NamedTempFile::new().unwrap();
        save_sequence(&seq, file.path()).unwrap();

        let reloaded = load_sequence(file.path(), &LoadOptions::default()).unwrap();
        assert_eq!(reloaded.blocks, seq.blocks);
        assert_eq!(reloaded.backup.as_ref().unwrap().id, "recovery");
        assert_eq!(
            reloaded.subsequences.keys().collect::<Vec<_>>(),
            vec!["inner", "recovery"]
        );
    }
}
