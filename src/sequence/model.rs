//! Sequence Data Model
//!
//! Core data structures representing sequence blocks and the links between
//! them. A sequence is built once (by the parser or programmatically), then
//! validated, and is read-only for the whole execution.
//!
//! # Example YAML Format
//!
//! ```yaml
//! sequence: main
//! blocks:
//!   - id: begin
//!     type: Begin
//!     outputs: [measure]
//!
//!   - id: measure
//!     type: Action
//!     inputs: [begin]
//!     outputs: [end]
//!     properties:
//!       module: debug
//!       iteration: 3
//!       tick: 0.5
//!     parameters:
//!       log_value: hello
//!
//!   - id: end
//!     type: End
//!     inputs: [measure]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type tag of a block.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Begin,
    End,
    Action,
    Macro,
    Branch,
    TimeInit,
    Wait,
}

/// How many links of one direction a block type accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// No link allowed
    Zero,
    /// Exactly one link
    One,
    /// One or more links
    Many,
}

impl BlockType {
    /// Upper-case tag used in log events.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Begin => "BEGIN",
            Self::End => "END",
            Self::Action => "ACTION",
            Self::Macro => "MACRO",
            Self::Branch => "BRANCH",
            Self::TimeInit => "TIMEINIT",
            Self::Wait => "WAIT",
        }
    }

    /// Accepted number of input links.
    pub fn inputs(&self) -> Cardinality {
        match self {
            Self::Begin => Cardinality::Zero,
            Self::Branch => Cardinality::Many,
            _ => Cardinality::One,
        }
    }

    /// Accepted number of output links.
    pub fn outputs(&self) -> Cardinality {
        match self {
            Self::End => Cardinality::Zero,
            Self::Branch => Cardinality::Many,
            _ => Cardinality::One,
        }
    }

    /// Properties this block type may carry.
    pub fn allowed_properties(&self) -> &'static [&'static str] {
        match self {
            Self::Action => &["module", "iteration", "tick"],
            Self::Macro => &["iteration", "tick", "sequence"],
            Self::Wait => &["time", "absolute"],
            _ => &[],
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Default iteration count for actions and macros.
pub const DEFAULT_ITERATION: u32 = 1;
/// Default tick (seconds) between iterations.
pub const DEFAULT_TICK: f64 = 0.0;
/// Default wait time (seconds).
pub const DEFAULT_WAIT_TIME: f64 = 1.0;
/// Waits are absolute unless stated otherwise.
pub const DEFAULT_ABSOLUTE: bool = true;
/// Upper bound (seconds) accepted for `tick` and `time`.
pub const MAX_SECONDS: f64 = 1.0e9;

/// Converts a `tick` or `time` value, clamped to `[0, MAX_SECONDS]`.
///
/// NaN maps to zero.
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_SECONDS)).unwrap_or(Duration::ZERO)
}

/// Type-specific block properties.
///
/// Every field is optional in the document; the validator checks that only
/// the fields allowed for the block type are present, and the accessors
/// supply defaults for the missing ones.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BlockProperties {
    /// Plugin reference of an action block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Number of runs (actions) or nested runs (macros)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,

    /// Delay in seconds between two iterations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<f64>,

    /// Wait duration or deadline in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,

    /// Whether the wait time is measured from the time reference
    #[serde(
        default,
        deserialize_with = "flexible_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub absolute: Option<bool>,

    /// Subsequence invoked by a macro block
    #[serde(rename = "sequence", default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
}

impl BlockProperties {
    pub fn iteration(&self) -> u32 {
        self.iteration.unwrap_or(DEFAULT_ITERATION)
    }

    pub fn tick(&self) -> f64 {
        self.tick.unwrap_or(DEFAULT_TICK)
    }

    pub fn time(&self) -> f64 {
        self.time.unwrap_or(DEFAULT_WAIT_TIME)
    }

    pub fn absolute(&self) -> bool {
        self.absolute.unwrap_or(DEFAULT_ABSOLUTE)
    }

    /// Names of the properties that are set.
    pub fn present(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.module.is_some() {
            names.push("module");
        }
        if self.iteration.is_some() {
            names.push("iteration");
        }
        if self.tick.is_some() {
            names.push("tick");
        }
        if self.time.is_some() {
            names.push("time");
        }
        if self.absolute.is_some() {
            names.push("absolute");
        }
        if self.sequence_id.is_some() {
            names.push("sequence");
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.present().is_empty()
    }
}

/// A typed node of a sequence graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Block {
    /// Identifier, unique within its sequence
    pub id: String,

    /// Block type tag
    #[serde(rename = "type")]
    pub block_type: BlockType,

    /// Ordered ids of the blocks linking into this one
    #[serde(deserialize_with = "link_list", default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,

    /// Ordered ids of the blocks this one links to
    #[serde(deserialize_with = "link_list", default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,

    /// Type-specific properties
    #[serde(default, skip_serializing_if = "BlockProperties::is_empty")]
    pub properties: BlockProperties,

    /// Raw action parameters, resolved against the plugin defaults at load
    #[serde(deserialize_with = "scalar_map", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    /// Free data for editors, ignored by the engine
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// Deserializes a link list given either as a YAML list or as a
/// `;`-separated string.
fn link_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(s
            .split(';')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect()),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.trim().to_string()),
                _ => Err(de::Error::custom("Expected block id in link list")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected block id list or ';'-separated string")),
    }
}

/// Deserializes a map of scalars into strings so that `iteration: 3` and
/// `iteration: "3"` are equivalent parameter values.
fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    map.into_iter()
        .map(|(name, value)| {
            let text = match value {
                Value::String(s) => s,
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Null => String::new(),
                _ => {
                    return Err(de::Error::custom(format!(
                        "Parameter '{}' must be a scalar value",
                        name
                    )))
                }
            };
            Ok((name, text))
        })
        .collect()
}

/// Accepts `true`/`false` as well as the strings `"true"`, `"1"`, `"false"`
/// and `"0"` (case-insensitive).
fn flexible_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(b)),
        Value::Number(n) if n.as_u64() == Some(1) => Ok(Some(true)),
        Value::Number(n) if n.as_u64() == Some(0) => Ok(Some(false)),
        Value::String(s) => parse_bool(&s)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("Couldn't cast '{}' to bool", s))),
        other => Err(de::Error::custom(format!("Couldn't cast {} to bool", other))),
    }
}

/// Parses the textual booleans accepted in documents and parameters.
pub fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

impl Block {
    /// Creates a block with no links and no properties.
    pub fn new(id: impl Into<String>, block_type: BlockType) -> Self {
        Self {
            id: id.into().trim().to_string(),
            block_type,
            inputs: Vec::new(),
            outputs: Vec::new(),
            properties: BlockProperties::default(),
            parameters: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn begin(id: impl Into<String>) -> Self {
        Self::new(id, BlockType::Begin)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, BlockType::End)
    }

    pub fn branch(id: impl Into<String>) -> Self {
        Self::new(id, BlockType::Branch)
    }

    pub fn time_init(id: impl Into<String>) -> Self {
        Self::new(id, BlockType::TimeInit)
    }

    /// Creates an action block bound to a plugin.
    ///
    /// # Example
    ///
    /// ```
    /// use seqrunner::sequence::Block;
    ///
    /// let block = Block::action("measure", "debug")
    ///     .with_iteration(3)
    ///     .with_tick(0.5)
    ///     .with_parameter("log_value", "hello");
    /// assert_eq!(block.properties.iteration(), 3);
    /// ```
    pub fn action(id: impl Into<String>, module: impl Into<String>) -> Self {
        let mut block = Self::new(id, BlockType::Action);
        block.properties.module = Some(module.into());
        block
    }

    /// Creates a macro block invoking a subsequence.
    pub fn macro_call(id: impl Into<String>, sequence_id: impl Into<String>) -> Self {
        let mut block = Self::new(id, BlockType::Macro);
        block.properties.sequence_id = Some(sequence_id.into());
        block
    }

    /// Creates a wait block.
    pub fn wait(id: impl Into<String>, time: f64, absolute: bool) -> Self {
        let mut block = Self::new(id, BlockType::Wait);
        block.properties.time = Some(time);
        block.properties.absolute = Some(absolute);
        block
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.properties.iteration = Some(iteration);
        self
    }

    pub fn with_tick(mut self, tick: f64) -> Self {
        self.properties.tick = Some(tick);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// A sequence: a block graph with its subsequences and optional backup.
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Sequence identifier
    pub id: String,

    /// Distance along the backup chain from the top-level sequence
    pub depth: usize,

    /// Nesting level through subsequence calls and backups
    pub level: usize,

    /// Blocks in document order
    pub blocks: Vec<Block>,

    /// Sequences invoked by macro blocks, by id
    pub subsequences: BTreeMap<String, Arc<Sequence>>,

    /// Sequence run when an execution of this one fails
    pub backup: Option<Arc<Sequence>>,
}

impl Sequence {
    /// Creates an empty top-level sequence.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            depth: 0,
            level: 0,
            blocks: Vec::new(),
            subsequences: BTreeMap::new(),
            backup: None,
        }
    }

    /// Adds a block to the sequence.
    pub fn add_block(&mut self, block: Block) -> Result<(), String> {
        if self.blocks.iter().any(|b| b.id == block.id) {
            return Err(format!("More than one block with the ID : {}", block.id));
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Links `from` to `to`, recording the link on both blocks.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), String> {
        if self.get_block(to).is_none() {
            return Err(format!("Block '{}' not found", to));
        }
        let source = self
            .get_block_mut(from)
            .ok_or_else(|| format!("Block '{}' not found", from))?;
        source.outputs.push(to.to_string());

        if let Some(target) = self.get_block_mut(to) {
            target.inputs.push(from.to_string());
        }
        Ok(())
    }

    /// Links the given blocks one after the other.
    pub fn connect_chain(&mut self, ids: &[&str]) -> Result<(), String> {
        for pair in ids.windows(2) {
            self.connect(pair[0], pair[1])?;
        }
        Ok(())
    }

    /// Registers a subsequence callable from macro blocks.
    ///
    /// The subsequence is re-levelled below this sequence.
    pub fn add_subsequence(&mut self, mut sequence: Sequence) -> Result<(), String> {
        if self.subsequences.contains_key(&sequence.id) {
            return Err(format!(
                "More than one subsequence with the ID : {}",
                sequence.id
            ));
        }
        sequence.set_level(self.level + 1);
        self.subsequences
            .insert(sequence.id.clone(), Arc::new(sequence));
        Ok(())
    }

    /// Sets the backup sequence, one step further along the backup chain.
    pub fn set_backup(&mut self, mut backup: Sequence) {
        backup.set_level(self.level + 1);
        backup.set_depth(self.depth + 1);
        self.backup = Some(Arc::new(backup));
    }

    /// Sets the nesting level of this sequence and everything below it.
    pub fn set_level(&mut self, level: usize) {
        self.level = level;
        for sub in self.subsequences.values_mut() {
            Arc::make_mut(sub).set_level(level + 1);
        }
        if let Some(backup) = self.backup.as_mut() {
            Arc::make_mut(backup).set_level(level + 1);
        }
    }

    /// Sets the backup depth of this sequence and of its backup chain.
    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
        if let Some(backup) = self.backup.as_mut() {
            Arc::make_mut(backup).set_depth(depth + 1);
        }
    }

    pub fn get_block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn get_block_mut(&mut self, id: &str) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    /// Index of a block in `blocks`.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }

    /// Returns the first Begin block.
    pub fn begin(&self) -> Option<&Block> {
        self.blocks
            .iter()
            .find(|b| b.block_type == BlockType::Begin)
    }

    /// Returns all End blocks.
    pub fn end_blocks(&self) -> Vec<&Block> {
        self.blocks
            .iter()
            .filter(|b| b.block_type == BlockType::End)
            .collect()
    }

    /// Subsequence invoked by a macro block, if any.
    pub fn subsequence_for(&self, block: &Block) -> Option<&Arc<Sequence>> {
        block
            .properties
            .sequence_id
            .as_ref()
            .and_then(|id| self.subsequences.get(id))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> Sequence {
        let mut seq = Sequence::new("main");
        seq.add_block(Block::begin("begin")).unwrap();
        seq.add_block(Block::action("act", "debug")).unwrap();
        seq.add_block(Block::end("end")).unwrap();
        seq.connect_chain(&["begin", "act", "end"]).unwrap();
        seq
    }

    #[test]
    fn test_connect_is_reciprocal() {
        let seq = linear();
        assert_eq!(seq.get_block("begin").unwrap().outputs, vec!["act"]);
        assert_eq!(seq.get_block("act").unwrap().inputs, vec!["begin"]);
        assert_eq!(seq.get_block("end").unwrap().inputs, vec!["act"]);
    }

    #[test]
    fn test_connect_unknown_block() {
        let mut seq = linear();
        assert!(seq.connect("act", "ghost").is_err());
        assert!(seq.connect("ghost", "act").is_err());
        assert_eq!(seq.get_block("act").unwrap().outputs, vec!["end"]);
    }

    #[test]
    fn test_duplicate_block() {
        let mut seq = linear();
        assert!(seq.add_block(Block::end("end")).is_err());
        assert_eq!(seq.len(), 3);
    }

    #[test]
    fn test_begin_and_end_lookup() {
        let seq = linear();
        assert_eq!(seq.begin().unwrap().id, "begin");
        assert_eq!(seq.end_blocks().len(), 1);
        assert_eq!(seq.index_of("end"), Some(2));
    }

    #[test]
    fn test_property_defaults() {
        let block = Block::new("w", BlockType::Wait);
        assert_eq!(block.properties.time(), DEFAULT_WAIT_TIME);
        assert!(block.properties.absolute());
        assert_eq!(block.properties.iteration(), 1);
        assert_eq!(block.properties.tick(), 0.0);
        assert!(block.properties.is_empty());
    }

    #[test]
    fn test_properties_present() {
        let block = Block::macro_call("m", "sub").with_iteration(2);
        assert_eq!(block.properties.present(), vec!["iteration", "sequence"]);
    }

    #[test]
    fn test_subsequence_levels() {
        let mut inner = Sequence::new("inner");
        inner.add_subsequence(Sequence::new("deepest")).unwrap();

        let mut seq = linear();
        seq.add_subsequence(inner).unwrap();
        seq.set_backup(Sequence::new("recovery"));

        let inner = seq.subsequences.get("inner").unwrap();
        assert_eq!(inner.level, 1);
        assert_eq!(inner.subsequences.get("deepest").unwrap().level, 2);

        let backup = seq.backup.as_ref().unwrap();
        assert_eq!(backup.level, 1);
        assert_eq!(backup.depth, 1);
    }

    #[test]
    fn test_duplicate_subsequence() {
        let mut seq = linear();
        seq.add_subsequence(Sequence::new("sub")).unwrap();
        assert!(seq.add_subsequence(Sequence::new("sub")).is_err());
    }

    #[test]
    fn test_subsequence_for_macro() {
        let mut seq = linear();
        seq.add_subsequence(Sequence::new("sub")).unwrap();
        let block = Block::macro_call("m", "sub");
        assert_eq!(seq.subsequence_for(&block).unwrap().id, "sub");
        assert!(seq.subsequence_for(&Block::branch("b")).is_none());
    }

    #[test]
    fn test_block_yaml_links_from_string() {
        let yaml = r#"
id: fork
type: Branch
inputs: "a; b"
outputs: [c, d]
"#;
        let block: Block = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(block.inputs, vec!["a", "b"]);
        assert_eq!(block.outputs, vec!["c", "d"]);
    }

    #[test]
    fn test_block_yaml_scalar_parameters() {
        let yaml = r#"
id: act
type: Action
properties: { module: custom, absolute: "1" }
parameters:
  count: 42
  ratio: 0.5
  enabled: true
  name: probe
"#;
        let block: Block = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(block.parameters["count"], "42");
        assert_eq!(block.parameters["ratio"], "0.5");
        assert_eq!(block.parameters["enabled"], "true");
        assert_eq!(block.parameters["name"], "probe");
        assert_eq!(block.properties.absolute, Some(true));
    }

    #[test]
    fn test_block_yaml_unknown_property() {
        let yaml = r#"
id: act
type: Action
properties: { colour: red }
"#;
        assert!(serde_yaml::from_str::<Block>(yaml).is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("False"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("yes"), None);
    }
}
