//! Structured log handling: the classification script, persisted field labels,
//! title derivation and the plain-text log importer.
//!
//! A classification script is a list of field assignments, one per line. A
//! line starting with `|` continues the assignment above it:
//!
//! ```text
//! # comments start with `#` or `//`
//! level    = json.level | "info"
//! category = pod(json.pod)
//!          | json._host + " " + pod(json._file)
//!          | pod(prefix[3])
//! ```
//!
//! Alternatives (`|`) are tried left to right; the first one whose parts all
//! resolve to non-empty text wins. Parts are `json.<dotted.path>`, `prefix`,
//! `prefix[n]` (space-separated token of the non-JSON prefix), `"literal"`, a
//! function call `pod(..)`, `time(..)`, `lower(..)`, `trim(..)`, `mzone(..)`,
//! or a guard. Guards `present(..)` and `missing(..)` add no text; they fail
//! the alternative unless their argument is set, or unset, respectively.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Local};
use memchr::memchr_iter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::allproxy_core::{
    default_title, fallback_log_title, lookup_path, LogEntry, Message, MessageView, ResponseBody,
};
use crate::allproxy_snapshots::{ImportError, LogFileImporter};
use crate::allproxy_storage::{KeyValueStore, StorageError};

pub const JSON_FIELDS_DIR: &str = "jsonFields";
pub const SCRIPTS_DIR: &str = "scripts";
pub const SCRIPT_FILE_NAME: &str = "jsonLogScript";

pub const DEFAULT_SCRIPT: &str = r#"# Extract date, level, category and message from a JSON log line.
# `prefix` is the text before the JSON object, `json` the object itself.
date     = missing(json.pod) + present(json._file) + time(json.msg_timestamp)
         | missing(json.pod) + present(json._file) + time(json._ts)
         | missing(json.pod) + missing(json._file) + prefix[2]
level    = json.level | "info"
category = pod(json.pod)
         | json._host + " " + pod(json._file)
         | pod(json._file)
         | mzone(prefix[3]) + " " + pod(prefix[4])
         | pod(prefix[3])
message  = json.MESSAGE | json.message | json.msg
"#;

fn script_key() -> String {
    format!("{SCRIPTS_DIR}/{SCRIPT_FILE_NAME}")
}

fn label_key(name: &str) -> String {
    format!("{JSON_FIELDS_DIR}/{name}")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("line {line}: expected `<field> = <expression>`")]
    MissingAssignment { line: usize },
    #[error("line {line}: unknown field `{name}`, expected date, level, category or message")]
    UnknownTarget { line: usize, name: String },
    #[error("line {line}: field `{name}` is assigned twice")]
    DuplicateTarget { line: usize, name: String },
    #[error("line {line}: unknown function `{name}`")]
    UnknownFunction { line: usize, name: String },
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error("`{function}` cannot be applied to {kind}")]
    BadArgument { function: &'static str, kind: &'static str },
    #[error("classification script failed to compile: {0}")]
    NotCompiled(String),
    /// Failure reported by a classifier installed with
    /// [`ClassificationScript::set_classifier`].
    #[error("{0}")]
    Custom(String),
}

/// Maps a log line (non-JSON prefix plus JSON object) to a [`LogEntry`].
pub trait Classifier: Send + Sync {
    fn classify(&self, prefix: &str, json: &Map<String, Value>) -> Result<LogEntry, ClassifyError>;
}

impl<F> Classifier for F
where
    F: Fn(&str, &Map<String, Value>) -> Result<LogEntry, ClassifyError> + Send + Sync,
{
    fn classify(&self, prefix: &str, json: &Map<String, Value>) -> Result<LogEntry, ClassifyError> {
        self(prefix, json)
    }
}

/// Classify one view's message, logging failures and yielding an empty entry.
pub fn classify_message(classifier: &dyn Classifier, message: &Message) -> LogEntry {
    let empty = Map::new();
    let (prefix, json) = match &message.response_body {
        ResponseBody::Structured(map) => (message.path.as_str(), map),
        ResponseBody::Text(text) if message.path.is_empty() => (text.as_str(), &empty),
        ResponseBody::Text(_) => (message.path.as_str(), &empty),
    };
    match classifier.classify(prefix, json) {
        Ok(entry) => entry,
        Err(err) => {
            warn!(%err, sequence_number = message.sequence_number, "Log classification failed");
            LogEntry::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Date,
    Level,
    Category,
    Message,
}

impl Target {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "date" => Some(Self::Date),
            "level" => Some(Self::Level),
            "category" => Some(Self::Category),
            "message" => Some(Self::Message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Pod,
    Time,
    Lower,
    Trim,
    Mzone,
}

impl Function {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "pod" => Some(Self::Pod),
            "time" => Some(Self::Time),
            "lower" => Some(Self::Lower),
            "trim" => Some(Self::Trim),
            "mzone" => Some(Self::Mzone),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Time => "time",
            Self::Lower => "lower",
            Self::Trim => "trim",
            Self::Mzone => "mzone",
        }
    }
}

#[derive(Debug, Clone)]
enum Part {
    Literal(String),
    Json(String),
    Prefix,
    PrefixToken(usize),
    Call(Function, Box<Part>),
    Guard { present: bool, argument: Box<Part> },
}

type Alternative = Vec<Part>;

/// A parsed classification script.
#[derive(Debug, Clone, Default)]
pub struct CompiledScript {
    date: Vec<Alternative>,
    level: Vec<Alternative>,
    category: Vec<Alternative>,
    message: Vec<Alternative>,
}

enum Resolved<'a> {
    Text(String),
    Structured(&'a Value),
}

impl CompiledScript {
    pub fn compile(source: &str) -> Result<Self, ScriptError> {
        let mut script = Self::default();
        let mut assigned: Vec<Target> = Vec::new();

        let mut statements: Vec<(usize, String)> = Vec::new();
        for (idx, raw) in source.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
                continue;
            }
            if trimmed.starts_with('|') {
                if let Some((_, statement)) = statements.last_mut() {
                    statement.push(' ');
                    statement.push_str(trimmed);
                    continue;
                }
            }
            statements.push((idx + 1, trimmed.to_string()));
        }

        for (line, statement) in statements {
            let tokens = lex(&statement, line)?;
            let (name, rest) = match tokens.split_first() {
                Some((Tok::Ident(name), rest)) if matches!(rest.first(), Some(Tok::Eq)) => {
                    (name.clone(), &rest[1..])
                }
                _ => return Err(ScriptError::MissingAssignment { line }),
            };
            let target =
                Target::parse(&name).ok_or_else(|| ScriptError::UnknownTarget { line, name: name.clone() })?;
            if assigned.contains(&target) {
                return Err(ScriptError::DuplicateTarget { line, name });
            }
            assigned.push(target);

            let mut parser = ScriptParser { tokens: rest, pos: 0, line };
            let alternatives = parser.parse_alternatives()?;
            match target {
                Target::Date => script.date = alternatives,
                Target::Level => script.level = alternatives,
                Target::Category => script.category = alternatives,
                Target::Message => script.message = alternatives,
            }
        }

        Ok(script)
    }

    fn eval_field(
        alternatives: &[Alternative],
        prefix_tokens: &[&str],
        prefix: &str,
        json: &Map<String, Value>,
    ) -> Result<String, ClassifyError> {
        'alternatives: for alternative in alternatives {
            let mut out = String::new();
            for part in alternative {
                match eval_part(part, prefix_tokens, prefix, json)? {
                    Some(text) => out.push_str(&text),
                    None => continue 'alternatives,
                }
            }
            return Ok(out);
        }
        Ok(String::new())
    }
}

impl Classifier for CompiledScript {
    fn classify(&self, prefix: &str, json: &Map<String, Value>) -> Result<LogEntry, ClassifyError> {
        let tokens: Vec<&str> = prefix.split(' ').collect();
        Ok(LogEntry {
            date: Self::eval_field(&self.date, &tokens, prefix, json)?,
            level: Self::eval_field(&self.level, &tokens, prefix, json)?,
            category: Self::eval_field(&self.category, &tokens, prefix, json)?,
            message: Self::eval_field(&self.message, &tokens, prefix, json)?,
        })
    }
}

fn eval_part(
    part: &Part,
    prefix_tokens: &[&str],
    prefix: &str,
    json: &Map<String, Value>,
) -> Result<Option<String>, ClassifyError> {
    let text = match resolve(part, prefix_tokens, prefix, json)? {
        Some(Resolved::Text(text)) => text,
        Some(Resolved::Structured(value)) => value.to_string(),
        None => return Ok(None),
    };
    // Literals may be whitespace (`" "`) and guards add nothing; everything
    // else must carry content.
    if matches!(part, Part::Literal(_) | Part::Guard { .. }) {
        return Ok(Some(text));
    }
    Ok((!text.is_empty()).then_some(text))
}

fn resolve<'a>(
    part: &Part,
    prefix_tokens: &[&str],
    prefix: &str,
    json: &'a Map<String, Value>,
) -> Result<Option<Resolved<'a>>, ClassifyError> {
    Ok(match part {
        Part::Literal(text) => Some(Resolved::Text(text.clone())),
        Part::Prefix => Some(Resolved::Text(prefix.trim().to_string())),
        Part::PrefixToken(idx) => prefix_tokens.get(*idx).map(|token| Resolved::Text(token.to_string())),
        Part::Json(path) => match lookup_path(json, path) {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(Resolved::Text(text.clone())),
            Some(Value::Bool(false)) => None,
            Some(value @ (Value::Object(_) | Value::Array(_))) => Some(Resolved::Structured(value)),
            Some(other) => Some(Resolved::Text(other.to_string())),
        },
        Part::Guard { present, argument } => {
            let set = match resolve(argument, prefix_tokens, prefix, json)? {
                Some(Resolved::Text(text)) => !text.is_empty(),
                Some(Resolved::Structured(_)) => true,
                None => false,
            };
            (set == *present).then(|| Resolved::Text(String::new()))
        }
        Part::Call(function, argument) => {
            let argument = match resolve(argument, prefix_tokens, prefix, json)? {
                Some(Resolved::Text(text)) => text,
                Some(Resolved::Structured(value)) => {
                    let kind = if value.is_array() { "an array" } else { "an object" };
                    return Err(ClassifyError::BadArgument { function: function.name(), kind });
                }
                None => return Ok(None),
            };
            apply_function(*function, &argument).map(Resolved::Text)
        }
    })
}

fn apply_function(function: Function, argument: &str) -> Option<String> {
    match function {
        Function::Pod => Some(parse_pod(argument)),
        Function::Time => format_time(argument),
        Function::Lower => Some(argument.to_lowercase()),
        Function::Trim => Some(argument.trim().to_string()),
        Function::Mzone => argument.starts_with("mzone").then(|| argument.to_string()),
    }
}

/// Drop the trailing replica suffix of a pod or file name (`web-7f9c` -> `web`).
pub fn parse_pod(pod: &str) -> String {
    match pod.rsplit_once('-') {
        Some((head, _)) => head.to_string(),
        None => pod.to_string(),
    }
}

/// Local `HH:MM:SS` for epoch milliseconds or an RFC 3339 timestamp.
fn format_time(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let parsed: Option<DateTime<Local>> = match trimmed.parse::<f64>() {
        Ok(millis) if millis.is_finite() => {
            DateTime::from_timestamp_millis(millis as i64).map(|date| date.with_timezone(&Local))
        }
        _ => DateTime::parse_from_rfc3339(trimmed).ok().map(|date| date.with_timezone(&Local)),
    };
    parsed.map(|date| date.format("%H:%M:%S").to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Str(String),
    Eq,
    Pipe,
    Plus,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn lex(input: &str, line: usize) -> Result<Vec<Tok>, ScriptError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        let token = match ch {
            c if c.is_whitespace() => continue,
            '=' => Tok::Eq,
            '|' => Tok::Pipe,
            '+' => Tok::Plus,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            '"' => {
                let mut literal = String::new();
                let mut closed = false;
                while let Some(next) = chars.next() {
                    match next {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                literal.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => literal.push(other),
                    }
                }
                if !closed {
                    return Err(ScriptError::Syntax {
                        line,
                        message: "unterminated string literal".to_string(),
                    });
                }
                Tok::Str(literal)
            }
            c if is_ident_char(c) => {
                let mut ident = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !is_ident_char(next) {
                        break;
                    }
                    ident.push(next);
                    chars.next();
                }
                Tok::Ident(ident)
            }
            other => {
                return Err(ScriptError::Syntax { line, message: format!("unexpected `{other}`") })
            }
        };
        tokens.push(token);
    }
    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '$' | '@')
}

struct ScriptParser<'a> {
    tokens: &'a [Tok],
    pos: usize,
    line: usize,
}

impl<'a> ScriptParser<'a> {
    fn current(&self) -> Option<&'a Tok> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a Tok> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Tok) -> Result<(), ScriptError> {
        match self.advance() {
            Some(token) if *token == expected => Ok(()),
            Some(token) => Err(self.syntax(format!("expected {expected:?}, found {token:?}"))),
            None => Err(self.syntax(format!("expected {expected:?} at end of line"))),
        }
    }

    fn syntax(&self, message: String) -> ScriptError {
        ScriptError::Syntax { line: self.line, message }
    }

    fn parse_alternatives(&mut self) -> Result<Vec<Alternative>, ScriptError> {
        let mut alternatives = vec![self.parse_alternative()?];
        while matches!(self.current(), Some(Tok::Pipe)) {
            self.advance();
            alternatives.push(self.parse_alternative()?);
        }
        if let Some(token) = self.current() {
            return Err(self.syntax(format!("unexpected {token:?}")));
        }
        Ok(alternatives)
    }

    fn parse_alternative(&mut self) -> Result<Alternative, ScriptError> {
        let mut parts = vec![self.parse_part()?];
        while matches!(self.current(), Some(Tok::Plus)) {
            self.advance();
            parts.push(self.parse_part()?);
        }
        Ok(parts)
    }

    fn parse_part(&mut self) -> Result<Part, ScriptError> {
        let line = self.line;
        match self.advance().cloned() {
            Some(Tok::Str(text)) => Ok(Part::Literal(text)),
            Some(Tok::Ident(name)) => {
                if let Some(path) = name.strip_prefix("json.") {
                    if path.is_empty() {
                        return Err(self.syntax("empty json path".to_string()));
                    }
                    return Ok(Part::Json(path.to_string()));
                }
                if name == "prefix" {
                    if !matches!(self.current(), Some(Tok::LBracket)) {
                        return Ok(Part::Prefix);
                    }
                    self.advance();
                    let index = match self.advance() {
                        Some(Tok::Ident(digits)) => digits.parse::<usize>().ok(),
                        _ => None,
                    };
                    let index =
                        index.ok_or_else(|| self.syntax("expected a token index".to_string()))?;
                    self.expect(Tok::RBracket)?;
                    return Ok(Part::PrefixToken(index));
                }
                let is_call = matches!(self.current(), Some(Tok::LParen));
                if is_call && matches!(name.as_str(), "present" | "missing") {
                    self.advance();
                    let argument = Box::new(self.parse_part()?);
                    self.expect(Tok::RParen)?;
                    return Ok(Part::Guard { present: name == "present", argument });
                }
                if is_call {
                    let function = Function::parse(&name)
                        .ok_or(ScriptError::UnknownFunction { line, name: name.clone() })?;
                    self.advance();
                    let argument = self.parse_part()?;
                    self.expect(Tok::RParen)?;
                    return Ok(Part::Call(function, Box::new(argument)));
                }
                Err(self.syntax(format!("unexpected `{name}`")))
            }
            Some(token) => Err(self.syntax(format!("unexpected {token:?}"))),
            None => Err(self.syntax("missing expression".to_string())),
        }
    }
}

struct NotCompiled(String);

impl Classifier for NotCompiled {
    fn classify(&self, _prefix: &str, _json: &Map<String, Value>) -> Result<LogEntry, ClassifyError> {
        Err(ClassifyError::NotCompiled(self.0.clone()))
    }
}

/// Editable script source plus the classifier compiled from it.
pub struct ClassificationScript {
    source: String,
    classifier: Arc<dyn Classifier>,
}

impl std::fmt::Debug for ClassificationScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassificationScript").field("source", &self.source).finish_non_exhaustive()
    }
}

impl Default for ClassificationScript {
    fn default() -> Self {
        let mut script =
            Self { source: DEFAULT_SCRIPT.to_string(), classifier: Arc::new(CompiledScript::default()) };
        // The built-in script always compiles.
        let _ = script.update_script_func();
        script
    }
}

impl ClassificationScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a persisted script, if any, and compile it.
    pub fn init(&mut self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        if let Some(source) = store.get(&script_key())? {
            self.source = source;
        }
        if let Err(err) = self.update_script_func() {
            warn!(%err, "Persisted classification script does not compile");
        }
        Ok(())
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Replace the source text. Takes effect after [`Self::update_script_func`].
    pub fn set_script(&mut self, source: impl Into<String>) {
        self.source = source.into();
    }

    pub fn save_script(&self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        store.set(&script_key(), &self.source)
    }

    /// Compile the current source. On failure every classification yields an
    /// empty entry until the script is fixed.
    pub fn update_script_func(&mut self) -> Result<(), ScriptError> {
        match CompiledScript::compile(&self.source) {
            Ok(compiled) => {
                self.classifier = Arc::new(compiled);
                Ok(())
            }
            Err(err) => {
                warn!(%err, "Classification script failed to compile");
                self.classifier = Arc::new(NotCompiled(err.to_string()));
                Err(err)
            }
        }
    }

    pub fn reset_to_default(&mut self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        self.source = DEFAULT_SCRIPT.to_string();
        let _ = self.update_script_func();
        store.delete(&script_key())
    }

    /// Install a host-provided classifier in place of the compiled script.
    pub fn set_classifier(&mut self, classifier: Arc<dyn Classifier>) {
        self.classifier = classifier;
    }

    pub fn classifier(&self) -> Arc<dyn Classifier> {
        Arc::clone(&self.classifier)
    }

    pub fn classify(&self, message: &Message) -> LogEntry {
        classify_message(self.classifier.as_ref(), message)
    }
}

/// A persisted field label (`jsonFields/<name>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLabel {
    name: String,
    valid: bool,
}

impl FieldLabel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), valid: true }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_valid_name(&self) -> bool {
        self.valid
    }
}

/// Dotted field names: every segment non-empty with no whitespace, `/` or
/// control characters.
pub fn is_valid_field_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            !segment.is_empty()
                && !segment.chars().any(|c| c.is_whitespace() || c.is_control() || c == '/')
        })
}

#[derive(Debug, Clone, Default)]
pub struct LabelStore {
    labels: Vec<FieldLabel>,
}

impl LabelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        self.labels = store.list(JSON_FIELDS_DIR)?.into_iter().map(FieldLabel::new).collect();
        debug!(labels = self.labels.len(), "Loaded field labels");
        Ok(())
    }

    pub fn labels(&self) -> &[FieldLabel] {
        &self.labels
    }

    /// Names of the labels that are set and valid.
    pub fn names(&self) -> Vec<String> {
        self.labels
            .iter()
            .filter(|label| label.valid && !label.name.is_empty())
            .map(|label| label.name.clone())
            .collect()
    }

    /// Insert a blank label at the front.
    pub fn extend(&mut self) {
        self.labels.insert(0, FieldLabel::new(""));
    }

    pub fn delete_entry(
        &mut self,
        store: &dyn KeyValueStore,
        index: usize,
    ) -> Result<(), StorageError> {
        if index >= self.labels.len() {
            return Ok(());
        }
        let label = self.labels.remove(index);
        if label.valid && !label.name.is_empty() {
            store.delete(&label_key(&label.name))?;
        }
        Ok(())
    }

    /// Rename the label at `index`. The old entry is removed; the new name is
    /// persisted only when it validates, otherwise the label is marked invalid.
    pub fn set_name_and_validate(
        &mut self,
        store: &dyn KeyValueStore,
        index: usize,
        name: &str,
    ) -> Result<bool, StorageError> {
        let Some(label) = self.labels.get_mut(index) else {
            return Ok(false);
        };
        let old_name = std::mem::replace(&mut label.name, name.to_string());
        if label.valid && !old_name.is_empty() {
            store.delete(&label_key(&old_name))?;
        }

        label.valid = true;
        if !name.is_empty() {
            if is_valid_field_name(name) {
                store.set(&label_key(name), name)?;
            } else {
                label.valid = false;
            }
        }
        Ok(label.valid)
    }
}

/// Field label state of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldLabelConfig {
    pub name: String,
    pub occurrence_count: usize,
    pub selected: bool,
}

/// Collect field names of structured `log:` bodies, most frequent first.
pub fn derive_field_labels<'a, I>(views: I, persisted: &[String]) -> Vec<FieldLabelConfig>
where
    I: IntoIterator<Item = &'a MessageView>,
{
    fn collect(map: &Map<String, Value>, parent: Option<&str>, counts: &mut HashMap<String, usize>) {
        for (key, value) in map {
            let name = match parent {
                Some(parent) => format!("{parent}.{key}"),
                None => key.clone(),
            };
            if let Value::Object(nested) = value {
                collect(nested, Some(&name), counts);
            }
            *counts.entry(name).or_default() += 1;
        }
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for view in views {
        if !view.protocol().is_log() {
            continue;
        }
        if let Some(map) = view.message().response_body.as_structured() {
            collect(map, None, &mut counts);
        }
    }

    let mut labels: Vec<FieldLabelConfig> = counts
        .into_iter()
        .map(|(name, occurrence_count)| {
            let selected = persisted.iter().any(|label| *label == name);
            FieldLabelConfig { name, occurrence_count, selected }
        })
        .collect();
    labels.sort_by(|a, b| b.occurrence_count.cmp(&a.occurrence_count).then_with(|| a.name.cmp(&b.name)));
    labels
}

/// Display title of a message given the selected field labels, in label order.
pub fn make_request_title(message: &Message, labels: &[FieldLabelConfig]) -> String {
    let Some(map) = message.response_body.as_structured().filter(|_| message.protocol.is_log()) else {
        return default_title(message);
    };

    let mut title = String::new();
    for label in labels.iter().filter(|label| label.selected) {
        let Some(value) = lookup_path(map, &label.name) else {
            continue;
        };
        let rendered = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        if !title.is_empty() {
            title.push(' ');
        }
        title.push_str(&label.name);
        title.push('=');
        title.push_str(&rendered);
    }

    if title.is_empty() {
        fallback_log_title(&message.path, &message.response_body)
    } else {
        title
    }
}

/// Turns plain text, one log line per line, into `log:` messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineLogImporter;

impl LineLogImporter {
    pub fn parse_line(sequence_number: u64, line: &str) -> Message {
        for start in memchr_iter(b'{', line.as_bytes()) {
            let mut stream = serde_json::Deserializer::from_str(&line[start..]).into_iter::<Value>();
            if let Some(Ok(Value::Object(map))) = stream.next() {
                let prefix = line[..start].trim();
                return Message::log_line(sequence_number, prefix, ResponseBody::Structured(map));
            }
        }
        Message::log_line(sequence_number, "", ResponseBody::Text(line.trim_end().to_string()))
    }
}

impl LogFileImporter for LineLogImporter {
    fn import(&self, file_name: &str, text: &str) -> Result<Vec<Message>, ImportError> {
        let messages: Vec<Message> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| Self::parse_line(idx as u64, line))
            .collect();
        if messages.is_empty() {
            return Err(ImportError::Empty { file_name: file_name.to_string() });
        }
        debug!(file_name, lines = messages.len(), "Parsed log file");
        Ok(messages)
    }
}
