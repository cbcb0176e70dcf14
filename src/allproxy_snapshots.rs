//! Snapshot store: the Active capture plus frozen, named copies of it.
//!
//! Importing is split in two. [`decode_snapshot`] and [`prepare_import`] do the
//! expensive work without touching the store; [`SnapshotStore::insert_import`]
//! only moves the prepared views in.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::allproxy_core::{
    FilterRule, LogEntry, Message, MessageView, ResponseBody, SequenceNumber,
};
use crate::allproxy_logs::{
    classify_message, derive_field_labels, make_request_title, Classifier, FieldLabelConfig,
};
use crate::allproxy_queue::CaptureQueue;
use crate::colors::ColorAssignor;

pub const ACTIVE_SNAPSHOT_NAME: &str = "Active";
pub const SNAPSHOT_EXTENSION: &str = ".allproxy";
pub const DEFAULT_DISPLAY_NAME: &str = "SNAPSHOT";
pub const IMPORT_LIMIT: usize = 10_000;

/// Body key holding the original non-JSON prefix of a log line.
pub const PREFIX_FIELD: &str = "PREFIX";

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("{file_name} contains no messages")]
    Empty { file_name: String },
    #[error("{file_name} is not valid UTF-8")]
    Utf8 { file_name: String },
    #[error("invalid snapshot json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("the {ACTIVE_SNAPSHOT_NAME} snapshot cannot be deleted")]
    ActiveSnapshot,
    #[error("unknown snapshot `{name}`")]
    NotFound { name: String },
    #[error("snapshot `{name}` has no field `{field}`")]
    UnknownField { name: String, field: String },
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

/// Decodes raw log text into `log:` messages.
pub trait LogFileImporter: Send + Sync {
    fn import(&self, file_name: &str, text: &str) -> Result<Vec<Message>, ImportError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Vertical,
    Horizontal,
}

/// Per-snapshot presentation state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewState {
    pub selected_sequence_number: Option<SequenceNumber>,
    pub scroll_offset: usize,
    pub highlight_sequence_number: Option<SequenceNumber>,
    pub field_labels: Vec<FieldLabelConfig>,
    pub layout: Layout,
    pub source_file_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    name: String,
    messages: VecDeque<MessageView>,
    view: ViewState,
}

impl Snapshot {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn messages(&self) -> &VecDeque<MessageView> {
        &self.messages
    }

    pub fn view_state(&self) -> &ViewState {
        &self.view
    }
}

/// Views decoded, classified and titled, ready to become a snapshot.
#[derive(Debug)]
pub struct PreparedImport {
    pub file_name: String,
    pub views: VecDeque<MessageView>,
    pub field_labels: Vec<FieldLabelConfig>,
}

#[derive(Debug)]
pub struct SnapshotStore {
    active: CaptureQueue,
    active_view: ViewState,
    frozen: Vec<Snapshot>,
    selected: String,
    next_disambiguator: u64,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(CaptureQueue::default())
    }
}

impl SnapshotStore {
    pub fn new(active: CaptureQueue) -> Self {
        Self {
            active,
            active_view: ViewState::default(),
            frozen: Vec::new(),
            selected: ACTIVE_SNAPSHOT_NAME.to_string(),
            next_disambiguator: 1,
        }
    }

    pub fn active(&self) -> &CaptureQueue {
        &self.active
    }

    pub fn active_mut(&mut self) -> &mut CaptureQueue {
        &mut self.active
    }

    /// Append a live view. Log views count towards Active's field labels and
    /// are titled with them; labels seen for the first time start selected
    /// when they are persisted.
    pub fn append_active(&mut self, mut view: MessageView, persisted_labels: &[String]) -> bool {
        if self.active.is_stopped() {
            return false;
        }
        if view.protocol().is_log() {
            let labels = &mut self.active_view.field_labels;
            for found in derive_field_labels(std::iter::once(&view), persisted_labels) {
                match labels.iter_mut().find(|label| label.name == found.name) {
                    Some(label) => label.occurrence_count += found.occurrence_count,
                    None => labels.push(found),
                }
            }
            labels.sort_by(|a, b| {
                b.occurrence_count.cmp(&a.occurrence_count).then_with(|| a.name.cmp(&b.name))
            });
            view.set_title(make_request_title(view.message(), labels));
        }
        self.active.append(view)
    }

    /// Empty the live queue and forget its field labels.
    pub fn clear_active(&mut self) {
        self.active.clear();
        self.active_view.field_labels.clear();
    }

    /// Select `added` and deselect `removed` field labels in every snapshot,
    /// then retitle the log views. Returns the snapshots whose titles changed.
    pub fn apply_label_change(&mut self, added: &[String], removed: &[String]) -> Vec<String> {
        let mut changed = Vec::new();
        let views = std::iter::once((ACTIVE_SNAPSHOT_NAME, &mut self.active_view)).chain(
            self.frozen.iter_mut().map(|snapshot| (snapshot.name.as_str(), &mut snapshot.view)),
        );
        for (name, view) in views {
            let mut touched = false;
            for label in &mut view.field_labels {
                let selected = if added.contains(&label.name) {
                    true
                } else if removed.contains(&label.name) {
                    false
                } else {
                    continue;
                };
                touched |= label.selected != selected;
                label.selected = selected;
            }
            if touched {
                changed.push(name.to_string());
            }
        }

        for name in &changed {
            if name == ACTIVE_SNAPSHOT_NAME {
                retitle(self.active.messages_mut(), &self.active_view.field_labels);
            } else if let Some(snapshot) =
                self.frozen.iter_mut().find(|snapshot| snapshot.name == *name)
            {
                retitle(snapshot.messages.iter_mut(), &snapshot.view.field_labels);
            }
        }
        debug!(
            added = added.len(),
            removed = removed.len(),
            snapshots = changed.len(),
            "Applied label change"
        );
        changed
    }

    fn next_name(&mut self, now: DateTime<Local>) -> String {
        let name = format!("Snapshot {} #{}", now.format("%H:%M.%S"), self.next_disambiguator);
        self.next_disambiguator += 1;
        name
    }

    /// Freeze the Active capture into a new, selected snapshot.
    pub fn take_snapshot(&mut self, persisted_labels: &[String]) -> String {
        self.take_snapshot_at(Local::now(), persisted_labels)
    }

    pub fn take_snapshot_at(&mut self, now: DateTime<Local>, persisted_labels: &[String]) -> String {
        let name = self.next_name(now);
        let mut messages = self.active.take_messages();
        let mut field_labels = derive_field_labels(messages.iter(), persisted_labels);
        let active_labels = std::mem::take(&mut self.active_view.field_labels);
        for label in &mut field_labels {
            if let Some(live) = active_labels.iter().find(|live| live.name == label.name) {
                label.selected = live.selected;
            }
        }
        retitle(messages.iter_mut(), &field_labels);

        let view = ViewState {
            selected_sequence_number: self.active_view.selected_sequence_number.take(),
            scroll_offset: std::mem::take(&mut self.active_view.scroll_offset),
            highlight_sequence_number: self.active_view.highlight_sequence_number.take(),
            field_labels,
            layout: self.active_view.layout,
            source_file_name: None,
        };
        info!(snapshot = %name, messages = messages.len(), "Took snapshot");
        self.frozen.push(Snapshot { name: name.clone(), messages, view });
        self.selected = name.clone();
        name
    }

    /// Insert a prepared import as a new, selected snapshot.
    pub fn insert_import(&mut self, prepared: PreparedImport) -> String {
        self.insert_import_at(Local::now(), prepared)
    }

    pub fn insert_import_at(&mut self, now: DateTime<Local>, prepared: PreparedImport) -> String {
        let name = self.next_name(now);
        let view = ViewState {
            field_labels: prepared.field_labels,
            layout: self.active_view.layout,
            source_file_name: Some(prepared.file_name),
            ..ViewState::default()
        };
        info!(snapshot = %name, messages = prepared.views.len(), "Imported snapshot");
        self.frozen.push(Snapshot { name: name.clone(), messages: prepared.views, view });
        self.selected = name.clone();
        name
    }

    pub fn delete_snapshot(&mut self, name: &str) -> Result<(), SnapshotError> {
        if name == ACTIVE_SNAPSHOT_NAME {
            return Err(SnapshotError::ActiveSnapshot);
        }
        let idx = self.position(name)?;
        self.frozen.remove(idx);
        if self.selected == name {
            self.selected = ACTIVE_SNAPSHOT_NAME.to_string();
        }
        Ok(())
    }

    pub fn delete_all(&mut self) {
        self.frozen.clear();
        self.selected = ACTIVE_SNAPSHOT_NAME.to_string();
    }

    /// Snapshot names, Active first, then in creation order.
    pub fn names(&self) -> Vec<&str> {
        std::iter::once(ACTIVE_SNAPSHOT_NAME)
            .chain(self.frozen.iter().map(|snapshot| snapshot.name.as_str()))
            .collect()
    }

    pub fn selected_name(&self) -> &str {
        &self.selected
    }

    pub fn select(&mut self, name: &str) -> Result<(), SnapshotError> {
        if name != ACTIVE_SNAPSHOT_NAME {
            self.position(name)?;
        }
        self.selected = name.to_string();
        Ok(())
    }

    pub fn snapshot(&self, name: &str) -> Option<&Snapshot> {
        self.frozen.iter().find(|snapshot| snapshot.name == name)
    }

    pub fn messages(&self, name: &str) -> Option<&VecDeque<MessageView>> {
        if name == ACTIVE_SNAPSHOT_NAME {
            return Some(self.active.messages());
        }
        self.snapshot(name).map(Snapshot::messages)
    }

    pub fn view_state(&self, name: &str) -> Option<&ViewState> {
        if name == ACTIVE_SNAPSHOT_NAME {
            return Some(&self.active_view);
        }
        self.snapshot(name).map(Snapshot::view_state)
    }

    pub fn view_state_mut(&mut self, name: &str) -> Option<&mut ViewState> {
        if name == ACTIVE_SNAPSHOT_NAME {
            return Some(&mut self.active_view);
        }
        self.frozen.iter_mut().find(|snapshot| snapshot.name == name).map(|snapshot| &mut snapshot.view)
    }

    /// Source file stem of an imported snapshot, else `SNAPSHOT`.
    pub fn display_name(&self, name: &str) -> String {
        self.view_state(name)
            .and_then(|view| view.source_file_name.as_deref())
            .map(display_name_for_file)
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string())
    }

    pub fn len(&self, name: &str) -> usize {
        self.messages(name).map(VecDeque::len).unwrap_or(0)
    }

    /// Number of snapshots including Active.
    pub fn count(&self) -> usize {
        self.frozen.len() + 1
    }

    /// Flip a field label and re-derive every log title of the snapshot.
    pub fn toggle_field_label(&mut self, name: &str, field: &str) -> Result<bool, SnapshotError> {
        let (view, messages) = if name == ACTIVE_SNAPSHOT_NAME {
            (&mut self.active_view, self.active.messages_mut().collect::<Vec<_>>())
        } else {
            let snapshot = self
                .frozen
                .iter_mut()
                .find(|snapshot| snapshot.name == name)
                .ok_or_else(|| SnapshotError::NotFound { name: name.to_string() })?;
            (&mut snapshot.view, snapshot.messages.iter_mut().collect::<Vec<_>>())
        };

        let label = view
            .field_labels
            .iter_mut()
            .find(|label| label.name == field)
            .ok_or_else(|| SnapshotError::UnknownField {
                name: name.to_string(),
                field: field.to_string(),
            })?;
        label.selected = !label.selected;
        let selected = label.selected;

        retitle(messages.into_iter(), &view.field_labels);
        debug!(snapshot = name, field, selected, "Toggled field label");
        Ok(selected)
    }

    /// Serialize a snapshot for `<name>.allproxy`.
    pub fn export_snapshot(
        &self,
        name: &str,
        filter: Option<&FilterRule>,
    ) -> Result<Vec<u8>, SnapshotError> {
        let views = self
            .messages(name)
            .ok_or_else(|| SnapshotError::NotFound { name: name.to_string() })?;
        export_views(views, filter)
    }

    fn position(&self, name: &str) -> Result<usize, SnapshotError> {
        self.frozen
            .iter()
            .position(|snapshot| snapshot.name == name)
            .ok_or_else(|| SnapshotError::NotFound { name: name.to_string() })
    }
}

fn retitle<'a>(views: impl Iterator<Item = &'a mut MessageView>, labels: &[FieldLabelConfig]) {
    for view in views {
        if view.protocol().is_log() {
            let title = make_request_title(view.message(), labels);
            view.set_title(title);
        }
    }
}

pub fn display_name_for_file(file_name: &str) -> String {
    let base = Path::new(file_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    base.strip_suffix(SNAPSHOT_EXTENSION).map(str::to_string).unwrap_or(base)
}

/// Log-only snapshots export as log lines, everything else as a JSON array.
pub fn export_views(
    views: &VecDeque<MessageView>,
    filter: Option<&FilterRule>,
) -> Result<Vec<u8>, SnapshotError> {
    let all_log = !views.is_empty() && views.iter().all(|view| view.protocol().is_log());
    if !all_log {
        let messages: Vec<&Message> = views.iter().map(MessageView::message).collect();
        return serde_json::to_vec_pretty(&messages)
            .map_err(|err| SnapshotError::Encode(err.to_string()));
    }

    let mut out = String::new();
    for view in views {
        if filter.is_some_and(|rule| !rule.matches(view)) {
            continue;
        }
        out.push_str(&export_log_line(view.message())?);
        out.push('\n');
    }
    Ok(out.into_bytes())
}

fn export_log_line(message: &Message) -> Result<String, SnapshotError> {
    let (prefix, body) = match &message.response_body {
        ResponseBody::Structured(map) => {
            let mut body = map.clone();
            let prefix = match body.remove(PREFIX_FIELD) {
                Some(Value::String(prefix)) => prefix,
                Some(other) => {
                    body.insert(PREFIX_FIELD.to_string(), other);
                    message.path.clone()
                }
                None => message.path.clone(),
            };
            let body =
                serde_json::to_string(&body).map_err(|err| SnapshotError::Encode(err.to_string()))?;
            (prefix, body)
        }
        ResponseBody::Text(text) => (message.path.clone(), text.clone()),
    };
    if prefix.is_empty() {
        Ok(body)
    } else {
        Ok(format!("{prefix} {body}"))
    }
}

/// Decode snapshot bytes: a JSON array of messages, or log text.
///
/// An empty array is an empty snapshot. A JSON array of anything other than
/// messages is rejected; any other text, a lone JSON object included, goes to
/// the log importer.
pub fn decode_snapshot(
    bytes: &[u8],
    file_name: &str,
    importer: &dyn LogFileImporter,
) -> Result<Vec<Message>, ImportError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ImportError::Utf8 { file_name: file_name.to_string() })?;
    match serde_json::from_str::<Vec<Message>>(text) {
        Ok(messages) => Ok(messages),
        Err(err) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(_)) => Err(ImportError::Json(err)),
            _ => importer.import(file_name, text),
        },
    }
}

/// Cap, classify, order and title decoded messages.
///
/// At most [`IMPORT_LIMIT`] records are kept (the newest). When the first kept
/// record is a log line the records are stably sorted by classified date and
/// renumbered `0..N`.
pub fn prepare_import(
    mut messages: Vec<Message>,
    file_name: &str,
    classifier: &dyn Classifier,
    colors: &ColorAssignor,
    persisted_labels: &[String],
) -> PreparedImport {
    if messages.len() > IMPORT_LIMIT {
        let dropped = messages.len() - IMPORT_LIMIT;
        messages.drain(..dropped);
        info!(file_name, dropped, kept = IMPORT_LIMIT, "Truncated import");
    }

    let mut classified: Vec<(Message, Option<LogEntry>)> = messages
        .into_iter()
        .map(|message| {
            let entry = message.protocol.is_log().then(|| classify_message(classifier, &message));
            (message, entry)
        })
        .collect();

    if classified.first().is_some_and(|(message, _)| message.protocol.is_log()) {
        classified.sort_by(|(_, left), (_, right)| {
            let left = left.as_ref().map(|entry| entry.date.as_str()).unwrap_or("");
            let right = right.as_ref().map(|entry| entry.date.as_str()).unwrap_or("");
            left.cmp(right)
        });
        for (idx, (message, _)) in classified.iter_mut().enumerate() {
            message.sequence_number = idx as SequenceNumber;
        }
    }

    let mut views: VecDeque<MessageView> = classified
        .into_iter()
        .map(|(message, entry)| {
            let color = colors.color_of(&message);
            let mut view = MessageView::new(Arc::new(message), color);
            if let Some(entry) = entry {
                view.set_log_entry(entry);
            }
            view
        })
        .collect();

    let field_labels = derive_field_labels(views.iter(), persisted_labels);
    retitle(views.iter_mut(), &field_labels);
    PreparedImport { file_name: file_name.to_string(), views, field_labels }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allproxy_core::Protocol;
    use crate::allproxy_logs::{ClassificationScript, LineLogImporter};
    use chrono::TimeZone;
    use rstest::{fixture, rstest};
    use serde_json::json;

    fn http_view(seq: u64, path: &str) -> MessageView {
        let message = Message::new(seq, Protocol::Http).with_method("GET").with_path(path);
        MessageView::new(Arc::new(message), "green")
    }

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).single().expect("valid time")
    }

    #[fixture]
    fn store_with_five() -> SnapshotStore {
        let mut store = SnapshotStore::new(CaptureQueue::new(100));
        for seq in 0..5 {
            store.active_mut().append(http_view(seq, &format!("/item/{seq}")));
        }
        store
    }

    fn prepare(bytes: &[u8], file_name: &str) -> Result<PreparedImport, ImportError> {
        let script = ClassificationScript::new();
        let messages = decode_snapshot(bytes, file_name, &LineLogImporter)?;
        Ok(prepare_import(messages, file_name, script.classifier().as_ref(), &ColorAssignor::new(), &[]))
    }

    #[rstest]
    fn snapshot_keeps_messages_after_active_is_cleared(mut store_with_five: SnapshotStore) {
        store_with_five.view_state_mut(ACTIVE_SNAPSHOT_NAME).expect("active").selected_sequence_number =
            Some(3);
        let name = store_with_five.take_snapshot_at(noon(), &[]);
        assert_eq!(name, "Snapshot 12:30.15 #1");
        assert_eq!(store_with_five.selected_name(), name);
        assert_eq!(store_with_five.len(ACTIVE_SNAPSHOT_NAME), 0);

        store_with_five.active_mut().clear();
        store_with_five.active_mut().append(http_view(9, "/later"));
        assert_eq!(store_with_five.len(&name), 5);
        assert_eq!(
            store_with_five.view_state(&name).expect("view").selected_sequence_number,
            Some(3)
        );
        assert_eq!(
            store_with_five.view_state(ACTIVE_SNAPSHOT_NAME).expect("view").selected_sequence_number,
            None
        );
    }

    #[rstest]
    fn snapshot_names_are_unique(mut store_with_five: SnapshotStore) {
        let first = store_with_five.take_snapshot_at(noon(), &[]);
        let second = store_with_five.take_snapshot_at(noon(), &[]);
        assert_ne!(first, second);
        assert_eq!(store_with_five.names(), vec![ACTIVE_SNAPSHOT_NAME, first.as_str(), second.as_str()]);
        assert_eq!(store_with_five.count(), 3);
    }

    #[rstest]
    fn deleting_the_selected_snapshot_selects_active(mut store_with_five: SnapshotStore) {
        let first = store_with_five.take_snapshot_at(noon(), &[]);
        let second = store_with_five.take_snapshot_at(noon(), &[]);
        store_with_five.select(&first).expect("select");
        store_with_five.delete_snapshot(&second).expect("delete second");
        assert_eq!(store_with_five.selected_name(), first);
        store_with_five.delete_snapshot(&first).expect("delete first");
        assert_eq!(store_with_five.selected_name(), ACTIVE_SNAPSHOT_NAME);
        assert_eq!(
            store_with_five.delete_snapshot(&first),
            Err(SnapshotError::NotFound { name: first.clone() })
        );
    }

    #[rstest]
    fn active_cannot_be_deleted(mut store_with_five: SnapshotStore) {
        assert_eq!(
            store_with_five.delete_snapshot(ACTIVE_SNAPSHOT_NAME),
            Err(SnapshotError::ActiveSnapshot)
        );
        store_with_five.take_snapshot_at(noon(), &[]);
        store_with_five.take_snapshot_at(noon(), &[]);
        store_with_five.delete_all();
        assert_eq!(store_with_five.names(), vec![ACTIVE_SNAPSHOT_NAME]);
        assert_eq!(store_with_five.selected_name(), ACTIVE_SNAPSHOT_NAME);
    }

    #[rstest]
    fn json_export_round_trips(mut store_with_five: SnapshotStore) {
        let name = store_with_five.take_snapshot_at(noon(), &[]);
        let bytes = store_with_five.export_snapshot(&name, None).expect("export");
        assert!(std::str::from_utf8(&bytes).expect("utf8").starts_with("[\n"));

        let prepared = prepare(&bytes, "capture.allproxy").expect("import");
        let imported = store_with_five.insert_import_at(noon(), prepared);
        let original: Vec<&Message> =
            store_with_five.messages(&name).expect("original").iter().map(MessageView::message).collect();
        let restored: Vec<&Message> = store_with_five
            .messages(&imported)
            .expect("imported")
            .iter()
            .map(MessageView::message)
            .collect();
        assert_eq!(original, restored);
        assert_eq!(store_with_five.display_name(&imported), "capture");
        assert_eq!(store_with_five.display_name(&name), DEFAULT_DISPLAY_NAME);
    }

    #[test]
    fn log_import_is_sorted_by_date_and_renumbered() {
        let text = "a b 10:00:03 web-1 {\"msg\":\"third\"}\n\
                    a b 10:00:01 web-1 {\"msg\":\"first\"}\n\
                    a b 10:00:02 web-1 {\"msg\":\"second\"}\n";
        let prepared = prepare(text.as_bytes(), "app.log").expect("import");
        let seqs: Vec<u64> = prepared.views.iter().map(MessageView::sequence_number).collect();
        let messages: Vec<&str> = prepared
            .views
            .iter()
            .map(|view| view.log_entry().expect("classified").message.as_str())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert_eq!(prepared.views[0].color(), "#007bff");
    }

    #[test]
    fn oversized_imports_keep_the_newest_records() {
        let messages: Vec<Message> =
            (0..(IMPORT_LIMIT as u64 + 5)).map(|seq| Message::new(seq, Protocol::Tcp)).collect();
        let script = ClassificationScript::new();
        let prepared = prepare_import(
            messages,
            "big.allproxy",
            script.classifier().as_ref(),
            &ColorAssignor::new(),
            &[],
        );
        assert_eq!(prepared.views.len(), IMPORT_LIMIT);
        assert_eq!(prepared.views[0].sequence_number(), 5);
    }

    #[test]
    fn oversized_log_imports_are_capped_before_sorting() {
        // The five oldest records carry the earliest dates; the rest arrive newest first.
        let total = IMPORT_LIMIT as u64 + 5;
        let messages: Vec<Message> = (0..total)
            .map(|seq| {
                let date = if seq < 5 { format!("{seq:05}") } else { format!("{:05}", 20_000 - seq) };
                Message::log_line(seq, &date, ResponseBody::from(json!({"n": seq})))
            })
            .collect();
        let by_prefix = |prefix: &str, _json: &serde_json::Map<String, Value>| {
            Ok::<_, crate::allproxy_logs::ClassifyError>(LogEntry {
                date: prefix.to_string(),
                ..LogEntry::default()
            })
        };
        let prepared =
            prepare_import(messages, "big.log", &by_prefix, &ColorAssignor::new(), &[]);

        assert_eq!(prepared.views.len(), IMPORT_LIMIT);
        assert!(prepared.views.iter().all(|view| view.message().path.as_str() > "00004"));
        assert_eq!(prepared.views[0].message().path, format!("{:05}", 20_000 - (total - 1)));
        assert_eq!(prepared.views[IMPORT_LIMIT - 1].message().path, "19995");
        assert!(prepared
            .views
            .iter()
            .enumerate()
            .all(|(idx, view)| view.sequence_number() == idx as u64));
    }

    #[rstest]
    fn empty_snapshots_export_and_import_back(mut store_with_five: SnapshotStore) {
        store_with_five.take_snapshot_at(noon(), &[]);
        let empty = store_with_five.take_snapshot_at(noon(), &[]);
        let bytes = store_with_five.export_snapshot(&empty, None).expect("export");
        assert_eq!(bytes, b"[]");

        let prepared = prepare(&bytes, "empty.allproxy").expect("import");
        let imported = store_with_five.insert_import_at(noon(), prepared);
        assert_eq!(store_with_five.len(&imported), 0);
        assert_eq!(store_with_five.selected_name(), imported);
        assert_eq!(store_with_five.display_name(&imported), "empty");
    }

    #[test]
    fn a_single_json_object_imports_as_one_log_line() {
        let prepared =
            prepare(b"{\"level\": \"warn\", \"msg\": \"disk full\"}\n", "one.log").expect("import");
        assert_eq!(prepared.views.len(), 1);
        let view = &prepared.views[0];
        assert!(view.protocol().is_log());
        assert_eq!(view.log_entry().expect("classified").message, "disk full");
        assert_eq!(view.log_entry().expect("classified").level, "warn");
    }

    #[rstest]
    #[case(b"[{\"protocol\": \"http:\"}]".as_slice())]
    #[case(b"[{\"sequenceNumber\": 1}]".as_slice())]
    #[case(b"   \n".as_slice())]
    #[case(b"\xff\xfe\x00".as_slice())]
    fn undecodable_imports_create_nothing(
        mut store_with_five: SnapshotStore,
        #[case] bytes: &[u8],
    ) {
        assert!(prepare(bytes, "bad.allproxy").is_err());
        assert_eq!(store_with_five.names(), vec![ACTIVE_SNAPSHOT_NAME]);
        assert_eq!(store_with_five.selected_name(), ACTIVE_SNAPSHOT_NAME);
        store_with_five.select(ACTIVE_SNAPSHOT_NAME).expect("select active");
    }

    #[test]
    fn log_export_writes_prefixed_lines_and_honours_the_filter() {
        let views: VecDeque<MessageView> = [
            Message::log_line(0, "host-a", ResponseBody::from(json!({"msg": "keep", "PREFIX": "2024 web"}))),
            Message::log_line(1, "host-b", ResponseBody::from(json!({"msg": "drop"}))),
            Message::log_line(2, "", ResponseBody::from(json!({"msg": "keep too"}))),
        ]
        .into_iter()
        .map(|message| MessageView::new(Arc::new(message), "#007bff"))
        .collect();
        let filter = FilterRule::new("keep");
        let bytes = export_views(&views, Some(&filter)).expect("export");
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            "2024 web {\"msg\":\"keep\"}\n{\"msg\":\"keep too\"}\n"
        );
    }

    #[test]
    fn toggling_a_label_retitles_log_views() {
        let mut store = SnapshotStore::new(CaptureQueue::new(10));
        let message =
            Message::log_line(0, "p", ResponseBody::from(json!({"level": "warn", "msg": "hi"})));
        store.active_mut().append(MessageView::new(Arc::new(message), "#007bff"));
        let name = store.take_snapshot_at(noon(), &["level".to_string()]);
        assert_eq!(store.messages(&name).expect("messages")[0].title(), "level=warn");

        assert!(store.toggle_field_label(&name, "msg").expect("toggle"));
        assert_eq!(store.messages(&name).expect("messages")[0].title(), "level=warn msg=hi");
        assert!(!store.toggle_field_label(&name, "level").expect("toggle"));
        assert!(!store.toggle_field_label(&name, "msg").expect("toggle"));
        assert_eq!(
            store.messages(&name).expect("messages")[0].title(),
            "p {\"level\":\"warn\",\"msg\":\"hi\"}"
        );
        assert!(matches!(
            store.toggle_field_label(&name, "missing"),
            Err(SnapshotError::UnknownField { .. })
        ));
    }

    #[test]
    fn live_log_lines_build_active_labels() {
        let mut store = SnapshotStore::new(CaptureQueue::new(10));
        let persisted = vec!["level".to_string()];
        for (seq, body) in [(0, json!({"level": "warn", "msg": "a"})), (1, json!({"msg": "b"}))] {
            let message = Message::log_line(seq, "p", ResponseBody::from(body));
            assert!(store.append_active(MessageView::new(Arc::new(message), "#007bff"), &persisted));
        }
        let labels = &store.view_state(ACTIVE_SNAPSHOT_NAME).expect("active").field_labels;
        assert_eq!(
            labels,
            &vec![
                FieldLabelConfig { name: "msg".to_string(), occurrence_count: 2, selected: false },
                FieldLabelConfig { name: "level".to_string(), occurrence_count: 1, selected: true },
            ]
        );
        assert_eq!(store.messages(ACTIVE_SNAPSHOT_NAME).expect("messages")[0].title(), "level=warn");

        assert!(store.toggle_field_label(ACTIVE_SNAPSHOT_NAME, "msg").expect("toggle"));
        let name = store.take_snapshot_at(noon(), &persisted);
        assert_eq!(store.messages(&name).expect("messages")[0].title(), "msg=a level=warn");
        assert!(store.view_state(ACTIVE_SNAPSHOT_NAME).expect("active").field_labels.is_empty());

        store.active_mut().toggle_stopped();
        let late = Message::log_line(2, "p", ResponseBody::from(json!({"msg": "c"})));
        assert!(!store.append_active(MessageView::new(Arc::new(late), "#007bff"), &persisted));
        assert!(store.view_state(ACTIVE_SNAPSHOT_NAME).expect("active").field_labels.is_empty());
    }

    #[test]
    fn label_changes_reach_every_snapshot() {
        let mut store = SnapshotStore::new(CaptureQueue::new(10));
        let message = Message::log_line(0, "p", ResponseBody::from(json!({"level": "warn"})));
        store.append_active(MessageView::new(Arc::new(message), "#007bff"), &[]);
        let name = store.take_snapshot_at(noon(), &[]);
        let message = Message::log_line(1, "p", ResponseBody::from(json!({"level": "info"})));
        store.append_active(MessageView::new(Arc::new(message), "#007bff"), &[]);

        let changed = store.apply_label_change(&["level".to_string()], &[]);
        assert_eq!(changed, vec![ACTIVE_SNAPSHOT_NAME.to_string(), name.clone()]);
        assert_eq!(store.messages(&name).expect("messages")[0].title(), "level=warn");
        assert_eq!(store.messages(ACTIVE_SNAPSHOT_NAME).expect("messages")[0].title(), "level=info");

        assert!(store.apply_label_change(&["level".to_string()], &[]).is_empty());
        assert_eq!(store.apply_label_change(&[], &["level".to_string()]).len(), 2);
        assert_eq!(store.messages(&name).expect("messages")[0].title(), "p {\"level\":\"warn\"}");
    }

    #[rstest]
    #[case("capture.allproxy", "capture")]
    #[case("/tmp/exports/night.allproxy", "night")]
    #[case("app.log", "app.log")]
    fn display_names_strip_the_extension(#[case] file_name: &str, #[case] expected: &str) {
        assert_eq!(display_name_for_file(file_name), expected);
    }
}
