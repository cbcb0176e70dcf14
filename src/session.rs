//! Session state: one writer, many readers, explicit change events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::allproxy_breakpoints::BreakpointStore;
use crate::allproxy_core::{
    Change, ChangeBus, Event, EventBus, FilterRule, Message, MessageView, SequenceNumber,
};
use crate::allproxy_logs::{
    classify_message, ClassificationScript, LabelStore, LineLogImporter, ScriptError,
};
use crate::allproxy_queries::QueryStore;
use crate::allproxy_queue::{sorted_indices, CaptureQueue, SortKey, SortOrder};
use crate::allproxy_snapshots::{
    decode_snapshot, prepare_import, ImportError, LogFileImporter, SnapshotError, SnapshotStore,
    ACTIVE_SNAPSHOT_NAME,
};
use crate::allproxy_storage::{KeyValueStore, StorageError};
use crate::colors::ColorAssignor;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Script(#[from] ScriptError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleList {
    Breakpoints,
    NoCapture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Captured,
    /// Discarded because capture is stopped.
    Paused,
    /// Matched the no-capture rule at this index.
    Dropped { rule: usize },
    /// Held by the breakpoint at this index until [`Session::release`].
    Held { breakpoint: usize },
}

#[derive(Debug, Clone)]
pub struct HeldMessage {
    pub view: MessageView,
    pub breakpoint: usize,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_limit: usize,
    pub search: FilterRule,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { queue_limit: crate::allproxy_queue::DEFAULT_QUEUE_LIMIT, search: FilterRule::default() }
    }
}

struct SessionState {
    snapshots: SnapshotStore,
    breakpoints: BreakpointStore,
    no_capture: BreakpointStore,
    script: ClassificationScript,
    labels: LabelStore,
    queries: QueryStore,
    search: FilterRule,
    held: Vec<HeldMessage>,
}

impl SessionState {
    fn rules_mut(&mut self, list: RuleList) -> &mut BreakpointStore {
        match list {
            RuleList::Breakpoints => &mut self.breakpoints,
            RuleList::NoCapture => &mut self.no_capture,
        }
    }

    fn rules(&self, list: RuleList) -> &BreakpointStore {
        match list {
            RuleList::Breakpoints => &self.breakpoints,
            RuleList::NoCapture => &self.no_capture,
        }
    }
}

/// Counts a bulk pass in progress; passes may overlap or nest.
struct UpdatingGuard<'a>(&'a AtomicUsize);

impl<'a> UpdatingGuard<'a> {
    fn begin(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<RwLock<SessionState>>,
    bus: ChangeBus,
    updating: Arc<AtomicUsize>,
    colors: Arc<ColorAssignor>,
    store: Arc<dyn KeyValueStore>,
    importer: Arc<dyn LogFileImporter>,
}

impl Session {
    pub fn new(config: SessionConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let state = SessionState {
            snapshots: SnapshotStore::new(CaptureQueue::new(config.queue_limit)),
            breakpoints: BreakpointStore::breakpoints(),
            no_capture: BreakpointStore::no_capture(),
            script: ClassificationScript::new(),
            labels: LabelStore::new(),
            queries: QueryStore::new(),
            search: config.search,
            held: Vec::new(),
        };
        Self {
            inner: Arc::new(RwLock::new(state)),
            bus: ChangeBus::default(),
            updating: Arc::new(AtomicUsize::new(0)),
            colors: Arc::new(ColorAssignor::new()),
            store,
            importer: Arc::new(LineLogImporter),
        }
    }

    pub fn with_importer(mut self, importer: Arc<dyn LogFileImporter>) -> Self {
        self.importer = importer;
        self
    }

    /// Load breakpoints, no-capture rules, field labels, saved queries and the
    /// classification script.
    pub fn init(&self) -> Result<(), SessionError> {
        let mut state = self.write()?;
        let store = self.store.as_ref();
        state.breakpoints.init(store)?;
        state.no_capture.init(store)?;
        state.labels.init(store)?;
        state.queries.init(store)?;
        state.script.init(store)?;
        info!(
            breakpoints = state.breakpoints.rules().len(),
            no_capture = state.no_capture.rules().len(),
            labels = state.labels.labels().len(),
            queries = state.queries.entries().len(),
            "Session initialised"
        );
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, SessionState>, SessionError> {
        self.inner.read().map_err(|_| SessionError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, SessionState>, SessionError> {
        self.inner.write().map_err(|_| SessionError::Poisoned)
    }

    fn publish(&self, event: Event) {
        if let Err(err) = self.bus.emit(event) {
            warn!(%err, "Failed to publish session event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        match self.bus.subscribe() {
            Ok(receiver) => receiver,
            Err(never) => match never {},
        }
    }

    pub fn version(&self) -> u64 {
        self.bus.version()
    }

    /// True while any import or title recompute is in progress.
    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::Acquire) > 0
    }

    pub fn colors(&self) -> &ColorAssignor {
        &self.colors
    }

    fn build_view(&self, message: Message) -> Result<MessageView, SessionError> {
        let color = self.colors.color_of(&message);
        let mut view = MessageView::new(Arc::new(message), color);
        if view.protocol().is_log() {
            let classifier = self.read()?.script.classifier();
            let entry = classify_message(classifier.as_ref(), view.message());
            view.set_log_entry(entry);
        }
        Ok(view)
    }

    /// Gate one captured message: no-capture rules, then breakpoints, then the queue.
    pub fn ingest(&self, message: Message) -> Result<IngestOutcome, SessionError> {
        let sequence_number = message.sequence_number;
        let view = self.build_view(message)?;

        let outcome = {
            let mut guard = self.write()?;
            let state = &mut *guard;
            if let Some((rule, _)) = state.no_capture.find_matching_breakpoint(&view) {
                IngestOutcome::Dropped { rule }
            } else if let Some((breakpoint, _)) = state.breakpoints.find_matching_breakpoint(&view) {
                state.held.push(HeldMessage { view, breakpoint });
                IngestOutcome::Held { breakpoint }
            } else if state.snapshots.append_active(view, &state.labels.names()) {
                IngestOutcome::Captured
            } else {
                IngestOutcome::Paused
            }
        };

        match outcome {
            IngestOutcome::Captured => self.publish(Event::MessageCaptured { sequence_number }),
            IngestOutcome::Held { breakpoint } => {
                debug!(sequence_number, breakpoint, "Breakpoint hit");
                self.publish(Event::MessageHeld { sequence_number, breakpoint });
            }
            IngestOutcome::Dropped { .. } => {
                self.publish(Event::MessageDropped { sequence_number })
            }
            IngestOutcome::Paused => {}
        }
        Ok(outcome)
    }

    pub fn held(&self) -> Result<Vec<HeldMessage>, SessionError> {
        Ok(self.read()?.held.clone())
    }

    /// Admit a message held by a breakpoint into the live queue.
    ///
    /// Returns `None` when no such message is held. While capture is stopped
    /// the message stays held and the outcome is [`IngestOutcome::Paused`].
    pub fn release(
        &self,
        sequence_number: SequenceNumber,
    ) -> Result<Option<IngestOutcome>, SessionError> {
        {
            let mut guard = self.write()?;
            let state = &mut *guard;
            let Some(idx) =
                state.held.iter().position(|held| held.view.sequence_number() == sequence_number)
            else {
                return Ok(None);
            };
            if state.snapshots.active().is_stopped() {
                debug!(sequence_number, "Capture stopped, message stays held");
                return Ok(Some(IngestOutcome::Paused));
            }
            let held = state.held.remove(idx);
            state.snapshots.append_active(held.view, &state.labels.names());
        }
        self.publish(Event::MessageCaptured { sequence_number });
        Ok(Some(IngestOutcome::Captured))
    }

    pub fn clear(&self) -> Result<(), SessionError> {
        self.write()?.snapshots.clear_active();
        self.publish(Event::QueueCleared);
        Ok(())
    }

    /// Pause or resume capture; returns true when paused.
    pub fn toggle_capture(&self) -> Result<bool, SessionError> {
        let stopped = self.write()?.snapshots.active_mut().toggle_stopped();
        self.publish(Event::CaptureToggled { stopped });
        Ok(stopped)
    }

    pub fn set_queue_limit(&self, limit: usize) -> Result<(), SessionError> {
        self.write()?.snapshots.active_mut().set_limit(limit);
        Ok(())
    }

    pub fn set_sort_mode(&self, key: SortKey) -> Result<(), SessionError> {
        self.write()?.snapshots.active_mut().set_sort_mode(key);
        self.publish(Event::SortChanged);
        Ok(())
    }

    pub fn toggle_sort_order(&self) -> Result<SortOrder, SessionError> {
        let order = self.write()?.snapshots.active_mut().toggle_sort_order();
        self.publish(Event::SortChanged);
        Ok(order)
    }

    pub fn set_search(&self, rule: FilterRule) -> Result<(), SessionError> {
        self.write()?.search = rule;
        self.publish(Event::FilterChanged);
        Ok(())
    }

    pub fn search(&self) -> Result<FilterRule, SessionError> {
        Ok(self.read()?.search.clone())
    }

    /// Views of a snapshot in display order, excluding those the search filters out.
    pub fn visible(&self, name: &str) -> Result<Vec<MessageView>, SessionError> {
        let state = self.read()?;
        let messages = state
            .snapshots
            .messages(name)
            .ok_or_else(|| SnapshotError::NotFound { name: name.to_string() })?;
        let queue = state.snapshots.active();
        let visible = sorted_indices(messages, queue.sort_key(), queue.sort_order())
            .into_iter()
            .map(|idx| &messages[idx])
            .filter(|view| state.search.matches(view))
            .cloned()
            .collect();
        Ok(visible)
    }

    /// One-shot "new rows arrived" flag of the live queue.
    pub fn take_scroll_to_bottom(&self) -> Result<bool, SessionError> {
        Ok(self.write()?.snapshots.active_mut().take_scroll_to_bottom())
    }

    pub fn with_snapshots<R>(&self, f: impl FnOnce(&SnapshotStore) -> R) -> Result<R, SessionError> {
        let state = self.read()?;
        Ok(f(&state.snapshots))
    }

    pub fn take_snapshot(&self) -> Result<String, SessionError> {
        let name = {
            let mut state = self.write()?;
            let labels = state.labels.names();
            state.snapshots.take_snapshot(&labels)
        };
        self.publish(Event::SnapshotCreated { name: name.clone() });
        Ok(name)
    }

    pub fn delete_snapshot(&self, name: &str) -> Result<(), SessionError> {
        self.write()?.snapshots.delete_snapshot(name)?;
        self.publish(Event::SnapshotDeleted { name: name.to_string() });
        Ok(())
    }

    pub fn delete_all_snapshots(&self) -> Result<(), SessionError> {
        self.write()?.snapshots.delete_all();
        self.publish(Event::SnapshotSelected { name: ACTIVE_SNAPSHOT_NAME.to_string() });
        Ok(())
    }

    pub fn select_snapshot(&self, name: &str) -> Result<(), SessionError> {
        self.write()?.snapshots.select(name)?;
        self.publish(Event::SnapshotSelected { name: name.to_string() });
        Ok(())
    }

    pub fn selected_snapshot(&self) -> Result<String, SessionError> {
        Ok(self.read()?.snapshots.selected_name().to_string())
    }

    pub fn snapshot_names(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.read()?.snapshots.names().into_iter().map(str::to_string).collect())
    }

    /// Export bytes of a snapshot; log-only snapshots honour the search filter.
    pub fn export_snapshot(&self, name: &str) -> Result<Vec<u8>, SessionError> {
        let state = self.read()?;
        Ok(state.snapshots.export_snapshot(name, Some(&state.search))?)
    }

    /// Decode and insert a snapshot file. Nothing changes when decoding fails.
    pub fn import_snapshot(&self, bytes: &[u8], file_name: &str) -> Result<String, SessionError> {
        let _updating = UpdatingGuard::begin(&self.updating);
        let (classifier, labels) = {
            let state = self.read()?;
            (state.script.classifier(), state.labels.names())
        };

        let messages = decode_snapshot(bytes, file_name, self.importer.as_ref())?;
        let prepared =
            prepare_import(messages, file_name, classifier.as_ref(), &self.colors, &labels);
        let name = self.write()?.snapshots.insert_import(prepared);
        self.publish(Event::SnapshotCreated { name: name.clone() });
        Ok(name)
    }

    pub fn toggle_field_label(&self, name: &str, field: &str) -> Result<bool, SessionError> {
        let _updating = UpdatingGuard::begin(&self.updating);
        let selected = self.write()?.snapshots.toggle_field_label(name, field)?;
        self.publish(Event::TitlesUpdated { name: name.to_string() });
        Ok(selected)
    }

    pub fn rules(&self, list: RuleList) -> Result<Vec<FilterRule>, SessionError> {
        Ok(self.read()?.rules(list).rules().to_vec())
    }

    /// Edit a rule list in place and persist it.
    pub fn edit_rules<R>(
        &self,
        list: RuleList,
        edit: impl FnOnce(&mut BreakpointStore) -> R,
    ) -> Result<R, SessionError> {
        let result = {
            let mut state = self.write()?;
            let rules = state.rules_mut(list);
            let result = edit(rules);
            rules.changed(self.store.as_ref())?;
            result
        };
        self.publish(Event::BreakpointsChanged);
        Ok(result)
    }

    pub fn delete_rule(&self, list: RuleList, index: usize) -> Result<(), SessionError> {
        self.write()?.rules_mut(list).delete_entry(self.store.as_ref(), index)?;
        self.publish(Event::BreakpointsChanged);
        Ok(())
    }

    pub fn set_breakpoint_editing(&self, editing: bool) -> Result<(), SessionError> {
        self.write()?.breakpoints.set_editing(editing);
        Ok(())
    }

    pub fn label_names(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.read()?.labels.names())
    }

    /// Add a persisted field label. Returns false when the name is invalid.
    pub fn add_label(&self, name: &str) -> Result<bool, SessionError> {
        self.edit_labels(|labels, store| {
            labels.extend();
            labels.set_name_and_validate(store, 0, name)
        })
    }

    pub fn rename_label(&self, index: usize, name: &str) -> Result<bool, SessionError> {
        self.edit_labels(|labels, store| labels.set_name_and_validate(store, index, name))
    }

    pub fn delete_label(&self, index: usize) -> Result<(), SessionError> {
        self.edit_labels(|labels, store| labels.delete_entry(store, index))
    }

    /// Apply a label edit, then select or deselect the affected field in every
    /// snapshot and retitle its log views.
    fn edit_labels<R>(
        &self,
        edit: impl FnOnce(&mut LabelStore, &dyn KeyValueStore) -> Result<R, StorageError>,
    ) -> Result<R, SessionError> {
        let _updating = UpdatingGuard::begin(&self.updating);
        let (result, changed) = {
            let mut guard = self.write()?;
            let state = &mut *guard;
            let before = state.labels.names();
            let result = edit(&mut state.labels, self.store.as_ref())?;
            let after = state.labels.names();
            let added: Vec<String> =
                after.iter().filter(|name| !before.contains(name)).cloned().collect();
            let removed: Vec<String> =
                before.into_iter().filter(|name| !after.contains(name)).collect();
            (result, state.snapshots.apply_label_change(&added, &removed))
        };
        for name in changed {
            self.publish(Event::TitlesUpdated { name });
        }
        Ok(result)
    }

    pub fn queries(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.read()?.queries.queries().into_iter().map(str::to_string).collect())
    }

    pub fn add_query(&self, query: &str) -> Result<(), SessionError> {
        self.write()?.queries.add_and_save_query(self.store.as_ref(), query)?;
        self.publish(Event::QueriesChanged);
        Ok(())
    }

    /// Insert a blank query at the front; it is stored on the first `save_query`.
    pub fn extend_queries(&self) -> Result<(), SessionError> {
        self.write()?.queries.extend();
        self.publish(Event::QueriesChanged);
        Ok(())
    }

    pub fn save_query(&self, index: usize, query: &str) -> Result<(), SessionError> {
        self.write()?.queries.save_query(self.store.as_ref(), index, query)?;
        self.publish(Event::QueriesChanged);
        Ok(())
    }

    pub fn delete_query(&self, query: &str) -> Result<bool, SessionError> {
        let deleted = self.write()?.queries.delete_entry(self.store.as_ref(), query)?;
        if deleted {
            self.publish(Event::QueriesChanged);
        }
        Ok(deleted)
    }

    /// Stage a saved query for the search box.
    pub fn set_apply_filter(&self, filter: &str) -> Result<(), SessionError> {
        self.write()?.queries.set_apply_filter(filter);
        Ok(())
    }

    pub fn apply_filter(&self) -> Result<String, SessionError> {
        Ok(self.read()?.queries.apply_filter().to_string())
    }

    pub fn script_source(&self) -> Result<String, SessionError> {
        Ok(self.read()?.script.source().to_string())
    }

    /// Replace, compile and persist the classification script. A script that
    /// fails to compile is kept in memory but not saved.
    pub fn set_script(&self, source: &str) -> Result<(), SessionError> {
        let mut state = self.write()?;
        state.script.set_script(source);
        state.script.update_script_func()?;
        state.script.save_script(self.store.as_ref())?;
        Ok(())
    }

    pub fn reset_script(&self) -> Result<(), SessionError> {
        self.write()?.script.reset_to_default(self.store.as_ref())?;
        Ok(())
    }
}
