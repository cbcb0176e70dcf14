//! Ordered rule lists that gate ingest: breakpoints and the no-capture list.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::allproxy_core::{FilterRule, MessageView};
use crate::allproxy_storage::{load_json, save_json, KeyValueStore, StorageError};

pub const BREAKPOINTS_KEY: &str = "allproxy-breakpoints";
pub const NO_CAPTURE_KEY: &str = "allproxy-no-capture";

/// Persisted shape of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    #[serde(default)]
    pub enabled: bool,
    #[serde(alias = "searchFilter")]
    pub expression: String,
    #[serde(default, rename = "matchCase", alias = "_matchCase")]
    pub match_case: bool,
    #[serde(default, alias = "_regex")]
    pub regex: bool,
    #[serde(default, alias = "_logical")]
    pub logical: bool,
}

impl From<&FilterRule> for RuleRecord {
    fn from(rule: &FilterRule) -> Self {
        Self {
            enabled: rule.is_enabled(),
            expression: rule.expression().to_string(),
            match_case: rule.match_case(),
            regex: rule.use_regex(),
            logical: rule.use_logical(),
        }
    }
}

impl RuleRecord {
    pub fn into_rule(self) -> FilterRule {
        let mut rule =
            FilterRule::with_flags(self.expression, self.match_case, self.regex, self.logical);
        rule.set_enabled(self.enabled);
        rule
    }
}

/// Rules evaluated in order; the first enabled rule that matches wins.
#[derive(Debug, Clone)]
pub struct BreakpointStore {
    key: &'static str,
    rules: Vec<FilterRule>,
    editing: bool,
}

impl Default for BreakpointStore {
    fn default() -> Self {
        Self::breakpoints()
    }
}

impl BreakpointStore {
    pub fn breakpoints() -> Self {
        Self::with_key(BREAKPOINTS_KEY)
    }

    pub fn no_capture() -> Self {
        Self::with_key(NO_CAPTURE_KEY)
    }

    fn with_key(key: &'static str) -> Self {
        Self { key, rules: Vec::new(), editing: false }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Load persisted rules; a missing entry yields an empty list.
    pub fn init(&mut self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        let records: Vec<RuleRecord> = load_json(store, self.key)?.unwrap_or_default();
        self.rules = records.into_iter().map(RuleRecord::into_rule).collect();
        debug!(key = self.key, rules = self.rules.len(), "Loaded rules");
        Ok(())
    }

    /// Append a disabled, empty rule and return its index.
    pub fn extend(&mut self) -> usize {
        self.rules.push(FilterRule::default());
        self.rules.len() - 1
    }

    pub fn push(&mut self, rule: FilterRule) -> usize {
        self.rules.push(rule);
        self.rules.len() - 1
    }

    /// Remove the rule at `index` and persist. Out-of-range indices are ignored.
    pub fn delete_entry(
        &mut self,
        store: &dyn KeyValueStore,
        index: usize,
    ) -> Result<(), StorageError> {
        if index < self.rules.len() {
            self.rules.remove(index);
        }
        self.save(store)
    }

    /// Persist after an edit.
    pub fn changed(&self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        self.save(store)
    }

    fn save(&self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        let records: Vec<RuleRecord> =
            self.rules.iter().filter(|rule| !rule.is_empty()).map(RuleRecord::from).collect();
        save_json(store, self.key, &records)
    }

    pub fn set_editing(&mut self, editing: bool) {
        self.editing = editing;
    }

    pub fn is_editing(&self) -> bool {
        self.editing
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut [FilterRule] {
        &mut self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn find_matching_breakpoint(&self, view: &MessageView) -> Option<(usize, &FilterRule)> {
        if self.editing {
            return None;
        }
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.is_enabled() && !rule.is_filtered(view))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::allproxy_core::{Message, Protocol};
    use crate::allproxy_storage::MemoryStore;
    use rstest::{fixture, rstest};

    fn enabled(expression: &str) -> FilterRule {
        let mut rule = FilterRule::logical(expression);
        rule.set_enabled(true);
        rule
    }

    #[fixture]
    fn orders() -> MessageView {
        let message = Message::new(1, Protocol::Http).with_method("POST").with_path("/api/orders");
        MessageView::new(Arc::new(message), "green")
    }

    #[rstest]
    fn first_enabled_match_wins(orders: MessageView) {
        let mut store = BreakpointStore::breakpoints();
        let mut disabled = FilterRule::new("orders");
        disabled.set_enabled(false);
        store.push(disabled);
        store.push(enabled("users"));
        store.push(enabled("POST && orders"));
        store.push(enabled("api"));

        let (index, rule) = store.find_matching_breakpoint(&orders).expect("breakpoint");
        assert_eq!(index, 2);
        assert_eq!(rule.expression(), "POST && orders");
    }

    #[rstest]
    fn editing_suspends_matching(orders: MessageView) {
        let mut store = BreakpointStore::breakpoints();
        store.push(enabled("orders"));
        store.set_editing(true);
        assert!(store.find_matching_breakpoint(&orders).is_none());
        store.set_editing(false);
        assert!(store.find_matching_breakpoint(&orders).is_some());
    }

    #[rstest]
    fn empty_or_invalid_rules(orders: MessageView) {
        let mut store = BreakpointStore::breakpoints();
        assert!(store.find_matching_breakpoint(&orders).is_none());
        store.push(enabled("(orders"));
        assert!(store.find_matching_breakpoint(&orders).is_none());
        // An enabled rule with no expression matches everything.
        store.extend();
        store.rules_mut()[1].set_enabled(true);
        assert_eq!(store.find_matching_breakpoint(&orders).map(|(idx, _)| idx), Some(1));
    }

    #[test]
    fn extend_appends_a_disabled_empty_rule() {
        let mut store = BreakpointStore::breakpoints();
        let index = store.extend();
        assert_eq!(index, 0);
        assert!(store.rules()[0].is_empty());
        assert!(!store.rules()[0].is_enabled());
    }

    #[test]
    fn persistence_skips_empty_expressions() {
        let kv = MemoryStore::new();
        let mut store = BreakpointStore::breakpoints();
        store.push(enabled("api && !health"));
        store.extend();
        let mut regex = FilterRule::with_flags("^GET", true, true, false);
        regex.set_enabled(false);
        store.push(regex);
        store.changed(&kv).expect("save");

        let mut reloaded = BreakpointStore::breakpoints();
        reloaded.init(&kv).expect("init");
        let records: Vec<RuleRecord> = reloaded.rules().iter().map(RuleRecord::from).collect();
        assert_eq!(
            records,
            vec![
                RuleRecord {
                    enabled: true,
                    expression: "api && !health".to_string(),
                    match_case: false,
                    regex: false,
                    logical: true,
                },
                RuleRecord {
                    enabled: false,
                    expression: "^GET".to_string(),
                    match_case: true,
                    regex: true,
                    logical: false,
                },
            ]
        );
    }

    #[test]
    fn delete_entry_persists() {
        let kv = MemoryStore::new();
        let mut store = BreakpointStore::no_capture();
        store.push(enabled("health"));
        store.push(enabled("metrics"));
        store.delete_entry(&kv, 0).expect("delete");
        store.delete_entry(&kv, 10).expect("delete out of range");

        let mut reloaded = BreakpointStore::no_capture();
        reloaded.init(&kv).expect("init");
        assert_eq!(reloaded.rules().len(), 1);
        assert_eq!(reloaded.rules()[0].expression(), "metrics");
        assert!(kv.get(BREAKPOINTS_KEY).expect("get").is_none());
    }

    #[test]
    fn missing_entry_initialises_empty() {
        let kv = MemoryStore::new();
        let mut store = BreakpointStore::breakpoints();
        store.push(enabled("stale"));
        store.init(&kv).expect("init");
        assert!(store.is_empty());
    }

    #[test]
    fn legacy_record_names_are_accepted() {
        let kv = MemoryStore::new();
        kv.set(
            BREAKPOINTS_KEY,
            r#"[{"enabled":true,"searchFilter":"api","_matchCase":true,"_regex":false,"_logical":true}]"#,
        )
        .expect("set");
        let mut store = BreakpointStore::breakpoints();
        store.init(&kv).expect("init");
        let rule = &store.rules()[0];
        assert_eq!(rule.expression(), "api");
        assert!(rule.match_case());
        assert!(rule.use_logical());
        assert!(rule.is_enabled());
    }
}
