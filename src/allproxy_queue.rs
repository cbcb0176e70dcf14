//! Live capture queue: bounded FIFO of views with pause and read-side sorting.

use std::cmp::Ordering;
use std::collections::VecDeque;

use serde_json::Value;
use smol_str::SmolStr;
use tracing::debug;

use crate::allproxy_core::{MessageView, SequenceNumber};

pub const DEFAULT_QUEUE_LIMIT: usize = 1000;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    RequestSeq,
    ResponseSeq,
    /// Dotted field path into a structured body.
    Field(SmolStr),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn toggled(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Self::Ascending => ordering,
            Self::Descending => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureQueue {
    messages: VecDeque<MessageView>,
    limit: usize,
    stopped: bool,
    sort_key: SortKey,
    sort_order: SortOrder,
    scroll_to_bottom: bool,
}

impl Default for CaptureQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_LIMIT)
    }
}

impl CaptureQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            limit: limit.max(1),
            stopped: false,
            sort_key: SortKey::default(),
            sort_order: SortOrder::default(),
            scroll_to_bottom: false,
        }
    }

    /// Append unless paused, evicting the oldest views past the limit.
    /// Returns false when the view was discarded because capture is stopped.
    pub fn append(&mut self, view: MessageView) -> bool {
        if self.stopped {
            return false;
        }
        self.messages.push_back(view);
        self.evict();
        self.scroll_to_bottom = true;
        true
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
        self.evict();
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn evict(&mut self) {
        let mut evicted = 0usize;
        while self.messages.len() > self.limit {
            self.messages.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, limit = self.limit, "Evicted oldest messages");
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Flip between running and paused; returns the new paused state.
    pub fn toggle_stopped(&mut self) -> bool {
        self.stopped = !self.stopped;
        self.stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn set_sort_mode(&mut self, key: SortKey) {
        self.sort_key = key;
    }

    pub fn sort_key(&self) -> &SortKey {
        &self.sort_key
    }

    pub fn toggle_sort_order(&mut self) -> SortOrder {
        self.sort_order = self.sort_order.toggled();
        self.sort_order
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    /// Display order as indices into [`CaptureQueue::messages`].
    pub fn sorted_indices(&self) -> Vec<usize> {
        sorted_indices(&self.messages, &self.sort_key, self.sort_order)
    }

    pub fn take_scroll_to_bottom(&mut self) -> bool {
        std::mem::take(&mut self.scroll_to_bottom)
    }

    pub fn messages(&self) -> &VecDeque<MessageView> {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> impl Iterator<Item = &mut MessageView> {
        self.messages.iter_mut()
    }

    /// Move every view out, leaving the queue empty.
    pub fn take_messages(&mut self) -> VecDeque<MessageView> {
        std::mem::take(&mut self.messages)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

pub fn sorted_indices(
    views: &VecDeque<MessageView>,
    key: &SortKey,
    order: SortOrder,
) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..views.len()).collect();
    match key {
        SortKey::RequestSeq => {
            indices.sort_by(|&a, &b| {
                order.apply(views[a].sequence_number().cmp(&views[b].sequence_number()))
            });
        }
        SortKey::ResponseSeq => {
            indices.sort_by(|&a, &b| {
                let left = views[a].message().sequence_number_response;
                let right = views[b].message().sequence_number_response;
                match (left, right) {
                    (Some(left), Some(right)) => order.apply(left.cmp(&right)),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => order
                        .apply(views[a].sequence_number().cmp(&views[b].sequence_number())),
                }
            });
        }
        SortKey::Field(path) => {
            let keyed: Vec<(Option<FieldValue>, SequenceNumber)> = views
                .iter()
                .map(|view| {
                    let value = view.message().response_body.field(path).and_then(FieldValue::new);
                    (value, view.sequence_number())
                })
                .collect();
            indices.sort_by(|&a, &b| {
                let (left, left_seq) = &keyed[a];
                let (right, right_seq) = &keyed[b];
                let primary = match (left, right) {
                    (Some(left), Some(right)) => order.apply(left.compare(right)),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                primary.then_with(|| left_seq.cmp(right_seq))
            });
        }
    }
    indices
}

#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    fn new(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(number) => number.as_f64().map(Self::Number),
            Value::String(text) => match text.trim().parse::<f64>() {
                Ok(number) if number.is_finite() => Some(Self::Number(number)),
                _ => Some(Self::Text(text.clone())),
            },
            other => Some(Self::Text(other.to_string())),
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(left), Self::Number(right)) => left.total_cmp(right),
            (Self::Number(_), Self::Text(_)) => Ordering::Less,
            (Self::Text(_), Self::Number(_)) => Ordering::Greater,
            (Self::Text(left), Self::Text(right)) => left.cmp(right),
        }
    }
}
