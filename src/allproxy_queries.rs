//! Saved search queries, one `queries/<dir>/query.txt` entry per query.

use chrono::{DateTime, Local};
use tracing::debug;

use crate::allproxy_storage::{KeyValueStore, StorageError};

pub const QUERIES_DIR: &str = "queries";
pub const QUERY_FILE: &str = "query.txt";

fn query_key(dir_name: &str) -> String {
    format!("{QUERIES_DIR}/{dir_name}/{QUERY_FILE}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedQuery {
    query: String,
    dir_name: String,
}

impl SavedQuery {
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryStore {
    queries: Vec<SavedQuery>,
    apply_filter: String,
}

impl QueryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload every saved query, ordered by directory name. A directory
    /// without a query file loads as an empty query.
    pub fn init(&mut self, store: &dyn KeyValueStore) -> Result<(), StorageError> {
        self.queries.clear();
        for dir_name in store.list(QUERIES_DIR)? {
            let query = store.get(&query_key(&dir_name))?.unwrap_or_default();
            self.queries.push(SavedQuery { query, dir_name });
        }
        self.queries.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));
        debug!(queries = self.queries.len(), "Loaded saved queries");
        Ok(())
    }

    pub fn queries(&self) -> Vec<&str> {
        self.queries.iter().map(SavedQuery::query).collect()
    }

    pub fn entries(&self) -> &[SavedQuery] {
        &self.queries
    }

    /// Filter text waiting to be applied to the search box.
    pub fn apply_filter(&self) -> &str {
        &self.apply_filter
    }

    pub fn set_apply_filter(&mut self, filter: impl Into<String>) {
        self.apply_filter = filter.into();
    }

    /// Insert a blank, unsaved query at the front.
    pub fn extend(&mut self) {
        self.extend_at(Local::now());
    }

    pub fn extend_at(&mut self, now: DateTime<Local>) {
        let dir_name = self.dir_name_for(now);
        self.queries.insert(0, SavedQuery { query: String::new(), dir_name });
    }

    /// Remove the first entry whose text is `query`, along with its file.
    /// Returns false when no entry matches.
    pub fn delete_entry(
        &mut self,
        store: &dyn KeyValueStore,
        query: &str,
    ) -> Result<bool, StorageError> {
        let Some(index) = self.queries.iter().position(|entry| entry.query == query) else {
            return Ok(false);
        };
        store.delete(&query_key(&self.queries[index].dir_name))?;
        self.queries.remove(index);
        Ok(true)
    }

    /// Append a query under a fresh directory and persist it.
    pub fn add_and_save_query(
        &mut self,
        store: &dyn KeyValueStore,
        query: &str,
    ) -> Result<(), StorageError> {
        self.add_and_save_query_at(store, Local::now(), query)
    }

    pub fn add_and_save_query_at(
        &mut self,
        store: &dyn KeyValueStore,
        now: DateTime<Local>,
        query: &str,
    ) -> Result<(), StorageError> {
        let dir_name = self.dir_name_for(now);
        self.queries.push(SavedQuery { query: String::new(), dir_name });
        self.save_query(store, self.queries.len() - 1, query)
    }

    /// Replace the text of the query at `index` and persist it. An index
    /// past the end is ignored.
    pub fn save_query(
        &mut self,
        store: &dyn KeyValueStore,
        index: usize,
        query: &str,
    ) -> Result<(), StorageError> {
        let Some(entry) = self.queries.get_mut(index) else {
            return Ok(());
        };
        entry.query = query.to_string();
        store.set(&query_key(&entry.dir_name), query)?;
        debug!(dir = %entry.dir_name, "Saved query");
        Ok(())
    }

    /// Timestamped directory name, suffixed when the second is already taken.
    fn dir_name_for(&self, now: DateTime<Local>) -> String {
        let base = now.format("%Y-%m-%d %H-%M-%S").to_string();
        let taken = |name: &str| self.queries.iter().any(|entry| entry.dir_name == name);
        if !taken(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let name = format!("{base} #{n}");
            if !taken(&name) {
                return name;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allproxy_storage::{DirStore, MemoryStore};
    use chrono::TimeZone;
    use rstest::rstest;
    use tempfile::TempDir;

    fn at(second: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 9, 15, second).single().expect("valid time")
    }

    fn with_stores(test: impl Fn(&dyn KeyValueStore)) {
        test(&MemoryStore::new());
        let dir = TempDir::new().expect("tempdir");
        test(&DirStore::new(dir.path()).expect("dir store"));
    }

    #[test]
    fn saved_queries_reload_in_directory_order() {
        with_stores(|store| {
            let mut queries = QueryStore::new();
            queries.add_and_save_query_at(store, at(30), "status:500").expect("save");
            queries.add_and_save_query_at(store, at(10), "GET && /api").expect("save");
            assert_eq!(queries.queries(), vec!["status:500", "GET && /api"]);
            assert_eq!(
                store.get("queries/2024-05-01 09-15-30/query.txt").expect("get").as_deref(),
                Some("status:500")
            );

            let mut reloaded = QueryStore::new();
            reloaded.init(store).expect("init");
            assert_eq!(reloaded.queries(), vec!["GET && /api", "status:500"]);
        });
    }

    #[test]
    fn extended_entries_are_saved_in_place() {
        with_stores(|store| {
            let mut queries = QueryStore::new();
            queries.add_and_save_query_at(store, at(1), "first").expect("save");
            queries.extend_at(at(1));
            assert_eq!(queries.queries(), vec!["", "first"]);
            assert_eq!(queries.entries()[0].dir_name(), "2024-05-01 09-15-01 #2");

            queries.save_query(store, 0, "second").expect("save");
            queries.save_query(store, 9, "ignored").expect("out of range");
            let mut reloaded = QueryStore::new();
            reloaded.init(store).expect("init");
            assert_eq!(reloaded.queries(), vec!["first", "second"]);
        });
    }

    #[test]
    fn deleting_removes_the_query_file() {
        with_stores(|store| {
            let mut queries = QueryStore::new();
            queries.add_and_save_query_at(store, at(1), "keep").expect("save");
            queries.add_and_save_query_at(store, at(2), "drop").expect("save");
            assert!(queries.delete_entry(store, "drop").expect("delete"));
            assert!(!queries.delete_entry(store, "drop").expect("delete twice"));
            assert_eq!(queries.queries(), vec!["keep"]);

            let mut reloaded = QueryStore::new();
            reloaded.init(store).expect("init");
            assert_eq!(reloaded.queries(), vec!["keep"]);
        });
    }

    #[rstest]
    #[case("")]
    #[case("level:error")]
    fn apply_filter_is_held_until_replaced(#[case] filter: &str) {
        let mut queries = QueryStore::new();
        queries.set_apply_filter(filter);
        assert_eq!(queries.apply_filter(), filter);
        queries.set_apply_filter("next");
        assert_eq!(queries.apply_filter(), "next");
    }
}
