use std::sync::Arc;

use allproxy::allproxy_core::{FilterRule, Message, MessageView, Protocol, ResponseBody};
use allproxy::allproxy_snapshots::ACTIVE_SNAPSHOT_NAME;
use allproxy::allproxy_storage::{DirStore, MemoryStore};
use allproxy::{IngestOutcome, RuleList, Session, SessionConfig};
use serde_json::json;

fn request(seq: u64, path: &str) -> Message {
    Message::new(seq, Protocol::Http)
        .with_method("GET")
        .with_path(path)
        .with_client("10.0.0.7")
        .with_body(ResponseBody::from(json!({"path": path})))
        .with_response(seq, 200)
}

fn memory_session() -> Session {
    let session = Session::new(SessionConfig::default(), Arc::new(MemoryStore::new()));
    session.init().expect("init");
    session
}

fn sequence_numbers(views: &[MessageView]) -> Vec<u64> {
    views.iter().map(MessageView::sequence_number).collect()
}

#[test]
fn snapshot_survives_clearing_the_live_queue() {
    let session = memory_session();
    for seq in 0..5 {
        assert_eq!(session.ingest(request(seq, "/api/items")).expect("ingest"), IngestOutcome::Captured);
    }

    let name = session.take_snapshot().expect("snapshot");
    assert_eq!(session.selected_snapshot().expect("selected"), name);
    session.clear().expect("clear");

    assert!(session.visible(ACTIVE_SNAPSHOT_NAME).expect("active").is_empty());
    assert_eq!(sequence_numbers(&session.visible(&name).expect("frozen")), vec![0, 1, 2, 3, 4]);
    assert_eq!(session.snapshot_names().expect("names"), vec![ACTIVE_SNAPSHOT_NAME.to_string(), name]);
}

#[test]
fn exported_traffic_imports_back() {
    let session = memory_session();
    for (seq, path) in ["/a", "/b", "/c"].into_iter().enumerate() {
        session.ingest(request(seq as u64, path)).expect("ingest");
    }
    let name = session.take_snapshot().expect("snapshot");
    let bytes = session.export_snapshot(&name).expect("export");

    let other = memory_session();
    let imported = other.import_snapshot(&bytes, "capture.allproxy").expect("import");
    let views = other.visible(&imported).expect("visible");
    assert_eq!(sequence_numbers(&views), vec![0, 1, 2]);
    let paths: Vec<&str> = views.iter().map(|view| view.message().path.as_str()).collect();
    assert_eq!(paths, vec!["/a", "/b", "/c"]);
    assert!(views.iter().all(|view| view.protocol() == Protocol::Http));
}

#[test]
fn log_import_orders_by_date() {
    let session = memory_session();
    let text = "\
app web 10:00:03 web-1 {\"msg\":\"third\"}
app web 10:00:01 web-1 {\"msg\":\"first\"}
app web 10:00:02 web-1 {\"msg\":\"second\"}
";
    let name = session.import_snapshot(text.as_bytes(), "app.log").expect("import");
    let views = session.visible(&name).expect("visible");

    assert_eq!(sequence_numbers(&views), vec![0, 1, 2]);
    let messages: Vec<&str> = views
        .iter()
        .map(|view| view.log_entry().map(|entry| entry.message.as_str()).unwrap_or_default())
        .collect();
    assert_eq!(messages, vec!["first", "second", "third"]);
}

#[test]
fn rejected_import_leaves_snapshots_untouched() {
    let session = memory_session();
    assert!(session.import_snapshot(br#"[{"not": "a message"}]"#, "bad.allproxy").is_err());
    assert!(session.import_snapshot(b"", "empty.log").is_err());
    assert_eq!(session.snapshot_names().expect("names"), vec![ACTIVE_SNAPSHOT_NAME.to_string()]);
}

#[test]
fn search_filter_limits_visible_rows() {
    let session = memory_session();
    session.ingest(request(0, "/api/orders")).expect("ingest");
    session.ingest(request(1, "/api/health")).expect("ingest");
    session.ingest(request(2, "/static/app.js")).expect("ingest");

    session.set_search(FilterRule::logical("api && !health")).expect("search");
    assert_eq!(sequence_numbers(&session.visible(ACTIVE_SNAPSHOT_NAME).expect("visible")), vec![0]);

    session.set_search(FilterRule::logical("(api")).expect("search");
    assert!(session.search().expect("search").is_invalid());
    assert!(session.visible(ACTIVE_SNAPSHOT_NAME).expect("visible").is_empty());

    session.set_search(FilterRule::default()).expect("search");
    assert_eq!(session.visible(ACTIVE_SNAPSHOT_NAME).expect("visible").len(), 3);
}

#[test]
fn rules_persist_across_sessions() {
    let temp = tempfile::tempdir().expect("tempdir");

    {
        let store = Arc::new(DirStore::new(temp.path()).expect("store"));
        let session = Session::new(SessionConfig::default(), store);
        session.init().expect("init");
        session
            .edit_rules(RuleList::NoCapture, |rules| {
                let mut rule = FilterRule::new("/health");
                rule.set_enabled(true);
                rules.push(rule)
            })
            .expect("edit");
        session.set_script("message = json.msg | \"none\"").expect("script");
    }

    let store = Arc::new(DirStore::new(temp.path()).expect("store"));
    let session = Session::new(SessionConfig::default(), store);
    session.init().expect("init");

    assert_eq!(session.rules(RuleList::NoCapture).expect("rules").len(), 1);
    assert_eq!(session.ingest(request(0, "/health")).expect("ingest"), IngestOutcome::Dropped { rule: 0 });
    assert_eq!(session.ingest(request(1, "/orders")).expect("ingest"), IngestOutcome::Captured);
    assert_eq!(session.script_source().expect("script"), "message = json.msg | \"none\"");
}

#[test]
fn empty_snapshot_exports_and_imports_back() {
    let session = memory_session();
    let name = session.take_snapshot().expect("snapshot");
    let bytes = session.export_snapshot(&name).expect("export");

    let imported = session.import_snapshot(&bytes, "nothing.allproxy").expect("import");
    assert!(session.visible(&imported).expect("visible").is_empty());
    assert_eq!(session.selected_snapshot().expect("selected"), imported);
}

#[test]
fn one_json_log_line_imports_as_a_log_snapshot() {
    let session = memory_session();
    let name = session
        .import_snapshot(br#"{"pod": "payments-6c9-x", "level": "error", "msg": "declined"}"#, "one.log")
        .expect("import");
    let views = session.visible(&name).expect("visible");
    assert_eq!(views.len(), 1);
    let entry = views[0].log_entry().expect("classified");
    assert_eq!(entry.category, "payments-6c9");
    assert_eq!(entry.level, "error");
    assert_eq!(entry.message, "declined");
}

#[test]
fn saved_queries_persist_on_disk() {
    let temp = tempfile::tempdir().expect("tempdir");

    {
        let session = Session::new(SessionConfig::default(), Arc::new(DirStore::new(temp.path()).expect("store")));
        session.init().expect("init");
        session.add_query("status:500").expect("add");
    }
    assert!(temp.path().join("queries").is_dir());

    let session = Session::new(SessionConfig::default(), Arc::new(DirStore::new(temp.path()).expect("store")));
    session.init().expect("init");
    assert_eq!(session.queries().expect("queries"), vec!["status:500".to_string()]);
    assert!(session.delete_query("status:500").expect("delete"));
    assert!(!temp.path().join("queries").exists());
}
