use std::sync::Arc;

use serde_json::{Value, json};
use vault_history::{
    HistoryError, HistoryRepository, HistorySettings, HistoryStore, JsonFileHistoryStore,
    PERSISTED_HISTORY_LIMIT, PersistedHistory,
};
use vault_protocol::{ResponseType, SearchRecord};

fn record(id: &str, query: &str, timestamp: u64) -> SearchRecord {
    SearchRecord {
        id: id.to_string(),
        query: query.to_string(),
        response_type: Some(ResponseType::SingleResult),
        response_content: String::new(),
        product_data: Some(json!({"name": "HP-200", "pressure_bar": 210})),
        product_list: Vec::new(),
        document_groups: Default::default(),
        selected_product: None,
        processing_time_ms: 42,
        timestamp,
        success: true,
        citations_count: 0,
        comments: Vec::new(),
    }
}

#[test]
fn missing_file_loads_as_empty_history() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = JsonFileHistoryStore::new(dir.path().join("nested").join("history.json"));

    let loaded = store.load().expect("missing file is not an error");
    assert_eq!(loaded, PersistedHistory::default());
    assert!(loaded.settings.show_history);
}

#[test]
fn saved_document_reloads_with_camel_case_fields() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("vault").join("history.json");
    let store = JsonFileHistoryStore::new(&path);
    let document = PersistedHistory {
        records: vec![record("search_1", "hydraulic pump", 10)],
        settings: HistorySettings {
            include_online: true,
            show_history: true,
        },
    };

    store.save(&document).expect("history saves");
    assert!(!path.with_extension("json.tmp").exists());

    let raw: Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("file exists")).expect("json");
    assert_eq!(raw["records"][0]["responseType"], "single_result");
    assert_eq!(raw["records"][0]["processingTimeMs"], 42);
    assert_eq!(raw["settings"]["includeOnline"], true);

    assert_eq!(store.load().expect("history reloads"), document);
}

#[test]
fn repository_round_trips_only_the_recent_subset() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(JsonFileHistoryStore::new(dir.path().join("history.json")));

    let mut history = HistoryRepository::init(store.clone()).expect("empty history");
    for index in 0..14 {
        history.upsert(record(
            &format!("search_{index}"),
            &format!("model {index}"),
            index,
        ));
    }
    history
        .add_comment("search_13", "ordered spare")
        .expect("record exists");
    history.flush().expect("history flushes");

    let reloaded = HistoryRepository::init(store).expect("history reloads");
    assert_eq!(reloaded.len(), PERSISTED_HISTORY_LIMIT);
    assert_eq!(reloaded.list()[0].id, "search_13");
    assert_eq!(reloaded.list()[0].comments[0].text, "ordered spare");
    assert!(reloaded.get("search_3").is_none());

    let view = reloaded.restore("search_13").expect("restorable");
    assert_eq!(view.response_type, ResponseType::SingleResult);
    assert_eq!(view.product_data, Some(json!({"name": "HP-200", "pressure_bar": 210})));
}

#[test]
fn legacy_rows_without_response_type_still_load() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("history.json");
    std::fs::write(
        &path,
        r#"{"records":[
            {"id":"search_9","query":"HP pump","responseContent":"old answer","timestamp":5},
            {"id":"search_8","query":"valves","selectedProduct":"V-10","timestamp":4}
        ]}"#,
    )
    .expect("fixture written");

    let history =
        HistoryRepository::init(Arc::new(JsonFileHistoryStore::new(&path))).expect("loads");
    assert_eq!(history.len(), 2);
    assert!(!history.settings().include_online);

    let view = history.restore("search_9").expect("plain legacy rows restore as content");
    assert_eq!(view.response_type, ResponseType::Content);
    assert_eq!(view.response_content, "old answer");

    assert!(matches!(
        history.restore("search_8"),
        Err(HistoryError::DisambiguationStale { .. })
    ));
}

#[test]
fn corrupt_file_reports_parse_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("history.json");
    std::fs::write(&path, "{ not json").expect("fixture written");

    let error = JsonFileHistoryStore::new(&path)
        .load()
        .expect_err("corrupt file fails");
    assert!(matches!(error, HistoryError::ParseHistoryFile { .. }));
}
