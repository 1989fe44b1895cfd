use std::sync::Arc;
use std::time::Duration;

use convo_core::ConvoClient;
use convod::config::EngineConfig;
use convod::sync::dispatcher::QueryDispatcher;
use convod::sync::engine::SyncEngine;
use convod::sync::store::Store;
use convod::tools::ToolService;
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn conversation(id: &str, updated_at: i64, state: &str) -> Value {
    json!({
        "type": "conversation",
        "id": id,
        "created_at": updated_at - 60,
        "updated_at": updated_at,
        "state": state,
        "title": format!("Conversation {id}"),
        "tags": { "type": "tag.list", "tags": [{ "type": "tag", "name": "billing" }] }
    })
}

async fn service(server: &MockServer, config: EngineConfig) -> (ToolService, Arc<SyncEngine>) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Store::from_pool(pool);
    store.init().await.unwrap();
    let client = ConvoClient::with_base_url(&server.uri(), "test-token").unwrap();
    let engine = SyncEngine::open(config, store, client).await.unwrap();
    let tools = ToolService::new(QueryDispatcher::new(Arc::clone(&engine)));
    (tools, engine)
}

fn config() -> EngineConfig {
    EngineConfig {
        rate_limit_per_minute: 600_000,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        coalesce_window: Duration::from_millis(20),
        sync_wait: Duration::from_secs(5),
        ..EngineConfig::default()
    }
}

async fn mount_search(server: &MockServer, records: Vec<Value>) {
    Mock::given(method("POST"))
        .and(path("/conversations/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "conversations": records,
            "pages": { "next": null }
        })))
        .mount(server)
        .await;
}

async fn wait_idle(engine: &SyncEngine) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.active_job_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("jobs did not drain");
}

#[tokio::test]
async fn search_reports_records_and_freshness() {
    let server = MockServer::start().await;
    let now = now();
    mount_search(
        &server,
        vec![
            conversation("1", now - 7_200, "open"),
            conversation("2", now - 3_600, "closed"),
        ],
    )
    .await;
    let (tools, _engine) = service(&server, config()).await;

    let all = tools
        .call("search", json!({ "timeframe": { "last_days": 7 } }))
        .await
        .unwrap();
    assert_eq!(all["records"].as_array().unwrap().len(), 2);
    assert_eq!(all["records"][0]["id"], "2");
    assert_eq!(all["records"][0]["tags"], json!(["billing"]));
    assert_eq!(all["freshness"]["syncing"], false);
    assert!(all["freshness"]["as_of"].as_str().unwrap().ends_with('Z'));
    assert_eq!(all["truncated"], false);

    let open = tools
        .call(
            "search",
            json!({
                "timeframe": { "last_days": 7 },
                "filters": { "state": "open", "tag": "billing" },
                "limit": 10
            }),
        )
        .await
        .unwrap();
    assert_eq!(open["records"].as_array().unwrap().len(), 1);
    assert_eq!(open["records"][0]["id"], "1");
}

#[tokio::test]
async fn oversized_results_are_shaped() {
    let server = MockServer::start().await;
    let now = now();
    mount_search(
        &server,
        (0..5)
            .map(|i| conversation(&i.to_string(), now - 1_000 + i, "open"))
            .collect(),
    )
    .await;
    let (tools, _engine) = service(
        &server,
        EngineConfig {
            max_response_bytes: 400,
            ..config()
        },
    )
    .await;

    let response = tools
        .call("search", json!({ "timeframe": { "last_days": 1 } }))
        .await
        .unwrap();
    let kept = response["records"].as_array().unwrap().len();
    let omitted = response["omitted"].as_u64().unwrap() as usize;

    assert_eq!(response["truncated"], true);
    assert!(omitted >= 1);
    assert_eq!(kept + omitted, 5);
    assert!(serde_json::to_vec(&response).unwrap().len() <= 400);
}

#[tokio::test]
async fn get_by_id_syncs_missing_records_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/conversations/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(conversation("42", 1_704_067_200, "snoozed")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/conversations/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    let (tools, engine) = service(&server, config()).await;

    let record = tools.get_by_id("42").await.unwrap();
    assert_eq!(record.updated_at, 1_704_067_200);
    assert_eq!(tools.get_by_id("42").await.unwrap(), record);
    assert!(engine.store().get("42").await.unwrap().is_some());

    for _ in 0..2 {
        let err = tools.get_by_id("missing").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}

#[tokio::test]
async fn status_and_trigger_sync_reflect_engine_state() {
    let server = MockServer::start().await;
    mount_search(&server, vec![conversation("1", now() - 60, "open")]).await;
    let (tools, engine) = service(&server, config()).await;

    let status = tools.call("sync_status", Value::Null).await.unwrap();
    assert_eq!(
        status["streams"]["conversations"]["covered_ranges"],
        json!([])
    );

    let triggered = tools
        .call("trigger_sync", json!({ "timeframe": { "last_days": 2 } }))
        .await
        .unwrap();
    assert_eq!(triggered["job_ids"].as_array().unwrap().len(), 1);
    assert_eq!(triggered["gaps"].as_array().unwrap().len(), 1);
    wait_idle(&engine).await;

    let status = tools.call("sync_status", Value::Null).await.unwrap();
    let stream = &status["streams"]["conversations"];
    assert_eq!(stream["covered_ranges"].as_array().unwrap().len(), 1);
    assert!(stream["last_verified_at"].is_i64());
    assert_eq!(stream["active_jobs"], json!([]));
    assert_eq!(status["metrics"]["jobs_started"], 1);
    assert_eq!(status["metrics"]["records_applied"], 1);

    let again = tools
        .call("trigger_sync", json!({ "timeframe": { "last_days": 1 } }))
        .await
        .unwrap();
    assert_eq!(again["job_ids"], json!([]));

    let forced = tools
        .call(
            "trigger_sync",
            json!({ "timeframe": { "last_days": 1 }, "force": true }),
        )
        .await
        .unwrap();
    assert_eq!(forced["job_ids"].as_array().unwrap().len(), 1);
    wait_idle(&engine).await;
}

#[tokio::test]
async fn bad_calls_map_to_error_codes() {
    let server = MockServer::start().await;
    let (tools, _engine) = service(&server, config()).await;

    let unknown = tools.call("delete_everything", json!({})).await.unwrap_err();
    assert_eq!(unknown.code(), "not_found");

    let malformed = tools.call("search", json!({ "limit": 5 })).await.unwrap_err();
    assert_eq!(malformed.code(), "invalid_arguments");

    let zero_width = tools
        .call("search", json!({ "timeframe": { "start": 1_000, "end": 1_000 } }))
        .await
        .unwrap_err();
    assert_eq!(zero_width.code(), "invalid_interval");
    assert!(server.received_requests().await.unwrap().is_empty());
}
