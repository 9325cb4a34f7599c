use reqchain::engine::Engine;
use reqchain::schema::{GlobalSettings, HttpRequest};
use reqchain::server::{router, AppState};
use reqchain::store::WorkflowStore;
use reqchain::transport::HttpExecutor;
use reqchain::variables::Variables;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn spawn_app(store: WorkflowStore, env_vars: Variables) -> String {
    let state = AppState::new(store, Engine::new(Arc::new(HttpExecutor)), env_vars, GlobalSettings::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn wait_for_finish(client: &reqwest::Client, app: &str, execution_id: &str) -> Value {
    for _ in 0..100 {
        let record: Value = client
            .get(format!("{}/executions/{}", app, execution_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if record["state"] == "finished" {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("execution {} never finished", execution_id);
}

async fn send_json(builder: reqwest::RequestBuilder) -> Value {
    let res = builder.send().await.unwrap();
    assert!(res.status().is_success(), "unexpected status {}", res.status());
    res.json().await.unwrap()
}

#[tokio::test]
async fn creates_and_executes_a_workflow() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t-1"})))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/echo/t-1/blue"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&upstream)
        .await;

    let store = WorkflowStore::new();
    store.upsert_request(HttpRequest::get("token", "{{base_url}}/token"));
    store.upsert_request(HttpRequest::get("echo", "{{base_url}}/echo/{{token}}/{{color}}"));
    let app = spawn_app(store, Variables::from([("base_url".to_string(), upstream.uri())])).await;
    let client = reqwest::Client::new();

    let requests = send_json(client.get(format!("{}/requests", app))).await;
    assert_eq!(requests.as_array().unwrap().len(), 2);

    let created = send_json(
        client
            .post(format!("{}/workflows", app))
            .json(&json!({"collection_id": "c", "name": "Token flow"})),
    )
    .await;
    let id = created["id"].as_str().unwrap().to_string();

    // Added in the wrong order, then moved into place.
    let echo = send_json(
        client
            .post(format!("{}/workflows/{}/steps", app, id))
            .json(&json!({"request_id": "echo", "name": "Echo"})),
    )
    .await;
    let token = send_json(
        client
            .post(format!("{}/workflows/{}/steps", app, id))
            .json(&json!({
                "request_id": "token",
                "name": "Get token",
                "extract": [{"variable": "token", "path": "wrong"}]
            })),
    )
    .await;
    let stray = send_json(
        client
            .post(format!("{}/workflows/{}/steps", app, id))
            .json(&json!({"request_id": "token", "name": "Stray"})),
    )
    .await;
    let token_id = token["id"].as_str().unwrap();
    assert_eq!(token["extract"][0]["path"], "wrong");

    let updated = send_json(
        client
            .put(format!("{}/workflows/{}/steps/{}", app, id, token_id))
            .json(&json!({"extract": [{"variable": "token", "method": "jsonpath", "path": "$.token"}]})),
    )
    .await;
    assert_eq!(updated["steps"][1]["name"], "Get token");
    assert_eq!(updated["steps"][1]["extract"][0]["path"], "$.token");

    let moved = send_json(
        client
            .post(format!("{}/workflows/{}/steps/{}/move", app, id, token_id))
            .json(&json!({"to": 0})),
    )
    .await;
    assert_eq!(moved["steps"][0]["id"], token["id"]);
    assert_eq!(moved["steps"][1]["id"], echo["id"]);

    let removed = send_json(client.delete(format!(
        "{}/workflows/{}/steps/{}",
        app,
        id,
        stray["id"].as_str().unwrap()
    )))
    .await;
    assert_eq!(removed["steps"].as_array().unwrap().len(), 2);

    let with_vars = send_json(
        client
            .put(format!("{}/workflows/{}/variables", app, id))
            .json(&json!({"variables": [
                {"key": "color", "value": "blue"},
                {"key": "unused", "value": "x", "enabled": false}
            ]})),
    )
    .await;
    assert_eq!(with_vars["variables"].as_array().unwrap().len(), 2);

    let started = send_json(
        client
            .post(format!("{}/workflows/{}/execute", app, id))
            .json(&json!({})),
    )
    .await;
    let execution_id = started["execution_id"].as_str().unwrap();

    let record = wait_for_finish(&client, &app, execution_id).await;
    assert_eq!(record["result"]["status"], "success");
    assert_eq!(record["result"]["final_variables"]["token"], "t-1");
    assert_eq!(record["result"]["final_variables"]["color"], "blue");
    assert!(record["result"]["final_variables"].get("unused").is_none());
    assert_eq!(record["result"]["steps"].as_array().unwrap().len(), 2);
    assert!(!record["log"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn step_edits_reject_bad_targets() {
    let store = WorkflowStore::new();
    let wf = store.create_workflow("c", "Edits");
    let step = store.add_step(&wf.id, "token", "Only", Vec::new()).unwrap();
    let app = spawn_app(store, Variables::new()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/workflows/{}/steps/{}/move", app, wf.id, step.id))
        .json(&json!({"to": 3}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);

    let res = client
        .post(format!("{}/workflows/nope/steps/{}/move", app, step.id))
        .json(&json!({"to": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    let res = client
        .put(format!("{}/workflows/{}/steps/missing", app, wf.id))
        .json(&json!({"name": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    let res = client
        .delete(format!("{}/workflows/{}/steps/missing", app, wf.id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    let res = client
        .put(format!("{}/workflows/nope/variables", app))
        .json(&json!({"variables": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn execute_accepts_an_empty_body() {
    let store = WorkflowStore::new();
    let wf = store.create_workflow("c", "Empty");
    let app = spawn_app(store, Variables::new()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/workflows/{}/execute", app, wf.id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let started: Value = res.json().await.unwrap();

    let record = wait_for_finish(&client, &app, started["execution_id"].as_str().unwrap()).await;
    assert_eq!(record["result"]["status"], "success");
}

#[tokio::test]
async fn stop_halts_a_running_execution() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&upstream)
        .await;

    let store = WorkflowStore::new();
    store.upsert_request(HttpRequest::get("slow", "{{base_url}}/slow"));
    let wf = store.create_workflow("c", "Slow");
    for n in 1..=3 {
        store.add_step(&wf.id, "slow", &format!("Slow {}", n), Vec::new()).unwrap();
    }
    let app = spawn_app(store, Variables::from([("base_url".to_string(), upstream.uri())])).await;
    let client = reqwest::Client::new();

    let started = send_json(client.post(format!("{}/workflows/{}/execute", app, wf.id))).await;
    let execution_id = started["execution_id"].as_str().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let res = client
        .post(format!("{}/executions/{}/stop", app, execution_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let stop: Value = res.json().await.unwrap();
    assert_eq!(stop["stopping"], true);

    let record = wait_for_finish(&client, &app, execution_id).await;
    assert_eq!(record["result"]["status"], "stopped");
    // The in-flight request completes; nothing after it is sent.
    assert_eq!(record["result"]["steps"].as_array().unwrap().len(), 1);
    assert_eq!(upstream.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let app = spawn_app(WorkflowStore::new(), Variables::new()).await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{}/workflows/nope", app)).send().await.unwrap();
    assert_eq!(res.status(), 404);

    let res = client
        .post(format!("{}/workflows/nope/execute", app))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);

    let res = client.post(format!("{}/executions/nope/stop", app)).send().await.unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn stop_after_finish_conflicts() {
    let store = WorkflowStore::new();
    let wf = store.create_workflow("c", "Empty");
    let app = spawn_app(store, Variables::new()).await;
    let client = reqwest::Client::new();

    let started: Value = client
        .post(format!("{}/workflows/{}/execute", app, wf.id))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let execution_id = started["execution_id"].as_str().unwrap();
    let record = wait_for_finish(&client, &app, execution_id).await;
    assert_eq!(record["result"]["status"], "success");

    let res = client
        .post(format!("{}/executions/{}/stop", app, execution_id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 409);
}
