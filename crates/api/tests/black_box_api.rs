use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use commitpulse_api::app::services::{AppServices, Collaborators};
use commitpulse_core::AccountId;
use commitpulse_infra::config::JobSystemConfig;
use commitpulse_infra::jobs::{FetchDiffData, HandlerError};
use commitpulse_infra::pipeline::{
    DiffProvider, DiffStatSummaryGenerator, InMemoryCommitStore, InMemoryCreditLedger,
    LogEmailSender,
};

const BILLING_URL: &str = "https://billing.example.com/upgrade";

const DIFF: &str = "\
diff --git a/src/main.rs b/src/main.rs
--- a/src/main.rs
+++ b/src/main.rs
@@ -1 +1,2 @@
-fn main() {}
+fn main() { run(); }
+fn run() {}
";

struct FixedDiff;

#[async_trait]
impl DiffProvider for FixedDiff {
    async fn fetch_diff(&self, _request: &FetchDiffData) -> Result<String, HandlerError> {
        Ok(DIFF.to_string())
    }
}

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    ledger: Arc<InMemoryCreditLedger>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let config = JobSystemConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_billing_url(BILLING_URL);

        let ledger = Arc::new(InMemoryCreditLedger::new());
        let collaborators = Collaborators {
            ledger: ledger.clone(),
            diffs: Arc::new(FixedDiff),
            summaries: Arc::new(DiffStatSummaryGenerator),
            emails: Arc::new(LogEmailSender),
            commits: Arc::new(InMemoryCommitStore::new()),
        };
        let services = Arc::new(AppServices::in_memory(config, collaborators));

        // Same router as prod, bound to an ephemeral port.
        let app = commitpulse_api::app::router(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            ledger,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn fetch_diff_job(priority: i32) -> Value {
    json!({
        "type": "fetch_diff",
        "data": { "owner": "octo", "repo": "hello", "sha": "abc1234" },
        "priority": priority
    })
}

async fn create_job(client: &reqwest::Client, server: &TestServer, body: Value) -> Value {
    let res = client
        .post(server.url("/jobs"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

fn commit_request(account_id: AccountId) -> Value {
    json!({
        "account_id": account_id,
        "project_id": uuid::Uuid::now_v7(),
        "owner": "octo",
        "repo": "hello",
        "sha": "abc1234def",
        "message": "Add run entrypoint",
        "author": "mona",
        "branch": "main"
    })
}

async fn wait_for_status(
    client: &reqwest::Client,
    server: &TestServer,
    id: &str,
    status: &str,
) -> Value {
    for _ in 0..200 {
        let job: Value = client
            .get(server.url(&format!("/jobs/{id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        if job["status"] == status {
            return job;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {id} did not reach {status} within timeout");
}

#[tokio::test]
async fn health_is_public_and_reports_job_system() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["job_system_running"], false);
}

#[tokio::test]
async fn create_then_get_job_round_trips() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let created = create_job(&client, &server, fetch_diff_job(5)).await;
    assert_eq!(created["type"], "fetch_diff");
    assert_eq!(created["status"], "pending");
    assert_eq!(created["attempts"], 0);
    assert_eq!(created["max_attempts"], 3);

    let id = created["id"].as_str().unwrap();
    let res = client
        .get(server.url(&format!("/jobs/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let fetched: Value = res.json().await.unwrap();
    assert_eq!(fetched["id"], created["id"]);
    assert_eq!(fetched["data"]["sha"], "abc1234");
}

#[tokio::test]
async fn invalid_payloads_and_ids_are_rejected() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/jobs"))
        .json(&json!({ "type": "fetch_diff", "data": { "owner": "octo", "repo": "hello", "sha": "nothex!" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(server.url("/jobs"))
        .json(&json!({ "type": "render_video", "data": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.get(server.url("/jobs/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");

    let res = client
        .get(server.url(&format!("/jobs/{}", uuid::Uuid::now_v7())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(server.url("/jobs?status=sleeping"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dependency_cycle_is_a_conflict() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let a = create_job(&client, &server, fetch_diff_job(0)).await;
    let b = create_job(&client, &server, fetch_diff_job(0)).await;
    let (a, b) = (a["id"].as_str().unwrap(), b["id"].as_str().unwrap());

    let res = client
        .post(server.url(&format!("/jobs/{b}/dependencies")))
        .json(&json!({ "depends_on_id": a }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let res = client
        .post(server.url(&format!("/jobs/{a}/dependencies")))
        .json(&json!({ "depends_on_id": b }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "dependency_cycle");

    let deps: Value = client
        .get(server.url(&format!("/jobs/{b}/dependencies")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deps.as_array().unwrap().len(), 1);
    assert_eq!(deps[0]["depends_on_job_id"], a);

    let res = client
        .delete(server.url(&format!("/jobs/{b}/dependencies/{a}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .delete(server.url(&format!("/jobs/{b}/dependencies/{a}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ready_queue_orders_by_priority_and_skips_blocked_jobs() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let low = create_job(&client, &server, fetch_diff_job(1)).await;
    let high = create_job(&client, &server, fetch_diff_job(90)).await;
    let blocked = create_job(&client, &server, fetch_diff_job(100)).await;

    let res = client
        .post(server.url(&format!("/jobs/{}/dependencies", blocked["id"].as_str().unwrap())))
        .json(&json!({ "depends_on_id": low["id"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let ready: Value = client
        .get(server.url("/queue/ready?limit=10"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let ids: Vec<&Value> = ready.as_array().unwrap().iter().map(|j| &j["id"]).collect();
    assert_eq!(ids, vec![&high["id"], &low["id"]]);

    let stats: Value = client
        .get(server.url("/queue/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total"], 3);
    assert_eq!(stats["processor"]["processed"], 0);
}

#[tokio::test]
async fn failing_a_job_is_terminal() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let job = create_job(&client, &server, fetch_diff_job(0)).await;
    let id = job["id"].as_str().unwrap();

    let res = client
        .post(server.url(&format!("/jobs/{id}/fail")))
        .json(&json!({ "message": "cancelled by operator" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let failed: Value = res.json().await.unwrap();
    assert_eq!(failed["status"], "failed");
    assert_eq!(failed["error_message"], "cancelled by operator");

    let res = client
        .post(server.url(&format!("/jobs/{id}/fail")))
        .json(&json!({ "message": "cancelled twice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "job_finished");

    let ready: Value = client
        .get(server.url("/queue/ready"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ready.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn pipeline_without_credits_is_payment_required() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/pipelines/commits"))
        .json(&commit_request(AccountId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PAYMENT_REQUIRED);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "insufficient_credits");
    assert_eq!(body["billing_url"], BILLING_URL);

    let stats: Value = client
        .get(server.url("/queue/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total"], 0);
}

#[tokio::test]
async fn admitted_pipeline_runs_to_completion() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let account = AccountId::new();
    server.ledger.set_balance(account, 10);

    let res = client
        .post(server.url("/pipelines/commits"))
        .json(&commit_request(account))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let jobs: Value = res.json().await.unwrap();
    assert_eq!(jobs["fetch_diff"]["priority"], 70);
    assert_eq!(jobs["generate_summary"]["priority"], 60);
    assert!(jobs["send_email"].is_null());

    server.services.system.start().await;

    let summary_id = jobs["generate_summary"]["id"].as_str().unwrap();
    let summary = wait_for_status(&client, &server, summary_id, "completed").await;
    assert!(summary["result"]["summary_length"].as_u64().unwrap() > 0);

    let fetch_id = jobs["fetch_diff"]["id"].as_str().unwrap();
    let fetch = wait_for_status(&client, &server, fetch_id, "completed").await;
    assert_eq!(fetch["result"]["stats"]["files_changed"], 1);
    assert_eq!(fetch["result"]["stats"]["additions"], 2);
    assert_eq!(fetch["result"]["stats"]["deletions"], 1);

    server.services.system.stop().await;
}

#[tokio::test]
async fn digest_without_eligible_commits_creates_nothing() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/pipelines/digests"))
        .json(&json!({
            "project_id": uuid::Uuid::now_v7(),
            "recipients": ["team@example.com"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["outcome"], "no_eligible_commits");
}
