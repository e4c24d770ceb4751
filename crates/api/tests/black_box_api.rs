use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use kitsu_api::app::services::AppServices;
use kitsu_infra::config::Settings;
use kitsu_infra::coordinator::InMemoryCoordinator;
use reqwest::StatusCode;
use serde_json::Value;

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(&[]).await
    }

    async fn spawn_with(vars: &[(&str, &str)]) -> Self {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let settings = Settings::from_lookup(|k| vars.get(k).cloned()).expect("settings");
        let services = Arc::new(AppServices::new(&settings, Arc::new(InMemoryCoordinator::new())));

        // Same router as prod, bound to an ephemeral port.
        let app = kitsu_api::app::build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });

        Self {
            base_url,
            services,
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

async fn job_status_eventually(client: &reqwest::Client, server: &TestServer, key: &str, want: &str) {
    for _ in 0..50 {
        let body: Value = client
            .get(server.url(&format!("/admin/jobs/{}", key)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        if body["status"] == want {
            return;
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    panic!("job {key} never reached {want}");
}

#[tokio::test]
async fn health_reports_coordinator() {
    let server = TestServer::spawn().await;

    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["coordinator"], "up");
}

#[tokio::test]
async fn unknown_job_has_null_status() {
    let server = TestServer::spawn().await;

    let body: Value = reqwest::get(server.url("/admin/jobs/nothing-here"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["key"], "nothing-here");
    assert!(body["status"].is_null());
}

#[tokio::test]
async fn blank_job_key_is_rejected() {
    let server = TestServer::spawn().await;

    let res = reqwest::get(server.url("/admin/jobs/%20")).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_job_key");
}

#[tokio::test]
async fn scheduler_is_idle_until_started() {
    let server = TestServer::spawn().await;

    let body: Value = reqwest::get(server.url("/admin/parser/autoupdate"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["running"], false);

    assert!(server.services.start().await);

    let body: Value = reqwest::get(server.url("/admin/parser/autoupdate"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["running"], true);

    server.services.shutdown().await;
}

#[tokio::test]
async fn unforced_run_reports_disabled() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/admin/parser/autoupdate/run?force=false"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"status": "disabled", "interval_minutes": 60}));
}

#[tokio::test]
async fn forced_run_enqueues_a_job() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(server.url("/admin/parser/autoupdate/run"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "enqueued");
    assert_eq!(body["interval_minutes"], 60);
    let key = body["job_key"].as_str().expect("job_key").to_string();
    assert!(key.starts_with("parser:autoupdate:"));

    job_status_eventually(&client, &server, &key, "succeeded").await;

    let stats: Value = client
        .get(server.url("/admin/jobs/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["enqueued"], 1);
    assert_eq!(stats["succeeded"], 1);
    assert_eq!(stats["worker_id"].as_str().map(str::len), Some(8));
}

async fn lock_out(server: &TestServer, ip: &str) {
    let limiter = &server.services.auth_rate_limit;
    let key = limiter
        .check_login_rate_limit("user@example.com", Some(ip))
        .await
        .unwrap();
    for _ in 0..5 {
        limiter.record_login_failure(&key).await;
    }
}

async fn login_status(client: &reqwest::Client, server: &TestServer, forwarded_for: &str) -> reqwest::Response {
    client
        .get(server.url("/auth/rate-limit/login?email=User@Example.com"))
        .header("X-Forwarded-For", forwarded_for)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn login_limit_is_per_client_ip_behind_a_trusted_proxy() {
    let server = TestServer::spawn_with(&[("KITSU_TRUSTED_PROXIES", "127.0.0.1")]).await;
    let client = reqwest::Client::new();
    lock_out(&server, "1.2.3.1").await;

    let res = login_status(&client, &server, "1.2.3.1").await;
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "rate_limited");
    assert_eq!(body["message"], "Too many attempts, try again later");

    let res = login_status(&client, &server, "1.2.3.2").await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"attempts": 0, "max_attempts": 5}));
}

#[tokio::test]
async fn forwarded_for_cannot_dodge_the_limit_without_a_trusted_proxy() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    lock_out(&server, "127.0.0.1").await;

    for n in 1..=5 {
        let res = login_status(&client, &server, &format!("198.51.100.{n}")).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}

#[tokio::test]
async fn oversized_forwarded_for_falls_back_to_the_peer() {
    let server = TestServer::spawn_with(&[("KITSU_TRUSTED_PROXIES", "127.0.0.1")]).await;
    let client = reqwest::Client::new();
    lock_out(&server, "127.0.0.1").await;

    let junk = "x".repeat(4096);
    let res = login_status(&client, &server, &junk).await;
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn login_limit_requires_an_email() {
    let server = TestServer::spawn().await;

    let res = reqwest::get(server.url("/auth/rate-limit/login?email=")).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn settings_update_is_seen_by_the_next_run() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(server.url("/admin/parser/autoupdate/run?force=false"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "disabled");

    let res = client
        .post(server.url("/admin/parser/settings"))
        .json(&serde_json::json!({"enable_autoupdate": true, "update_interval_minutes": 15}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"enable_autoupdate": true, "update_interval_minutes": 15}));

    let body: Value = reqwest::get(server.url("/admin/parser/settings"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["enable_autoupdate"], true);

    let body: Value = client
        .post(server.url("/admin/parser/autoupdate/run?force=false"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "enqueued");
    assert_eq!(body["interval_minutes"], 15);
}

#[tokio::test]
async fn settings_reject_a_non_positive_interval() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/admin/parser/settings"))
        .json(&serde_json::json!({"update_interval_minutes": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let body: Value = reqwest::get(server.url("/admin/parser/settings"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["update_interval_minutes"], 60);
}
