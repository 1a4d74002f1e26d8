//! End-to-end missions against a hub on a loopback listener.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use starlight_client::{ClientError, IntentClient, SentinelOptions, SentinelSession};
use starlight_driver::scripted::{ScriptedElement, ScriptedPage};
use starlightd::{serve, Config, Hub, ShutdownCause};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct Harness {
    hub: Arc<Hub>,
    url: String,
    server: JoinHandle<anyhow::Result<()>>,
    dir: TempDir,
}

impl Harness {
    async fn start(page: ScriptedPage, consensus_timeout_ms: u64) -> Self {
        Self::start_with(page, consensus_timeout_ms, |_| {}).await
    }

    async fn start_with(page: ScriptedPage, consensus_timeout_ms: u64, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.history = dir.path().join("memory.json");
        config.paths.audit = dir.path().join("audit.ndjson");
        config.paths.trace = dir.path().join("trace.json");
        config.paths.report = dir.path().join("report.json");
        config.paths.screenshots = dir.path().join("screenshots");
        config.security.audit_key = Some("mission-key".to_string());
        config.hub.settle_delay_ms = 0;
        config.hub.ack_delay_ms = 0;
        config.hub.attempt_timeout_ms = 500;
        config.hub.stabilization_pause_ms = 5;
        config.hub.consensus_timeout_ms = consensus_timeout_ms;
        tweak(&mut config);

        let hub = Arc::new(Hub::new(config, Arc::new(page)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(serve(hub.clone(), listener));
        Self { hub, url, server, dir }
    }

    async fn finish(self) -> (Vec<Value>, TempDir) {
        self.hub.shutdown("test over", ShutdownCause::Requested).await;
        self.server.await.unwrap().unwrap();
        let body = std::fs::read_to_string(self.dir.path().join("trace.json")).unwrap();
        (serde_json::from_str(&body).unwrap(), self.dir)
    }
}

fn kinds(trace: &[Value]) -> Vec<String> {
    trace
        .iter()
        .map(|event| event["type"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn lone_client_navigates_and_clicks() {
    let page = ScriptedPage::new("about:blank")
        .with_element(ScriptedElement::button("#submit", "Submit").navigates_to("https://shop.test/done"));
    let harness = Harness::start(page.clone(), 5_000).await;

    let mut client = IntentClient::connect(&harness.url).await.unwrap();
    let outcome = client.goto("https://shop.test/cart").await.unwrap();
    assert!(outcome.success);
    let outcome = client.click("Submit").await.unwrap();
    assert!(outcome.success, "click failed: {:?}", outcome.error);
    assert_eq!(outcome.result.selector.as_deref(), Some("#submit"));
    client.close().await.unwrap();

    assert_eq!(page.url(), "https://shop.test/done");
    let (trace, _dir) = harness.finish().await;
    assert_eq!(kinds(&trace), vec!["COMMAND", "COMMAND"]);
}

#[tokio::test]
async fn quorum_of_two_clears_before_the_timeout() {
    let page = ScriptedPage::new("https://shop.test/cart")
        .with_element(ScriptedElement::button("#submit", "Submit").navigates_to("https://shop.test/done"));
    let harness = Harness::start(page, 10_000).await;

    let mut voters = Vec::new();
    for layer in ["janitor", "vision"] {
        let mut session = SentinelSession::connect(&harness.url, SentinelOptions::new(layer))
            .await
            .unwrap();
        voters.push(tokio::spawn(async move {
            let pre_check = session
                .next_pre_check(Duration::from_secs(5))
                .await
                .unwrap()
                .expect("pre_check broadcast");
            session.clear(Some(&pre_check.id)).await.unwrap();
            pre_check
        }));
    }
    assert_eq!(harness.hub.health().await.sentinels, 2);

    let mut client = IntentClient::connect(&harness.url).await.unwrap();
    let started = Instant::now();
    let outcome = client.click("Submit").await.unwrap();
    assert!(outcome.success);
    assert!(started.elapsed() < Duration::from_secs(5));

    for voter in voters {
        let pre_check = voter.await.unwrap();
        assert_eq!(pre_check.command, "click");
        assert_eq!(pre_check.url, "https://shop.test/cart");
    }
    let (trace, _dir) = harness.finish().await;
    assert_eq!(kinds(&trace), vec!["COMMAND"]);
}

#[tokio::test]
async fn hijack_repairs_the_page_then_resumes() {
    let page = ScriptedPage::new("https://shop.test/cart")
        .with_element(ScriptedElement::button(".accept", "Accept cookies"))
        .with_element(ScriptedElement::button("#submit", "Submit").navigates_to("https://shop.test/done"));
    let harness = Harness::start(page.clone(), 10_000).await;

    let mut janitor = SentinelSession::connect(&harness.url, SentinelOptions::new("janitor"))
        .await
        .unwrap();
    let repair = tokio::spawn(async move {
        let pre_check = janitor
            .next_pre_check(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("pre_check broadcast");
        janitor.hijack(Some(&pre_check.id), "cookie banner").await.unwrap();
        janitor.click(".accept").await.unwrap();
        janitor.resume(Some(&pre_check.id), false).await.unwrap();
        janitor
    });

    let mut client = IntentClient::connect(&harness.url).await.unwrap();
    let outcome = client.click("Submit").await.unwrap();
    assert!(outcome.success);
    let _janitor = repair.await.unwrap();

    let actions = page.actions();
    let accept = actions.iter().position(|a| a.contains(".accept")).expect("repair click");
    let submit = actions.iter().position(|a| a.contains("#submit")).expect("submit click");
    assert!(accept < submit);

    let (trace, _dir) = harness.finish().await;
    assert_eq!(kinds(&trace), vec!["HIJACK", "SENTINEL_ACTION", "RECOVERY", "COMMAND"]);
    assert_eq!(trace[0]["detail"], "cookie banner");
    assert_eq!(trace[0]["actor"], "janitor");
    assert_eq!(trace[1]["success"], true);
    assert!(trace[2]["latencyMs"].is_u64());
}

#[tokio::test]
async fn audit_log_never_holds_raw_email() {
    let harness = Harness::start(ScriptedPage::new("https://shop.test/"), 5_000).await;

    let mut client = IntentClient::connect(&harness.url).await.unwrap();
    client
        .send_raw(r#"{"id":"x1","method":"starlight.intent","params":{"cmd":"click","goal":"user@example.com"}}"#)
        .await
        .unwrap();
    let outcome = client.fill("Email user@example.com", "user@example.com").await.unwrap();
    assert!(!outcome.success);
    client.close().await.unwrap();

    let (trace, dir) = harness.finish().await;
    let audit = std::fs::read_to_string(dir.path().join("audit.ndjson")).unwrap();
    assert!(audit.contains("starlight.intent"));
    assert!(audit.contains("SECURITY_EVENT"));
    assert!(!audit.contains("user@example.com"));

    let report = std::fs::read_to_string(dir.path().join("report.json")).unwrap();
    assert!(!report.contains("user@example.com"));
    assert!(!serde_json::to_string(&trace).unwrap().contains("user@example.com"));
}

fn submit_page() -> ScriptedPage {
    ScriptedPage::new("https://shop.test/cart")
        .with_element(ScriptedElement::button("#submit", "Submit").navigates_to("https://shop.test/done"))
}

async fn sentinels(url: &str, layers: &[&str]) -> Vec<SentinelSession> {
    let mut out = Vec::new();
    for layer in layers {
        out.push(SentinelSession::connect(url, SentinelOptions::new(*layer)).await.unwrap());
    }
    out
}

async fn wait_for_sentinels(hub: &Hub, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while hub.health().await.sentinels != count {
        assert!(Instant::now() < deadline, "sentinel count never reached {count}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn departed_sentinel_no_longer_counts_toward_quorum() {
    let harness = Harness::start(submit_page(), 10_000).await;
    let mut voters = sentinels(&harness.url, &["janitor", "vision", "pulse"]).await;
    let leaver = voters.pop().unwrap();
    let mut second = voters.pop().unwrap();
    let mut first = voters.pop().unwrap();

    let url = harness.url.clone();
    let started = Instant::now();
    let intent = tokio::spawn(async move {
        let mut client = IntentClient::connect(&url).await.unwrap();
        client.click("Submit").await.unwrap()
    });

    let round = first.next_pre_check(Duration::from_secs(5)).await.unwrap().unwrap();
    first.clear(Some(&round.id)).await.unwrap();
    leaver.close().await.unwrap();
    wait_for_sentinels(&harness.hub, 2).await;
    let round = second.next_pre_check(Duration::from_secs(5)).await.unwrap().unwrap();
    second.clear(Some(&round.id)).await.unwrap();

    let outcome = intent.await.unwrap();
    assert!(outcome.success);
    assert!(started.elapsed() < Duration::from_secs(5));
    harness.finish().await;
}

#[tokio::test]
async fn last_missing_voter_leaving_releases_the_round() {
    let harness = Harness::start(submit_page(), 10_000).await;
    let mut voters = sentinels(&harness.url, &["janitor", "vision", "pulse"]).await;
    let mut leaver = voters.pop().unwrap();

    let url = harness.url.clone();
    let started = Instant::now();
    let intent = tokio::spawn(async move {
        let mut client = IntentClient::connect(&url).await.unwrap();
        client.click("Submit").await.unwrap()
    });

    for voter in voters.iter_mut() {
        let round = voter.next_pre_check(Duration::from_secs(5)).await.unwrap().unwrap();
        voter.clear(Some(&round.id)).await.unwrap();
    }
    leaver.next_pre_check(Duration::from_secs(5)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!intent.is_finished());
    leaver.close().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), intent)
        .await
        .expect("intent released by the departure")
        .unwrap();
    assert!(outcome.success);
    assert!(started.elapsed() < Duration::from_secs(5));
    harness.finish().await;
}

#[tokio::test]
async fn sentinel_signing_with_the_shared_secret_registers() {
    let secret = "mission-jwt-secret-32-characters!";
    let harness = Harness::start_with(ScriptedPage::new("https://shop.test/"), 5_000, |config| {
        config.security.jwt_secret = Some(secret.to_string());
    })
    .await;

    let session = SentinelSession::connect(
        &harness.url,
        SentinelOptions::new("janitor").with_jwt_secret(secret),
    )
    .await
    .unwrap();
    assert_eq!(session.layer(), "janitor");

    let refused = SentinelSession::connect(
        &harness.url,
        SentinelOptions::new("vision").with_jwt_secret("a-different-secret-entirely-0000"),
    )
    .await;
    assert!(matches!(refused, Err(ClientError::Rejected { .. })));
    assert_eq!(harness.hub.health().await.sentinels, 1);
    harness.finish().await;
}
