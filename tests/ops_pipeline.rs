//! End-to-end pipeline test: config file → wired components → recorded
//! observations → reports → signed webhook delivery with dead-lettering.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use shieldops::canary::CanaryDecision;
use shieldops::config::OpsConfig;
use shieldops::report::Severity;
use shieldops::sla::{DependencyStatus, SlaTarget};
use shieldops::task_queue::{TaskQueue, TaskState};
use shieldops::telemetry::OpsCounters;
use shieldops::webhook::{
    sign_payload, WebhookDeliveryEngine, WebhookError, WebhookTransport, SIGNATURE_HEADER,
};
use shieldops::OpsContext;

/// Transport that fails a configurable number of times, then accepts, while
/// recording every request body + signature it sees.
struct FlakyTransport {
    failures_left: Mutex<u32>,
    seen: Mutex<Vec<(Vec<(String, String)>, Vec<u8>)>>,
}

impl FlakyTransport {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: Mutex::new(failures),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl WebhookTransport for FlakyTransport {
    async fn post(
        &self,
        _url: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> anyhow::Result<u16> {
        self.seen
            .lock()
            .await
            .push((headers.to_vec(), body.to_vec()));
        let mut failures = self.failures_left.lock().await;
        if *failures > 0 {
            *failures -= 1;
            Ok(503)
        } else {
            Ok(200)
        }
    }
}

fn fast_test_config() -> OpsConfig {
    let raw = r#"
        [queue]
        concurrency = 2
        max_retries = 1
        backoff_base_ms = 1
        backoff_max_ms = 5

        [webhook]
        max_attempts = 2
        retry_delay_ms = 1

        [canary]
        min_samples = 3

        [sla]
        min_probes = 4
        escalation_threshold = 3
    "#;
    toml::from_str(raw).expect("test config parses")
}

async fn wait_for_state(queue: &TaskQueue, id: &str, state: TaskState) {
    for _ in 0..400 {
        if queue.get_status(id).await == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} never reached {state:?}");
}

#[tokio::test]
async fn incident_flow_from_probes_to_signed_webhook() {
    let config = fast_test_config();
    let ctx = OpsContext::new(config.clone()).unwrap();

    // Probe a dependency into breach.
    {
        let mut sla = ctx.sla.write().await;
        sla.register_dependency(
            "payments-api",
            SlaTarget {
                uptime_pct: 99.0,
                latency_ms: 100.0,
            },
        )
        .unwrap();
        for _ in 0..3 {
            sla.record_probe("payments-api", true, 50.0).unwrap();
        }
        let status = sla.record_probe("payments-api", false, 50.0).unwrap();
        // 3/4 uptime = 75% < 99% target once min_probes (4) reached.
        assert_eq!(status, DependencyStatus::Breached);
        let report = sla.report();
        assert_eq!(report.worst_severity(), Some(Severity::Warning));
    }

    // Run the report generation as a background task.
    let sla = Arc::clone(&ctx.sla);
    let id = ctx
        .task_queue
        .enqueue("sla-report", move || {
            let sla = Arc::clone(&sla);
            async move {
                let report = sla.read().await.report();
                Ok(serde_json::to_value(&report)?)
            }
        })
        .await;
    wait_for_state(&ctx.task_queue, &id, TaskState::Completed).await;
    let report_json = ctx.task_queue.get_result(&id).await.unwrap().unwrap();
    assert_eq!(report_json["module"], json!("dependency_sla"));

    // Deliver the report through a transport that fails once (one retry
    // is allowed, so delivery succeeds on attempt 2).
    let transport = FlakyTransport::new(1);
    let engine = WebhookDeliveryEngine::with_transport(
        config.webhook.clone(),
        OpsCounters::shared(),
        Arc::clone(&transport) as Arc<dyn WebhookTransport>,
    );
    engine
        .register_endpoint("oncall", "https://hooks.example.test/oncall", "topsecret")
        .await
        .unwrap();
    let receipt = engine
        .deliver("oncall", "sla.breached", &report_json)
        .await
        .unwrap();
    assert_eq!(receipt.attempts, 2);

    // Every request carried a valid signature over the exact body bytes.
    let seen = transport.seen.lock().await;
    assert_eq!(seen.len(), 2);
    for (headers, body) in seen.iter() {
        let sig = headers
            .iter()
            .find(|(name, _)| name == SIGNATURE_HEADER)
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(sig, sign_payload("topsecret", body));
    }
}

#[tokio::test]
async fn exhausted_delivery_is_dead_lettered_and_requeueable() {
    let config = fast_test_config();
    // max_attempts = 2; fail 2 requests, then accept the requeue.
    let transport = FlakyTransport::new(2);
    let engine = WebhookDeliveryEngine::with_transport(
        config.webhook.clone(),
        OpsCounters::shared(),
        Arc::clone(&transport) as Arc<dyn WebhookTransport>,
    );
    engine
        .register_endpoint("oncall", "https://hooks.example.test/oncall", "k")
        .await
        .unwrap();

    let err = engine
        .deliver("oncall", "incident.created", &json!({"incident": 101}))
        .await
        .unwrap_err();
    let WebhookError::Exhausted { dead_letter_id, .. } = err else {
        panic!("expected exhaustion");
    };
    assert_eq!(engine.list_dead_letters().await.len(), 1);

    let receipt = engine.requeue_dead_letter(&dead_letter_id).await.unwrap();
    assert_eq!(receipt.event_type, "incident.created");
    assert!(engine.list_dead_letters().await.is_empty());
}

#[tokio::test]
async fn canary_rollout_decision_over_context() {
    let ctx = OpsContext::new(fast_test_config()).unwrap();
    ctx.start_canary("checkout", "v9.0.0").await;

    let mut canaries = ctx.canaries.write().await;
    let canary = canaries.get_mut("checkout").unwrap();
    canary.record_sample(0.01, 80.0).unwrap();
    canary.record_sample(0.02, 90.0).unwrap();
    assert_eq!(canary.evaluate(), CanaryDecision::Hold);
    canary.record_sample(0.01, 85.0).unwrap();
    assert_eq!(canary.evaluate(), CanaryDecision::Promote);
    canary.promote().unwrap();
    assert!(canary.record_sample(0.01, 85.0).is_err());
}

#[tokio::test]
async fn config_file_drives_component_tuning() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shieldops.toml");
    std::fs::write(
        &path,
        "[cache_effectiveness]\nwarn_hit_rate = 0.95\nmax_records = 8\n",
    )
    .unwrap();

    let config = OpsConfig::load(&path).unwrap();
    let ctx = OpsContext::new(config).unwrap();

    let mut analyzer = ctx.cache_effectiveness.write().await;
    for _ in 0..9 {
        analyzer
            .record_lookup(
                "sessions",
                shieldops::analyzers::cache_effectiveness::CacheOutcome::Hit,
                12.0,
            )
            .unwrap();
    }
    analyzer
        .record_lookup(
            "sessions",
            shieldops::analyzers::cache_effectiveness::CacheOutcome::Miss,
            40.0,
        )
        .unwrap();
    // Capacity 8 from the file, not the default 5000.
    assert_eq!(analyzer.record_count(), 8);

    let report = analyzer.generate_report();
    // 0.95 warn threshold flags what default config would accept.
    assert_eq!(report.worst_severity(), Some(Severity::Warning));
    assert!(report.render().contains("sessions"));
}
