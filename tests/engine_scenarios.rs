use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zsentinel::clock::MockClock;
use zsentinel::detection::{
    AnomalyLabel, AnomalyModel, DetectionPipeline, ThreatModel, ThreatPrediction, UntrainedModel,
};
use zsentinel::features::WINDOW_FEATURE_DIM;
use zsentinel::protection::{Alert, Alerter, DecisionEngine, Enforcer, EngineSettings};
use zsentinel::{EngineError, FeatureVector, PacketInfo, Report, Result, ThreatType};

/// Signale une anomalie dès qu'une dimension dépasse 0.5
struct ThresholdAnomaly;

impl AnomalyModel for ThresholdAnomaly {
    fn is_trained(&self) -> bool {
        true
    }
    fn dimension(&self) -> Option<usize> {
        Some(WINDOW_FEATURE_DIM)
    }
    fn predict(&self, vector: &FeatureVector) -> Result<AnomalyLabel> {
        if vector.as_slice().iter().any(|v| *v > 0.5) {
            Ok(AnomalyLabel::Anomaly)
        } else {
            Ok(AnomalyLabel::Normal)
        }
    }
}

/// Classe « Port Scan » à la confiance donnée par la première dimension
struct PortScanClassifier;

impl ThreatModel for PortScanClassifier {
    fn is_trained(&self) -> bool {
        true
    }
    fn dimension(&self) -> Option<usize> {
        Some(WINDOW_FEATURE_DIM)
    }
    fn predict(&self, vector: &FeatureVector) -> Result<ThreatPrediction> {
        let confidence = vector.as_slice()[0];
        let rest = (1.0 - confidence) / 4.0;
        Ok(ThreatPrediction {
            label: 1,
            probabilities: vec![rest, confidence, rest, rest, rest],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Call {
    Block(IpAddr),
    Unblock(IpAddr),
}

#[derive(Default)]
struct RecordingEnforcer {
    calls: Mutex<Vec<Call>>,
    fail_blocks: AtomicBool,
    fail_unblocks: AtomicBool,
}

impl RecordingEnforcer {
    fn blocks(&self, ip: IpAddr) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == Call::Block(ip)).count()
    }

    fn unblocks(&self, ip: IpAddr) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == Call::Unblock(ip)).count()
    }

    fn total_blocks(&self) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches!(c, Call::Block(_))).count()
    }
}

#[async_trait]
impl Enforcer for RecordingEnforcer {
    async fn block(&self, ip: IpAddr) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Block(ip));
        // Laisse les autres tâches s'intercaler pendant l'appel externe
        tokio::task::yield_now().await;
        if self.fail_blocks.load(Ordering::SeqCst) {
            return Err(EngineError::EnforcementFailure {
                ip,
                message: "chaîne introuvable".into(),
            });
        }
        Ok(())
    }

    async fn unblock(&self, ip: IpAddr) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Unblock(ip));
        tokio::task::yield_now().await;
        if self.fail_unblocks.load(Ordering::SeqCst) {
            return Err(EngineError::EnforcementFailure {
                ip,
                message: "permission refusée".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingAlerter {
    alerts: Mutex<Vec<Alert>>,
    reports: Mutex<Vec<Report>>,
}

impl Alerter for RecordingAlerter {
    fn notify(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }

    fn record(&self, report: Report) {
        self.reports.lock().unwrap().push(report);
    }
}

struct Harness {
    clock: Arc<MockClock>,
    enforcer: Arc<RecordingEnforcer>,
    alerter: Arc<RecordingAlerter>,
    engine: Arc<DecisionEngine>,
}

fn harness() -> Harness {
    let clock = Arc::new(MockClock::at_unix(1_700_000_000));
    let enforcer = Arc::new(RecordingEnforcer::default());
    let alerter = Arc::new(RecordingAlerter::default());
    let engine = DecisionEngine::new(
        EngineSettings::default(),
        DetectionPipeline::new(Arc::new(ThresholdAnomaly), Arc::new(PortScanClassifier)),
        enforcer.clone(),
        alerter.clone(),
        clock.clone(),
    );
    Harness {
        clock,
        enforcer,
        alerter,
        engine: Arc::new(engine),
    }
}

fn attack_vector(confidence: f64) -> FeatureVector {
    let mut values = vec![0.0; WINDOW_FEATURE_DIM];
    values[0] = confidence;
    FeatureVector::new(values)
}

fn source(ip: IpAddr) -> PacketInfo {
    PacketInfo::from_source(ip)
}

fn attacker() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))
}

#[tokio::test]
async fn test_normal_traffic_is_never_blocked() {
    let h = harness();
    let mut rng = StdRng::seed_from_u64(42);

    for i in 0..100u8 {
        let values = (0..WINDOW_FEATURE_DIM).map(|_| rng.random_range(0.0..0.1)).collect();
        let info = source(IpAddr::V4(Ipv4Addr::new(192, 168, 0, i)));
        let result = h.engine.analyze(&FeatureVector::new(values), &info).await.unwrap();
        assert!(!result.is_anomaly);
        assert_eq!(result.threat_type, ThreatType::Normal);
        assert_eq!(result.confidence, 0.0);
    }

    let status = h.engine.status().await;
    assert_eq!(status.blocked_count, 0);
    assert_eq!(status.suspicious_count, 0);
    assert_eq!(h.enforcer.total_blocks(), 0);
}

#[tokio::test]
async fn test_port_scan_is_blocked_once() {
    let h = harness();

    let result = h.engine.analyze(&attack_vector(0.9), &source(attacker())).await.unwrap();
    assert!(result.is_anomaly);
    assert_eq!(result.threat_type, ThreatType::PortScan);
    assert_eq!(result.confidence, 0.9);

    let status = h.engine.status().await;
    assert_eq!(status.blocked_ids, vec![attacker()]);
    assert!(status.unenforced_ids.is_empty());
    assert_eq!(h.enforcer.blocks(attacker()), 1);

    let alerts = h.alerter.alerts.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].source_ip, attacker());
    assert_eq!(alerts[0].threat_type, ThreatType::PortScan);
    assert!(alerts[0].enforced);
}

#[tokio::test]
async fn test_repeated_detections_refresh_without_reenforcing() {
    let h = harness();
    h.engine.analyze(&attack_vector(0.9), &source(attacker())).await.unwrap();
    let first = h.engine.registry().entry(attacker()).await.unwrap();

    for _ in 0..5 {
        h.clock.advance(Duration::from_secs(60));
        h.engine.analyze(&attack_vector(0.95), &source(attacker())).await.unwrap();
    }

    assert_eq!(h.enforcer.blocks(attacker()), 1);
    assert_eq!(h.alerter.alerts.lock().unwrap().len(), 1);
    let refreshed = h.engine.registry().entry(attacker()).await.unwrap();
    assert_eq!(refreshed.blocked_at, first.blocked_at);
    assert_eq!(refreshed.expires_at, first.expires_at + Duration::from_secs(300));
}

#[tokio::test]
async fn test_block_expires_after_ttl() {
    let h = harness();
    h.engine.analyze(&attack_vector(0.9), &source(attacker())).await.unwrap();

    // Toujours bloquée juste avant l'échéance
    h.clock.advance(Duration::from_secs(3599));
    h.engine.reconcile_now().await;
    assert_eq!(h.engine.status().await.blocked_ids, vec![attacker()]);
    assert_eq!(h.enforcer.unblocks(attacker()), 0);

    h.clock.advance(Duration::from_secs(1));
    let report = h.engine.reconcile_now().await;
    assert_eq!(report.unblocked, vec![attacker()]);
    assert_eq!(h.enforcer.unblocks(attacker()), 1);
    assert!(h.engine.status().await.blocked_ids.is_empty());

    // Une seconde passe ne redébloque pas
    h.engine.reconcile_now().await;
    assert_eq!(h.enforcer.unblocks(attacker()), 1);
}

#[tokio::test]
async fn test_below_threshold_is_suspicious_only() {
    let h = harness();
    let result = h.engine.analyze(&attack_vector(0.6), &source(attacker())).await.unwrap();
    assert!(result.is_anomaly);

    let status = h.engine.status().await;
    assert_eq!(status.blocked_count, 0);
    assert_eq!(status.suspicious_count, 1);
    assert_eq!(h.enforcer.total_blocks(), 0);

    // Une détection au-dessus du seuil fait passer la source de suspecte à bloquée
    h.engine.analyze(&attack_vector(0.9), &source(attacker())).await.unwrap();
    let status = h.engine.status().await;
    assert_eq!(status.blocked_count, 1);
    assert_eq!(status.suspicious_count, 0);
}

#[tokio::test]
async fn test_release_of_unknown_source_is_noop() {
    let h = harness();
    assert!(!h.engine.release(attacker()).await.unwrap());
    assert_eq!(h.enforcer.unblocks(attacker()), 0);
}

#[tokio::test]
async fn test_release_removes_block() {
    let h = harness();
    h.engine.analyze(&attack_vector(0.9), &source(attacker())).await.unwrap();

    assert!(h.engine.release(attacker()).await.unwrap());
    assert_eq!(h.enforcer.unblocks(attacker()), 1);
    assert_eq!(h.engine.status().await.blocked_count, 0);

    // Un nouveau blocage est possible après la libération
    h.engine.analyze(&attack_vector(0.9), &source(attacker())).await.unwrap();
    assert_eq!(h.enforcer.blocks(attacker()), 2);
}

#[tokio::test]
async fn test_failed_release_keeps_block() {
    let h = harness();
    h.engine.analyze(&attack_vector(0.9), &source(attacker())).await.unwrap();
    h.enforcer.fail_unblocks.store(true, Ordering::SeqCst);

    assert!(matches!(
        h.engine.release(attacker()).await,
        Err(EngineError::EnforcementFailure { .. })
    ));
    assert_eq!(h.engine.status().await.blocked_ids, vec![attacker()]);
}

#[tokio::test]
async fn test_dimension_mismatch_is_rejected() {
    let h = harness();
    let err = h
        .engine
        .analyze(&FeatureVector::zeros(WINDOW_FEATURE_DIM - 1), &source(attacker()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::DimensionMismatch {
            expected: WINDOW_FEATURE_DIM,
            actual
        } if actual == WINDOW_FEATURE_DIM - 1
    ));
    assert_eq!(h.engine.status().await.blocked_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_distinct_sources() {
    let h = harness();
    let n = 64u8;

    let tasks: Vec<_> = (0..n)
        .map(|i| {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move {
                let ip = IpAddr::V4(Ipv4Addr::new(172, 16, 0, i));
                engine.analyze(&attack_vector(0.9), &source(ip)).await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let status = h.engine.status().await;
    assert_eq!(status.blocked_count, n as usize);
    assert_eq!(h.enforcer.total_blocks(), n as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_source_blocks_once() {
    let h = harness();

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.analyze(&attack_vector(0.9), &source(attacker())).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.enforcer.blocks(attacker()), 1);
    assert_eq!(h.engine.status().await.blocked_count, 1);
}

#[tokio::test]
async fn test_failed_unblock_is_retried_next_pass() {
    let h = harness();
    h.engine.analyze(&attack_vector(0.9), &source(attacker())).await.unwrap();
    h.clock.advance(Duration::from_secs(3600));

    h.enforcer.fail_unblocks.store(true, Ordering::SeqCst);
    let report = h.engine.reconcile_now().await;
    assert_eq!(report.failed, vec![attacker()]);
    assert_eq!(h.engine.status().await.blocked_ids, vec![attacker()]);

    h.enforcer.fail_unblocks.store(false, Ordering::SeqCst);
    h.engine.reconcile_now().await;
    assert_eq!(h.enforcer.unblocks(attacker()), 2);
    assert!(h.engine.status().await.blocked_ids.is_empty());
}

#[tokio::test]
async fn test_failed_block_is_visible_and_retried() {
    let h = harness();
    h.enforcer.fail_blocks.store(true, Ordering::SeqCst);
    h.engine.analyze(&attack_vector(0.9), &source(attacker())).await.unwrap();

    let status = h.engine.status().await;
    assert_eq!(status.blocked_ids, vec![attacker()]);
    assert_eq!(status.unenforced_ids, vec![attacker()]);
    {
        let alerts = h.alerter.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(!alerts[0].enforced);
    }

    // Une nouvelle détection ne relance pas le blocage : c'est le rôle de la réconciliation
    h.engine.analyze(&attack_vector(0.9), &source(attacker())).await.unwrap();
    assert_eq!(h.enforcer.blocks(attacker()), 1);

    h.enforcer.fail_blocks.store(false, Ordering::SeqCst);
    let report = h.engine.reconcile_now().await;
    assert_eq!(report.reenforced, vec![attacker()]);
    assert!(h.engine.status().await.unenforced_ids.is_empty());
}

#[tokio::test]
async fn test_untrained_models_degrade_to_no_action() {
    let enforcer = Arc::new(RecordingEnforcer::default());
    let engine = DecisionEngine::new(
        EngineSettings::default(),
        DetectionPipeline::new(Arc::new(UntrainedModel), Arc::new(UntrainedModel)),
        enforcer.clone(),
        Arc::new(RecordingAlerter::default()),
        Arc::new(MockClock::at_unix(0)),
    );

    let result = engine.analyze(&attack_vector(0.99), &source(attacker())).await.unwrap();
    assert!(!result.is_anomaly);
    assert_eq!(result.threat_type, ThreatType::Normal);
    assert_eq!(result.confidence, 0.0);
    assert!(result.degraded);
    assert_eq!(enforcer.total_blocks(), 0);

    let status = engine.status().await;
    assert!(!status.anomaly_model_trained);
    assert!(!status.threat_model_trained);
}

#[tokio::test]
async fn test_release_all() {
    let h = harness();
    for i in 1..=3 {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 1, 0, i));
        h.engine.analyze(&attack_vector(0.9), &source(ip)).await.unwrap();
    }

    assert_eq!(h.engine.release_all().await, 3);
    assert_eq!(h.engine.status().await.blocked_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_reconciliation() {
    let h = harness();
    h.engine.analyze(&attack_vector(0.9), &source(attacker())).await.unwrap();

    let handle = h.engine.spawn_reconciler(Duration::from_secs(300));
    h.clock.advance(Duration::from_secs(3600));

    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(h.enforcer.unblocks(attacker()), 1);
    assert!(h.engine.status().await.blocked_ids.is_empty());

    handle.shutdown().await;
}
