//! Réconciliation périodique des blocages
//!
//! Chaque passe retire les blocages expirés, retente la pose des règles qui
//! avaient échoué et oublie les suspects trop anciens. Une seule passe
//! s'exécute à la fois ; une passe demandée pendant qu'une autre tourne est
//! simplement ignorée.

use super::alerting::Alerter;
use super::enforcement::Enforcer;
use super::registry::BlockRegistry;
use crate::models::{Report, ReportType};
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Bilan d'une passe de réconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Vrai si une autre passe était déjà en cours
    pub skipped: bool,
    pub unblocked: Vec<IpAddr>,
    /// Déblocages en échec, conservés pour la passe suivante
    pub failed: Vec<IpAddr>,
    /// Blocages dont la règle a finalement pu être posée
    pub reenforced: Vec<IpAddr>,
    pub pruned_suspicious: usize,
}

enum ReleaseOutcome {
    Released(IpAddr),
    Failed(IpAddr),
    /// Bloc rafraîchi ou déjà retiré entre-temps
    Skipped,
}

pub struct Reconciler {
    registry: Arc<BlockRegistry>,
    enforcer: Arc<dyn Enforcer>,
    alerter: Arc<dyn Alerter>,
}

impl Reconciler {
    pub fn new(registry: Arc<BlockRegistry>, enforcer: Arc<dyn Enforcer>, alerter: Arc<dyn Alerter>) -> Self {
        Self {
            registry,
            enforcer,
            alerter,
        }
    }

    /// Exécute une passe complète
    pub async fn run_pass(&self) -> ReconcileReport {
        let _gate = match self.registry.try_begin_reconciliation() {
            Some(guard) => guard,
            None => {
                debug!("Réconciliation déjà en cours, passe ignorée");
                return ReconcileReport {
                    skipped: true,
                    ..Default::default()
                };
            }
        };

        let mut report = ReconcileReport::default();

        let expired = self.registry.expired_sources().await;
        let outcomes = join_all(expired.into_iter().map(|ip| self.release_expired(ip))).await;
        for outcome in outcomes {
            match outcome {
                ReleaseOutcome::Released(ip) => report.unblocked.push(ip),
                ReleaseOutcome::Failed(ip) => report.failed.push(ip),
                ReleaseOutcome::Skipped => {}
            }
        }

        for ip in self.registry.unenforced_sources().await {
            if self.retry_block(ip).await {
                report.reenforced.push(ip);
            }
        }

        report.pruned_suspicious = self.registry.prune_suspicious().await;
        self.registry.prune_source_locks();

        if !report.unblocked.is_empty() || !report.failed.is_empty() || !report.reenforced.is_empty() {
            info!(
                "Réconciliation: {} débloquée(s), {} échec(s), {} blocage(s) rétabli(s)",
                report.unblocked.len(),
                report.failed.len(),
                report.reenforced.len()
            );
        }
        report
    }

    async fn release_expired(&self, ip: IpAddr) -> ReleaseOutcome {
        let lock = self.registry.source_lock(ip);
        let _guard = lock.lock().await;

        // Le blocage a pu être rafraîchi pendant l'attente du verrou
        let now = self.registry.now();
        match self.registry.entry(ip).await {
            Some(entry) if entry.is_expired_at(now) => {}
            _ => return ReleaseOutcome::Skipped,
        }

        match self.enforcer.unblock(ip).await {
            Ok(()) => {
                self.registry.remove(ip).await;
                info!("IP {} débloquée (blocage expiré)", ip);
                self.alerter.record(
                    Report::new(ReportType::Unblock, format!("IP {} débloquée après expiration", ip))
                        .with_ip(ip)
                        .with_severity(3),
                );
                ReleaseOutcome::Released(ip)
            }
            Err(e) => {
                error!("Échec du déblocage de {}: {}", ip, e);
                self.alerter.record(
                    Report::new(ReportType::Failure, format!("Échec du déblocage de {}", ip))
                        .with_ip(ip)
                        .with_details(e.to_string())
                        .with_severity(7),
                );
                ReleaseOutcome::Failed(ip)
            }
        }
    }

    async fn retry_block(&self, ip: IpAddr) -> bool {
        let lock = self.registry.source_lock(ip);
        let _guard = lock.lock().await;

        match self.registry.entry(ip).await {
            Some(entry) if !entry.enforced => {}
            _ => return false,
        }

        match self.enforcer.block(ip).await {
            Ok(()) => {
                self.registry.set_enforced(ip, true).await;
                info!("Règle de blocage rétablie pour {}", ip);
                true
            }
            Err(e) => {
                warn!("Nouvel échec du blocage de {}: {}", ip, e);
                false
            }
        }
    }

    /// Lance la réconciliation périodique en tâche de fond
    pub fn spawn(self: Arc<Self>, period: Duration) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Le premier tick est immédiat
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.run_pass().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Tâche de réconciliation arrêtée");
        });

        ReconcilerHandle { shutdown_tx, handle }
    }
}

/// Poignée de la tâche de réconciliation
pub struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Arrête la tâche après la passe éventuellement en cours
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!("La tâche de réconciliation s'est terminée anormalement: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::{EngineError, Result};
    use crate::models::ThreatType;
    use crate::protection::alerting::NullAlerter;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlakyEnforcer {
        fail: AtomicBool,
        blocks: AtomicUsize,
        unblocks: AtomicUsize,
    }

    #[async_trait]
    impl Enforcer for FlakyEnforcer {
        async fn block(&self, ip: IpAddr) -> Result<()> {
            self.blocks.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::EnforcementFailure { ip, message: "refusé".into() });
            }
            Ok(())
        }

        async fn unblock(&self, ip: IpAddr) -> Result<()> {
            self.unblocks.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::EnforcementFailure { ip, message: "refusé".into() });
            }
            Ok(())
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn setup() -> (Arc<MockClock>, Arc<BlockRegistry>, Arc<FlakyEnforcer>, Reconciler) {
        let clock = Arc::new(MockClock::at_unix(1_000_000));
        let registry = Arc::new(BlockRegistry::new(clock.clone(), Duration::from_secs(60)));
        let enforcer = Arc::new(FlakyEnforcer::default());
        let reconciler = Reconciler::new(registry.clone(), enforcer.clone(), Arc::new(NullAlerter));
        (clock, registry, enforcer, reconciler)
    }

    #[tokio::test]
    async fn test_expired_blocks_are_released() {
        let (clock, registry, enforcer, reconciler) = setup();
        registry.insert_or_refresh(ip(1), ThreatType::Ddos, 0.9).await;
        registry.set_enforced(ip(1), true).await;

        assert!(reconciler.run_pass().await.unblocked.is_empty());

        clock.advance(Duration::from_secs(60));
        let report = reconciler.run_pass().await;
        assert_eq!(report.unblocked, vec![ip(1)]);
        assert_eq!(enforcer.unblocks.load(Ordering::SeqCst), 1);
        assert!(!registry.is_blocked(ip(1)).await);
    }

    #[tokio::test]
    async fn test_failed_unblock_is_retried() {
        let (clock, registry, enforcer, reconciler) = setup();
        registry.insert_or_refresh(ip(2), ThreatType::Ddos, 0.9).await;
        registry.set_enforced(ip(2), true).await;
        clock.advance(Duration::from_secs(120));

        enforcer.fail.store(true, Ordering::SeqCst);
        let report = reconciler.run_pass().await;
        assert_eq!(report.failed, vec![ip(2)]);
        assert!(registry.is_blocked(ip(2)).await);

        enforcer.fail.store(false, Ordering::SeqCst);
        let report = reconciler.run_pass().await;
        assert_eq!(report.unblocked, vec![ip(2)]);
        assert!(!registry.is_blocked(ip(2)).await);
    }

    #[tokio::test]
    async fn test_unenforced_block_is_reapplied() {
        let (_clock, registry, enforcer, reconciler) = setup();
        registry.insert_or_refresh(ip(3), ThreatType::PortScan, 0.95).await;

        let report = reconciler.run_pass().await;
        assert_eq!(report.reenforced, vec![ip(3)]);
        assert_eq!(enforcer.blocks.load(Ordering::SeqCst), 1);
        assert!(registry.entry(ip(3)).await.unwrap().enforced);
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_skipped() {
        let (_clock, registry, _enforcer, reconciler) = setup();
        let _gate = registry.try_begin_reconciliation();
        assert!(reconciler.run_pass().await.skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_task_runs_and_stops() {
        let (clock, registry, enforcer, reconciler) = setup();
        registry.insert_or_refresh(ip(4), ThreatType::Malware, 0.9).await;
        registry.set_enforced(ip(4), true).await;
        clock.advance(Duration::from_secs(61));

        let handle = Arc::new(reconciler).spawn(Duration::from_secs(10));
        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(enforcer.unblocks.load(Ordering::SeqCst), 1);
        assert!(!registry.is_blocked(ip(4)).await);

        handle.shutdown().await;
    }
}
