//! Module de protection
//!
//! Le moteur de décision relie le pipeline de détection au registre des
//! blocages : il applique la politique de blocage, émet les intentions de
//! blocage et de déblocage vers le pare-feu et expose un statut en lecture
//! seule.

mod alerting;
mod enforcement;
mod reconciler;
mod registry;

pub use alerting::*;
pub use enforcement::*;
pub use reconciler::*;
pub use registry::*;

use crate::clock::Clock;
use crate::config::Config;
use crate::detection::DetectionPipeline;
use crate::error::{EngineError, Result};
use crate::features::{Normalizer, WINDOW_FEATURE_DIM};
use crate::models::{DetectionResult, FeatureVector, PacketInfo, Report, ReportType, ThreatType};
use crate::status::EngineStatus;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Paramètres de la politique de décision
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Dimension des vecteurs acceptés par `analyze`
    pub expected_dimension: usize,
    /// Confiance strictement supérieure requise pour bloquer
    pub block_threshold: f64,
    pub block_duration: Duration,
    /// Sources jamais bloquées
    pub whitelist: HashSet<IpAddr>,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            expected_dimension: WINDOW_FEATURE_DIM,
            block_threshold: config.block_threshold,
            block_duration: config.block_duration(),
            whitelist: config.whitelist_ips()?.into_iter().collect(),
        })
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            expected_dimension: WINDOW_FEATURE_DIM,
            block_threshold: 0.85,
            block_duration: Duration::from_secs(3600),
            whitelist: HashSet::new(),
        }
    }
}

/// Moteur de décision : détection, politique de blocage et registre
pub struct DecisionEngine {
    settings: EngineSettings,
    pipeline: DetectionPipeline,
    normalizer: Option<Arc<Normalizer>>,
    registry: Arc<BlockRegistry>,
    enforcer: Arc<dyn Enforcer>,
    alerter: Arc<dyn Alerter>,
    /// Le passage en mode dégradé n'est signalé qu'une fois en `warn!`
    degraded_warned: AtomicBool,
}

impl DecisionEngine {
    pub fn new(
        settings: EngineSettings,
        pipeline: DetectionPipeline,
        enforcer: Arc<dyn Enforcer>,
        alerter: Arc<dyn Alerter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(BlockRegistry::new(clock, settings.block_duration));
        Self {
            settings,
            pipeline,
            normalizer: None,
            registry,
            enforcer,
            alerter,
            degraded_warned: AtomicBool::new(false),
        }
    }

    /// Normalise les vecteurs avant la détection
    pub fn with_normalizer(mut self, normalizer: Arc<Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.registry
    }

    /// Analyse un vecteur agrégé et applique la politique de blocage.
    ///
    /// Un vecteur de mauvaise dimension est rejeté. Un modèle non entraîné
    /// donne un résultat normal marqué comme dégradé, sans aucune action.
    pub async fn analyze(&self, vector: &FeatureVector, info: &PacketInfo) -> Result<DetectionResult> {
        if vector.dim() != self.settings.expected_dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.settings.expected_dimension,
                actual: vector.dim(),
            });
        }

        let result = match &self.normalizer {
            Some(normalizer) => match normalizer.transform(vector) {
                Ok(scaled) => self.pipeline.run(&scaled),
                Err(e) => {
                    if matches!(e, EngineError::NormalizerNotCalibrated) {
                        self.note_degraded("normaliseur non calibré");
                    }
                    return Err(e);
                }
            },
            None => self.pipeline.run(vector),
        };

        if result.degraded {
            self.note_degraded("modèle non entraîné");
            return Ok(result);
        }
        if !result.is_anomaly {
            return Ok(result);
        }

        let ip = info.source_ip;
        if result.threat_type == ThreatType::Normal {
            // Signalé par le filtre mais pas attribué : jamais de blocage
            self.registry
                .record_suspicious(ip, result.threat_type, result.confidence)
                .await;
            debug!("Anomalie non attribuée pour {}, source notée suspecte", ip);
            return Ok(result);
        }

        if result.confidence > self.settings.block_threshold {
            if self.settings.whitelist.contains(&ip) {
                info!(
                    "IP {} en liste blanche, blocage ignoré ({} à {:.2})",
                    ip, result.threat_type, result.confidence
                );
                self.registry
                    .record_suspicious(ip, result.threat_type, result.confidence)
                    .await;
            } else {
                self.block_source(ip, result, info).await;
            }
        } else {
            let count = self
                .registry
                .record_suspicious(ip, result.threat_type, result.confidence)
                .await;
            debug!(
                "IP {} suspecte ({} à {:.2}, {} observation(s))",
                ip, result.threat_type, result.confidence, count
            );
        }

        Ok(result)
    }

    /// Bloque la source si elle ne l'est pas déjà
    async fn block_source(&self, ip: IpAddr, result: DetectionResult, info: &PacketInfo) -> BlockOutcome {
        let lock = self.registry.source_lock(ip);
        let _guard = lock.lock().await;

        let outcome = self
            .registry
            .insert_or_refresh(ip, result.threat_type, result.confidence)
            .await;
        if outcome == BlockOutcome::Refreshed {
            return outcome;
        }

        let enforced = match self.enforcer.block(ip).await {
            Ok(()) => {
                info!("IP {} bloquée: {} (confiance {:.2})", ip, result.threat_type, result.confidence);
                self.alerter.record(
                    Report::new(ReportType::Block, format!("IP {} bloquée", ip))
                        .with_ip(ip)
                        .with_details(format!(
                            "{} (confiance {:.2}), durée {}s",
                            result.threat_type,
                            result.confidence,
                            self.settings.block_duration.as_secs()
                        ))
                        .with_severity(8),
                );
                true
            }
            Err(e) => {
                // L'entrée reste : la source est logiquement bloquée et la
                // règle sera retentée par la réconciliation
                error!("Échec du blocage de {}: {}", ip, e);
                self.alerter.record(
                    Report::new(ReportType::Failure, format!("Échec du blocage de {}", ip))
                        .with_ip(ip)
                        .with_details(e.to_string())
                        .with_severity(9),
                );
                false
            }
        };
        self.registry.set_enforced(ip, enforced).await;

        self.alerter.notify(Alert {
            threat_type: result.threat_type,
            confidence: result.confidence,
            source_ip: ip,
            details: describe_packet(info),
            enforced,
        });
        outcome
    }

    /// Libère une source bloquée ; sans effet si elle ne l'est pas.
    ///
    /// Retourne `true` si un blocage a été retiré. En cas d'échec du
    /// pare-feu, l'entrée est conservée et l'erreur remontée.
    pub async fn release(&self, ip: IpAddr) -> Result<bool> {
        let lock = self.registry.source_lock(ip);
        let _guard = lock.lock().await;

        if !self.registry.is_blocked(ip).await {
            debug!("Libération de {} ignorée: source non bloquée", ip);
            return Ok(false);
        }

        if let Err(e) = self.enforcer.unblock(ip).await {
            error!("Échec de la libération de {}: {}", ip, e);
            self.alerter.record(
                Report::new(ReportType::Failure, format!("Échec de la libération de {}", ip))
                    .with_ip(ip)
                    .with_details(e.to_string())
                    .with_severity(7),
            );
            return Err(e);
        }

        self.registry.remove(ip).await;
        info!("IP {} libérée", ip);
        self.alerter.record(
            Report::new(ReportType::Release, format!("IP {} libérée", ip))
                .with_ip(ip)
                .with_severity(3),
        );
        Ok(true)
    }

    /// Libère toutes les sources bloquées ; retourne le nombre de succès
    pub async fn release_all(&self) -> usize {
        let sources = self.registry.blocked_sources().await;
        if sources.is_empty() {
            return 0;
        }

        let results = join_all(sources.iter().map(|ip| self.release(*ip))).await;
        let released = results.iter().filter(|r| matches!(r, Ok(true))).count();
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!("{} source(s) n'ont pas pu être libérées", failed);
        }
        info!("{} source(s) libérée(s) sur {}", released, sources.len());
        released
    }

    /// Instantané en lecture seule
    pub async fn status(&self) -> EngineStatus {
        let snapshot = self.registry.snapshot().await;
        EngineStatus {
            blocked_count: snapshot.blocked_ids.len(),
            suspicious_count: snapshot.suspicious_count,
            blocked_ids: snapshot.blocked_ids,
            unenforced_ids: snapshot.unenforced_ids,
            anomaly_model_trained: self.pipeline.anomaly_model_trained(),
            threat_model_trained: self.pipeline.threat_model_trained(),
            normalizer_calibrated: self.normalizer.as_ref().map(|n| n.is_calibrated()),
            generated_at: DateTime::<Utc>::from(self.registry.now()),
        }
    }

    /// Réconciliateur partageant le registre et les collaborateurs du moteur
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.enforcer),
            Arc::clone(&self.alerter),
        )
    }

    /// Exécute immédiatement une passe de réconciliation
    pub async fn reconcile_now(&self) -> ReconcileReport {
        self.reconciler().run_pass().await
    }

    /// Lance la réconciliation périodique
    pub fn spawn_reconciler(&self, period: Duration) -> ReconcilerHandle {
        info!("Réconciliation des blocages toutes les {}s", period.as_secs());
        Arc::new(self.reconciler()).spawn(period)
    }

    fn note_degraded(&self, reason: &str) {
        if !self.degraded_warned.swap(true, Ordering::Relaxed) {
            warn!("Mode dégradé: {}, aucune action de blocage ne sera prise", reason);
        } else {
            debug!("Mode dégradé: {}", reason);
        }
    }
}

fn describe_packet(info: &PacketInfo) -> String {
    let mut details = format!("{:?} {} -> {}", info.protocol, info.source_ip, info.dest_ip);
    if let Some(port) = info.dest_port {
        details.push_str(&format!(":{}", port));
    }
    if let Some(flags) = info.tcp_flags {
        details.push_str(&format!(" flags=0x{:02x}", flags));
    }
    details
}
