//! Boucle d'ingestion du trafic
//!
//! Chaque trame est réduite à son vecteur de caractéristiques puis
//! abandonnée. Les vecteurs sont accumulés par source ; une fenêtre pleine
//! est agrégée et transmise au moteur de décision.
//!
//! Le nombre de sources en attente est plafonné : au-delà, les fenêtres les
//! plus anciennes sont abandonnées. Les fenêtres inactives sont oubliées
//! après `idle_timeout`.

use crate::capture::CaptureSource;
use crate::error::{EngineError, Result};
use crate::features::{aggregate_vectors, parse_packet};
use crate::models::{DetectionResult, FeatureVector, PacketRecord};
use crate::protection::DecisionEngine;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time;

/// Nombre maximal de trames relevées par tour de boucle
const BATCH_SIZE: usize = 512;
/// Attente lorsque la source n'a rien à livrer
const IDLE_BACKOFF: Duration = Duration::from_millis(20);
/// Période de purge des fenêtres inactives dans `run`
const PRUNE_PERIOD: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_PENDING_SOURCES: usize = 65_536;
pub const DEFAULT_PENDING_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Compteurs d'activité
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub packets_seen: u64,
    pub malformed: u64,
    pub windows_analyzed: u64,
    pub threats_flagged: u64,
    /// Fenêtres abandonnées (plafond atteint ou source inactive)
    pub windows_evicted: u64,
}

/// Fenêtre en cours de remplissage pour une source
#[derive(Debug, Default)]
struct PendingWindow {
    vectors: Vec<FeatureVector>,
    last_seen: Option<SystemTime>,
}

pub struct TrafficMonitor {
    engine: Arc<DecisionEngine>,
    window_size: usize,
    workers: usize,
    max_pending_sources: usize,
    idle_timeout: Duration,
    buffers: DashMap<IpAddr, PendingWindow>,
    packets_seen: AtomicU64,
    malformed: AtomicU64,
    windows_analyzed: AtomicU64,
    threats_flagged: AtomicU64,
    windows_evicted: AtomicU64,
}

impl TrafficMonitor {
    pub fn new(engine: Arc<DecisionEngine>, window_size: usize, workers: usize) -> Self {
        Self {
            engine,
            window_size: window_size.max(1),
            workers: workers.max(1),
            max_pending_sources: DEFAULT_MAX_PENDING_SOURCES,
            idle_timeout: DEFAULT_PENDING_IDLE_TIMEOUT,
            buffers: DashMap::new(),
            packets_seen: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            windows_analyzed: AtomicU64::new(0),
            threats_flagged: AtomicU64::new(0),
            windows_evicted: AtomicU64::new(0),
        }
    }

    /// Plafonne le nombre de sources en attente et leur durée d'inactivité
    pub fn with_pending_limits(mut self, max_sources: usize, idle_timeout: Duration) -> Self {
        self.max_pending_sources = max_sources.max(1);
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    /// Traite une trame ; retourne le résultat si elle complète une fenêtre
    pub async fn ingest(&self, record: PacketRecord) -> Option<DetectionResult> {
        self.packets_seen.fetch_add(1, Ordering::Relaxed);

        let parsed = match parse_packet(&record) {
            Ok(parsed) => parsed,
            Err(e) => {
                if e.is_packet_local() {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!("Trame ignorée: {}", e);
                } else {
                    warn!("Erreur d'extraction inattendue: {}", e);
                }
                return None;
            }
        };
        drop(record);

        let ip = parsed.info.source_ip;
        if !self.buffers.contains_key(&ip) && self.buffers.len() >= self.max_pending_sources {
            self.evict_oldest();
        }

        let now = self.engine.registry().now();
        let window = {
            let mut pending = self.buffers.entry(ip).or_default();
            pending.last_seen = Some(now);
            pending.vectors.push(parsed.features);
            if pending.vectors.len() >= self.window_size {
                Some(std::mem::take(&mut pending.vectors))
            } else {
                None
            }
        };
        let vectors = window?;
        self.buffers.remove_if(&ip, |_, pending| pending.vectors.is_empty());

        let aggregated = match aggregate_vectors(&vectors) {
            Ok(aggregated) => aggregated,
            Err(e) => {
                error!("Agrégation impossible pour {}: {}", ip, e);
                return None;
            }
        };

        self.windows_analyzed.fetch_add(1, Ordering::Relaxed);
        match self.engine.analyze(&aggregated, &parsed.info).await {
            Ok(result) => {
                if result.is_anomaly {
                    self.threats_flagged.fetch_add(1, Ordering::Relaxed);
                }
                Some(result)
            }
            Err(EngineError::NormalizerNotCalibrated) => None,
            Err(e) => {
                error!("Analyse de la fenêtre de {} impossible: {}", ip, e);
                None
            }
        }
    }

    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            packets_seen: self.packets_seen.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            windows_analyzed: self.windows_analyzed.load(Ordering::Relaxed),
            threats_flagged: self.threats_flagged.load(Ordering::Relaxed),
            windows_evicted: self.windows_evicted.load(Ordering::Relaxed),
        }
    }

    /// Sources ayant une fenêtre en cours de remplissage
    pub fn pending_sources(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_pending(&self, ip: IpAddr) -> bool {
        self.buffers.contains_key(&ip)
    }

    /// Oublie les fenêtres non alimentées depuis `idle_timeout`
    pub fn prune_idle(&self) -> usize {
        let now = self.engine.registry().now();
        let before = self.buffers.len();
        self.buffers.retain(|_, pending| match pending.last_seen {
            Some(seen) => now
                .duration_since(seen)
                .map(|age| age < self.idle_timeout)
                .unwrap_or(true),
            None => false,
        });
        let pruned = before.saturating_sub(self.buffers.len());
        if pruned > 0 {
            self.windows_evicted.fetch_add(pruned as u64, Ordering::Relaxed);
            debug!("{} fenêtre(s) inactive(s) oubliée(s)", pruned);
        }
        pruned
    }

    /// Abandonne le huitième le plus ancien des fenêtres en attente
    fn evict_oldest(&self) {
        let mut ages: Vec<(Option<SystemTime>, IpAddr)> =
            self.buffers.iter().map(|e| (e.value().last_seen, *e.key())).collect();
        let count = (self.max_pending_sources / 8).max(1).min(ages.len());
        if count == 0 {
            return;
        }
        ages.select_nth_unstable_by_key(count - 1, |(seen, _)| *seen);

        let mut evicted = 0u64;
        for (_, ip) in &ages[..count] {
            if self.buffers.remove(ip).is_some() {
                evicted += 1;
            }
        }
        self.windows_evicted.fetch_add(evicted, Ordering::Relaxed);
        debug!(
            "Plafond de {} sources en attente atteint, {} fenêtre(s) abandonnée(s)",
            self.max_pending_sources, evicted
        );
    }

    /// Relève la source jusqu'à l'arrêt demandé ou son épuisement
    pub async fn run(&self, source: &mut dyn CaptureSource, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        info!("Analyse du trafic démarrée ({} tâches, fenêtres de {} paquets)", self.workers, self.window_size);

        let mut last_prune = time::Instant::now();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if last_prune.elapsed() >= PRUNE_PERIOD {
                self.prune_idle();
                last_prune = time::Instant::now();
            }

            let batch = source.next_batch(BATCH_SIZE)?;
            if batch.is_empty() {
                if source.is_exhausted() {
                    info!("Source de paquets épuisée");
                    break;
                }
                tokio::select! {
                    _ = time::sleep(IDLE_BACKOFF) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            stream::iter(batch)
                .for_each_concurrent(self.workers, |record| async move {
                    self.ingest(record).await;
                })
                .await;
        }

        let stats = self.stats();
        info!(
            "Analyse arrêtée: {} paquets, {} malformés, {} fenêtres, {} menaces, {} fenêtres abandonnées",
            stats.packets_seen, stats.malformed, stats.windows_analyzed, stats.threats_flagged, stats.windows_evicted
        );
        Ok(())
    }
}
