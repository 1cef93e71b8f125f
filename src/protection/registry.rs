//! Registre des sources bloquées et suspectes
//!
//! Toutes les mutations (insertion, rafraîchissement, suppression) passent par
//! un unique verrou d'état, tenu uniquement le temps de lire ou d'écrire les
//! tables. Les appels au mécanisme de blocage se font hors de ce verrou mais
//! sous un verrou propre à chaque source, de sorte qu'un ajout et un retrait
//! ne s'exécutent jamais en même temps pour la même adresse.

use crate::clock::Clock;
use crate::models::{expiry_after, BlockEntry, SuspicionRecord, ThreatType};
use dashmap::DashMap;
use log::debug;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, MutexGuard};

/// Résultat d'une demande de blocage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Nouvelle entrée : le blocage doit être appliqué
    Inserted,
    /// Source déjà bloquée : seule l'expiration a été repoussée
    Refreshed,
}

/// Copie des informations du registre pour le statut
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub blocked_ids: Vec<IpAddr>,
    pub unenforced_ids: Vec<IpAddr>,
    pub suspicious_count: usize,
}

#[derive(Default)]
struct RegistryState {
    blocked: HashMap<IpAddr, BlockEntry>,
    suspicious: HashMap<IpAddr, SuspicionRecord>,
}

pub struct BlockRegistry {
    clock: Arc<dyn Clock>,
    block_duration: Duration,
    state: Mutex<RegistryState>,
    /// Verrous par source, sérialisant les appels au mécanisme de blocage
    source_locks: DashMap<IpAddr, Arc<Mutex<()>>>,
    /// Empêche deux passes de réconciliation simultanées
    reconcile_gate: Mutex<()>,
}

impl BlockRegistry {
    pub fn new(clock: Arc<dyn Clock>, block_duration: Duration) -> Self {
        Self {
            clock,
            block_duration,
            state: Mutex::new(RegistryState::default()),
            source_locks: DashMap::new(),
            reconcile_gate: Mutex::new(()),
        }
    }

    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// Verrou de la source, créé au besoin
    pub fn source_lock(&self, ip: IpAddr) -> Arc<Mutex<()>> {
        self.source_locks
            .entry(ip)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Tente de démarrer une passe de réconciliation ; `None` si une autre est en cours
    pub fn try_begin_reconciliation(&self) -> Option<MutexGuard<'_, ()>> {
        self.reconcile_gate.try_lock().ok()
    }

    /// Enregistre un blocage, ou repousse l'expiration d'un blocage existant.
    ///
    /// L'appelant doit tenir le verrou de la source.
    pub async fn insert_or_refresh(&self, ip: IpAddr, threat_type: ThreatType, confidence: f64) -> BlockOutcome {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if let Some(entry) = state.blocked.get_mut(&ip) {
            entry.expires_at = expiry_after(now, self.block_duration);
            debug!("IP {} déjà bloquée, expiration repoussée", ip);
            return BlockOutcome::Refreshed;
        }

        state.suspicious.remove(&ip);
        state.blocked.insert(
            ip,
            BlockEntry::new(ip, threat_type, confidence, now, self.block_duration),
        );
        BlockOutcome::Inserted
    }

    /// Marque l'entrée comme effectivement appliquée (ou non) par le pare-feu
    pub async fn set_enforced(&self, ip: IpAddr, enforced: bool) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.blocked.get_mut(&ip) {
            entry.enforced = enforced;
        }
    }

    /// Note une détection sous le seuil ; retourne le nombre d'observations de la source.
    ///
    /// Une source déjà bloquée n'est pas comptée comme suspecte.
    pub async fn record_suspicious(&self, ip: IpAddr, threat_type: ThreatType, confidence: f64) -> u32 {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.blocked.contains_key(&ip) {
            return 0;
        }
        let record = state
            .suspicious
            .entry(ip)
            .and_modify(|r| r.observe(now, threat_type, confidence))
            .or_insert_with(|| SuspicionRecord::new(now, threat_type, confidence));
        record.count
    }

    pub async fn entry(&self, ip: IpAddr) -> Option<BlockEntry> {
        self.state.lock().await.blocked.get(&ip).cloned()
    }

    pub async fn suspicion(&self, ip: IpAddr) -> Option<SuspicionRecord> {
        self.state.lock().await.suspicious.get(&ip).cloned()
    }

    pub async fn is_blocked(&self, ip: IpAddr) -> bool {
        self.state.lock().await.blocked.contains_key(&ip)
    }

    /// Retire l'entrée de blocage. L'appelant doit tenir le verrou de la source.
    pub async fn remove(&self, ip: IpAddr) -> Option<BlockEntry> {
        self.state.lock().await.blocked.remove(&ip)
    }

    /// Sources dont le blocage a expiré
    pub async fn expired_sources(&self) -> Vec<IpAddr> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .blocked
            .values()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.source_ip)
            .collect()
    }

    /// Sources bloquées dont la règle n'a pas pu être posée
    pub async fn unenforced_sources(&self) -> Vec<IpAddr> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .blocked
            .values()
            .filter(|e| !e.enforced && !e.is_expired_at(now))
            .map(|e| e.source_ip)
            .collect()
    }

    pub async fn blocked_sources(&self) -> Vec<IpAddr> {
        self.state.lock().await.blocked.keys().copied().collect()
    }

    /// Oublie les suspects non revus depuis la durée de blocage
    pub async fn prune_suspicious(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.block_duration;
        let mut state = self.state.lock().await;
        let before = state.suspicious.len();
        state.suspicious.retain(|_, record| {
            now.duration_since(record.last_seen)
                .map(|age| age < ttl)
                .unwrap_or(true)
        });
        before - state.suspicious.len()
    }

    /// Libère les verrous de source que plus personne n'utilise
    pub fn prune_source_locks(&self) {
        self.source_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Copie minimale de l'état pour le statut
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let (mut blocked_ids, mut unenforced_ids, suspicious_count) = {
            let state = self.state.lock().await;
            (
                state.blocked.keys().copied().collect::<Vec<_>>(),
                state
                    .blocked
                    .values()
                    .filter(|e| !e.enforced)
                    .map(|e| e.source_ip)
                    .collect::<Vec<_>>(),
                state.suspicious.len(),
            )
        };
        blocked_ids.sort();
        unenforced_ids.sort();
        RegistrySnapshot {
            blocked_ids,
            unenforced_ids,
            suspicious_count,
        }
    }
}
