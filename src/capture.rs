//! Sources de paquets
//!
//! La capture pcap bloque : elle tourne sur un thread dédié qui pousse les
//! trames dans une file bornée, relevée par lots par la boucle d'analyse.

use crate::error::{EngineError, Result};
use crate::models::PacketRecord;
use log::{debug, error, info, warn};
use pcap::{Active, Capture, Offline};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source de trames brutes
pub trait CaptureSource: Send {
    /// Jusqu'à `max` trames ; un lot vide signifie « rien pour l'instant »
    fn next_batch(&mut self, max: usize) -> Result<Vec<PacketRecord>>;

    /// Vrai quand une source finie n'a plus rien à livrer
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Limite de débit par tranche d'une seconde
struct RateLimiter {
    max_per_second: u32,
    started: Instant,
    slot: u64,
    count: u32,
}

impl RateLimiter {
    fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            started: Instant::now(),
            slot: 0,
            count: 0,
        }
    }

    fn allow(&mut self) -> bool {
        let slot = self.started.elapsed().as_secs();
        if slot != self.slot {
            self.slot = slot;
            self.count = 0;
        }
        if self.count >= self.max_per_second {
            return false;
        }
        self.count += 1;
        true
    }
}

/// Capture pcap, en direct sur une interface ou rejouée depuis un fichier
pub struct PcapCapture {
    rx: Receiver<PacketRecord>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    exhausted: bool,
}

impl PcapCapture {
    /// Ouvre l'interface en mode promiscuité
    pub fn live(interface: &str, max_packets_per_second: u32, queue_size: usize) -> Result<Self> {
        let capture = Capture::from_device(interface)
            .and_then(|c| c.promisc(true).snaplen(65535).timeout(1000).open())
            .map_err(|e| EngineError::Capture(format!("ouverture de {} impossible: {}", interface, e)))?;

        let (tx, rx) = mpsc::sync_channel(queue_size);
        let stop = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let thread_stop = Arc::clone(&stop);
        let thread_dropped = Arc::clone(&dropped);
        let name = interface.to_string();
        thread::Builder::new()
            .name(format!("capture-{}", interface))
            .spawn(move || live_loop(capture, tx, thread_stop, thread_dropped, max_packets_per_second, name))?;

        info!("Capture démarrée sur l'interface {} ({} paquets/s max)", interface, max_packets_per_second);
        Ok(Self {
            rx,
            stop,
            dropped,
            exhausted: false,
        })
    }

    /// Rejoue un fichier de capture, horodatage pris dans les en-têtes pcap
    pub fn offline(path: &Path, queue_size: usize) -> Result<Self> {
        let capture = Capture::from_file(path)
            .map_err(|e| EngineError::Capture(format!("lecture de {} impossible: {}", path.display(), e)))?;

        let (tx, rx) = mpsc::sync_channel(queue_size);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("capture-offline".to_string())
            .spawn(move || offline_loop(capture, tx, thread_stop))?;

        info!("Relecture du fichier de capture {}", path.display());
        Ok(Self {
            rx,
            stop,
            dropped: Arc::new(AtomicU64::new(0)),
            exhausted: false,
        })
    }

    /// Trames écartées (limite de débit ou file pleine)
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Demande l'arrêt du thread de capture
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for PcapCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl CaptureSource for PcapCapture {
    fn next_batch(&mut self, max: usize) -> Result<Vec<PacketRecord>> {
        let mut batch = Vec::new();
        while batch.len() < max {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        Ok(batch)
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

fn live_loop(
    mut capture: Capture<Active>,
    tx: SyncSender<PacketRecord>,
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    max_packets_per_second: u32,
    interface: String,
) {
    let mut limiter = RateLimiter::new(max_packets_per_second);

    while !stop.load(Ordering::Relaxed) {
        match capture.next_packet() {
            Ok(packet) => {
                if !limiter.allow() {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let record = PacketRecord::new(SystemTime::now(), packet.data.to_vec());
                match tx.try_send(record) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                error!("Erreur lors de la capture sur {}: {}", interface, e);
                break;
            }
        }
    }
    debug!("Thread de capture {} arrêté", interface);
}

fn offline_loop(mut capture: Capture<Offline>, tx: SyncSender<PacketRecord>, stop: Arc<AtomicBool>) {
    let mut count = 0u64;
    while !stop.load(Ordering::Relaxed) {
        match capture.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let timestamp = UNIX_EPOCH
                    + Duration::new(ts.tv_sec.max(0) as u64, (ts.tv_usec.max(0) as u32).saturating_mul(1000));
                if tx.send(PacketRecord::new(timestamp, packet.data.to_vec())).is_err() {
                    break;
                }
                count += 1;
            }
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => {
                warn!("Fichier de capture interrompu: {}", e);
                break;
            }
        }
    }
    info!("Fin du fichier de capture ({} trames)", count);
}

/// Source en mémoire
#[derive(Debug, Default)]
pub struct VecCapture {
    records: VecDeque<PacketRecord>,
}

impl VecCapture {
    pub fn new(records: Vec<PacketRecord>) -> Self {
        Self {
            records: records.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.records.len()
    }
}

impl CaptureSource for VecCapture {
    fn next_batch(&mut self, max: usize) -> Result<Vec<PacketRecord>> {
        let n = max.min(self.records.len());
        Ok(self.records.drain(..n).collect())
    }

    fn is_exhausted(&self) -> bool {
        self.records.is_empty()
    }
}
