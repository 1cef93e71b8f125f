//! Canal d'alerte
//!
//! Les alertes sont émises sans attente (« fire-and-forget ») : un canal
//! saturé ou fermé est journalisé mais n'influence jamais la décision.

use crate::models::{Report, ReportType, ThreatType};
use log::{debug, warn};
use std::net::IpAddr;
use tokio::sync::mpsc;

/// Alerte émise lors d'un blocage
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub threat_type: ThreatType,
    pub confidence: f64,
    pub source_ip: IpAddr,
    pub details: String,
    /// Vrai si la règle de pare-feu a effectivement été posée
    pub enforced: bool,
}

impl From<&Alert> for Report {
    fn from(alert: &Alert) -> Self {
        let outcome = if alert.enforced {
            "source bloquée"
        } else {
            "blocage non appliqué, nouvel essai à la réconciliation"
        };
        Report::new(
            ReportType::Threat,
            format!(
                "{} depuis {} (confiance {:.0}%), {}",
                alert.threat_type,
                alert.source_ip,
                alert.confidence * 100.0,
                outcome
            ),
        )
        .with_ip(alert.source_ip)
        .with_details(alert.details.clone())
        .with_severity(severity_for(alert.confidence))
    }
}

/// Sévérité 0-10 dérivée de la confiance
fn severity_for(confidence: f64) -> u8 {
    (confidence.clamp(0.0, 1.0) * 10.0).round() as u8
}

pub trait Alerter: Send + Sync {
    /// Notifie une menace ; ne doit ni bloquer ni échouer
    fn notify(&self, alert: Alert);

    /// Transmet un événement d'audit (déblocage, échec du pare-feu, ...)
    fn record(&self, _report: Report) {}
}

/// Envoie les alertes et événements dans un canal de rapports
#[derive(Debug, Clone)]
pub struct ReportAlerter {
    report_tx: mpsc::Sender<Report>,
}

impl ReportAlerter {
    pub fn new(report_tx: mpsc::Sender<Report>) -> Self {
        Self { report_tx }
    }

    fn send(&self, report: Report) {
        // try_send : ne jamais bloquer le chemin d'analyse
        if let Err(e) = self.report_tx.try_send(report) {
            warn!("Échec de l'envoi du rapport: {}", e);
        }
    }
}

impl Alerter for ReportAlerter {
    fn notify(&self, alert: Alert) {
        self.send(Report::from(&alert));
    }

    fn record(&self, report: Report) {
        self.send(report);
    }
}

/// Ignore toutes les alertes
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAlerter;

impl Alerter for NullAlerter {
    fn notify(&self, alert: Alert) {
        debug!("Alerte ignorée: {} depuis {}", alert.threat_type, alert.source_ip);
    }
}
