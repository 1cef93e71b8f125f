//! Journal d'audit des décisions
//!
//! Une ligne horodatée par événement (blocage, déblocage, alerte, libération,
//! échec du pare-feu). En mode systemd-journal les lignes passent par la
//! façade `log` au lieu d'un fichier.

use crate::config::LogMode;
use crate::models::{Report, ReportType};
use chrono::{DateTime, Local};
use log::{error, info, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::mpsc;

pub struct AuditLogger {
    log_file: Mutex<Option<File>>,
    log_path: String,
    log_mode: LogMode,
}

impl AuditLogger {
    pub fn new(log_path: String, log_mode: LogMode) -> Self {
        let file = if log_mode == LogMode::File {
            open_log_file(&log_path)
        } else {
            None
        };

        Self {
            log_file: Mutex::new(file),
            log_path,
            log_mode,
        }
    }

    /// Formate un rapport en ligne d'audit
    pub fn format_report(report: &Report) -> String {
        let timestamp: DateTime<Local> = report.timestamp.into();
        let source_ip = match report.source_ip {
            Some(ip) => ip.to_string(),
            None => "N/A".to_string(),
        };

        let mut line = format!(
            "[{}] [{}] [IP: {}] [sévérité {}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            label(report.report_type),
            source_ip,
            report.severity,
            report.message
        );
        if let Some(details) = &report.details {
            line.push_str(" | ");
            line.push_str(details);
        }
        line
    }

    pub fn log_report(&self, report: &Report) {
        let line = Self::format_report(report);

        match self.log_mode {
            LogMode::File => self.write_to_log(&format!("{}\n", line)),
            LogMode::SystemdJournal => match report.report_type {
                ReportType::Failure => error!("{}", line),
                ReportType::Threat | ReportType::Block => warn!("{}", line),
                ReportType::Unblock | ReportType::Release | ReportType::Info => info!("{}", line),
            },
        }
    }

    /// Consomme le canal de rapports jusqu'à sa fermeture
    pub async fn drain(self, mut report_rx: mpsc::Receiver<Report>) {
        while let Some(report) = report_rx.recv().await {
            self.log_report(&report);
        }
    }

    fn write_to_log(&self, message: &str) {
        let mut guard = match self.log_file.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("Erreur lors de l'acquisition du verrou du journal d'audit: {}", e);
                return;
            }
        };

        let failed = match guard.as_mut() {
            Some(file) => match file.write_all(message.as_bytes()) {
                Ok(()) => false,
                Err(e) => {
                    error!("Erreur lors de l'écriture dans le journal d'audit: {}", e);
                    true
                }
            },
            None => true,
        };

        // Réouverture, puis une seconde tentative
        if failed {
            *guard = open_log_file(&self.log_path);
            if let Some(file) = guard.as_mut() {
                if let Err(e) = file.write_all(message.as_bytes()) {
                    error!("Le journal d'audit reste inaccessible: {}", e);
                }
            }
        }
    }
}

fn label(report_type: ReportType) -> &'static str {
    match report_type {
        ReportType::Threat => "ALERT",
        ReportType::Block => "BLOCK",
        ReportType::Unblock => "UNBLOCK",
        ReportType::Release => "RELEASE",
        ReportType::Failure => "ENFORCEMENT-FAILURE",
        ReportType::Info => "INFO",
    }
}

fn open_log_file(log_path: &str) -> Option<File> {
    if let Some(parent) = Path::new(log_path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!("Erreur lors de la création du répertoire de logs: {}", e);
        }
    }

    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => Some(file),
        Err(e) => {
            error!("Erreur lors de l'ouverture du journal d'audit {}: {}", log_path, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_format_report() {
        let report = Report::new(ReportType::Block, "IP 10.0.0.5 bloquée".into())
            .with_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)))
            .with_details("Port Scan".into())
            .with_severity(8);

        let line = AuditLogger::format_report(&report);
        assert!(line.contains("[BLOCK] [IP: 10.0.0.5] [sévérité 8] IP 10.0.0.5 bloquée | Port Scan"));
    }

    #[tokio::test]
    async fn test_drain_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/audit.log");
        let logger = AuditLogger::new(path.to_string_lossy().into_owned(), LogMode::File);

        let (tx, rx) = mpsc::channel(8);
        tx.send(Report::new(ReportType::Release, "IP libérée".into())).await.unwrap();
        tx.send(Report::new(ReportType::Failure, "échec".into())).await.unwrap();
        drop(tx);
        logger.drain(rx).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[RELEASE]"));
        assert!(lines[1].contains("[ENFORCEMENT-FAILURE]"));
    }
}
