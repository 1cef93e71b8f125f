//! Instantané de l'état du moteur
//!
//! Le dernier instantané est écrit de manière atomique (fichier temporaire
//! puis renommage) pour que `zsentinel status` ne lise jamais un fichier
//! à moitié écrit.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub blocked_count: usize,
    pub suspicious_count: usize,
    pub blocked_ids: Vec<IpAddr>,
    /// Sources bloquées dont la règle de pare-feu n'a pas pu être posée
    pub unenforced_ids: Vec<IpAddr>,
    pub anomaly_model_trained: bool,
    pub threat_model_trained: bool,
    /// `None` si aucun normaliseur n'est configuré
    pub normalizer_calibrated: Option<bool>,
    pub generated_at: DateTime<Utc>,
}

impl EngineStatus {
    /// Vrai si une partie de la détection est inactive
    pub fn is_degraded(&self) -> bool {
        !self.anomaly_model_trained
            || !self.threat_model_trained
            || self.normalizer_calibrated == Some(false)
    }

    /// Résumé lisible pour la ligne de commande
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Statut au {}\n  Sources bloquées: {}\n  Sources suspectes: {}\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S"),
            self.blocked_count,
            self.suspicious_count
        );
        for ip in &self.blocked_ids {
            let marker = if self.unenforced_ids.contains(ip) {
                " (règle non appliquée)"
            } else {
                ""
            };
            out.push_str(&format!("    - {}{}\n", ip, marker));
        }
        out.push_str(&format!(
            "  Détecteur d'anomalies: {}\n  Classifieur: {}\n",
            trained_label(self.anomaly_model_trained),
            trained_label(self.threat_model_trained)
        ));
        if let Some(calibrated) = self.normalizer_calibrated {
            out.push_str(&format!(
                "  Normaliseur: {}\n",
                if calibrated { "calibré" } else { "non calibré" }
            ));
        }
        if self.is_degraded() {
            out.push_str("  Mode dégradé actif\n");
        }
        out
    }
}

fn trained_label(trained: bool) -> &'static str {
    if trained {
        "entraîné"
    } else {
        "non entraîné"
    }
}

/// Écrit le dernier instantané dans un fichier JSON
pub struct StatusWriter {
    path: PathBuf,
}

impl StatusWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remplace le fichier de statut par l'instantané fourni
    pub fn write(&self, status: &EngineStatus) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(status)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Lit le dernier instantané écrit
pub fn read_status(path: &Path) -> Result<EngineStatus> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}
