use crate::error::{EngineError, Result};
use crate::models::MAX_BLOCK_DURATION;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR: &str = "/etc/zsentinel";
pub const CONFIG_FILE: &str = "/etc/zsentinel/config.json";

/// Mode de journalisation utilisé par le système
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogMode {
    /// Journal dans un fichier local
    #[default]
    File,
    /// Journal via systemd-journal
    SystemdJournal,
}

/// Mécanisme utilisé pour appliquer les blocages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EnforcementMode {
    /// Règles DROP iptables
    #[default]
    Iptables,
    /// Journalise les intentions sans toucher au pare-feu
    DryRun,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Interface réseau à surveiller
    pub interface: String,

    /// Nombre maximal de paquets acceptés par seconde depuis la capture
    pub max_packets_per_second: u32,

    /// Nombre de paquets agrégés par fenêtre d'analyse
    pub window_size: usize,

    /// Confiance minimale (stricte) pour bloquer automatiquement une source
    pub block_threshold: f64,

    /// Durée de blocage (en secondes)
    pub block_duration: u64,

    /// Intervalle (en secondes) entre deux passes de réconciliation
    pub reconciliation_interval: u64,

    /// IPs jamais bloquées
    pub whitelist: Vec<String>,

    /// Chemin vers le fichier de log
    pub log_file: String,

    /// Niveau de log
    pub log_level: String,

    /// Mode de journalisation (fichier ou systemd-journal)
    pub log_mode: LogMode,

    /// Journal d'audit des décisions (blocages, déblocages, alertes)
    pub audit_log_file: String,

    /// Fichier où est écrit le dernier instantané de statut
    pub status_file: String,

    /// Intervalle (en secondes) d'écriture du statut
    pub status_interval: u64,

    /// Artefact du modèle de détection d'anomalies
    pub anomaly_model_path: String,

    /// Artefact du modèle de classification des menaces
    pub threat_model_path: String,

    /// Jeu de vecteurs représentatifs pour calibrer le normaliseur
    pub calibration_file: Option<String>,

    pub enforcement: EnforcementMode,

    /// Chaîne iptables où sont insérées les règles
    pub iptables_chain: String,

    /// Nombre de tâches d'analyse concurrentes
    pub analyzer_workers: usize,

    /// Nombre maximal de sources ayant une fenêtre en cours de remplissage
    pub max_pending_sources: usize,

    /// Durée (en secondes) après laquelle une fenêtre non alimentée est oubliée
    pub pending_idle_timeout: u64,

    pub packet_queue_size: usize,
    pub report_queue_size: usize,

    /// Retirer tous les blocages à l'arrêt du service
    pub release_on_shutdown: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interface: "eth0".to_string(),
            max_packets_per_second: 10_000,
            window_size: 100,
            block_threshold: 0.85,
            block_duration: 3600,
            reconciliation_interval: 300, // 5 minutes
            whitelist: vec!["127.0.0.1".to_string(), "::1".to_string()],
            log_file: "/var/log/zsentinel/zsentinel.log".to_string(),
            log_level: "info".to_string(),
            log_mode: LogMode::File,
            audit_log_file: "/var/log/zsentinel/audit.log".to_string(),
            status_file: "/var/lib/zsentinel/status.json".to_string(),
            status_interval: 30,
            anomaly_model_path: "/var/lib/zsentinel/models/anomaly.json".to_string(),
            threat_model_path: "/var/lib/zsentinel/models/threat.json".to_string(),
            calibration_file: None,
            enforcement: EnforcementMode::Iptables,
            iptables_chain: "INPUT".to_string(),
            analyzer_workers: num_cpus::get(),
            max_pending_sources: 65_536,
            pending_idle_timeout: 60,
            packet_queue_size: 10_000,
            report_queue_size: 1000,
            release_on_shutdown: true,
        }
    }
}

impl Config {
    /// Charge la configuration depuis le fichier par défaut, en le créant s'il n'existe pas
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        if !path.exists() {
            let default_config = Config::default();
            default_config.save_to(path)?;
            return Ok(default_config);
        }
        Self::load_from(path)
    }

    /// Charge la configuration depuis un fichier précis
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Sauvegarde la configuration dans le fichier indiqué
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Vérifie la cohérence des paramètres ; toute erreur ici est fatale au démarrage
    pub fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            return Err(EngineError::Config("interface vide".into()));
        }
        if self.max_packets_per_second == 0 {
            return Err(EngineError::Config("max_packets_per_second doit être > 0".into()));
        }
        if self.window_size == 0 {
            return Err(EngineError::Config("window_size doit être > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.block_threshold) || self.block_threshold.is_nan() {
            return Err(EngineError::Config(format!(
                "block_threshold hors de [0, 1]: {}",
                self.block_threshold
            )));
        }
        let max_secs = MAX_BLOCK_DURATION.as_secs();
        if self.block_duration == 0 || self.block_duration > max_secs {
            return Err(EngineError::Config(format!(
                "block_duration doit être dans [1, {}]: {}",
                max_secs, self.block_duration
            )));
        }
        if self.reconciliation_interval == 0 || self.status_interval == 0 {
            return Err(EngineError::Config("les intervalles doivent être > 0".into()));
        }
        if self.max_pending_sources == 0 || self.pending_idle_timeout == 0 {
            return Err(EngineError::Config(
                "max_pending_sources et pending_idle_timeout doivent être > 0".into(),
            ));
        }
        if self.reconciliation_interval > max_secs
            || self.status_interval > max_secs
            || self.pending_idle_timeout > max_secs
        {
            return Err(EngineError::Config(format!("les intervalles doivent être <= {} s", max_secs)));
        }
        if self.analyzer_workers == 0 || self.packet_queue_size == 0 || self.report_queue_size == 0 {
            return Err(EngineError::Config("les tailles de files et de pool doivent être > 0".into()));
        }
        self.whitelist_ips()?;
        Ok(())
    }

    /// Liste blanche analysée en adresses IP
    pub fn whitelist_ips(&self) -> Result<Vec<IpAddr>> {
        self.whitelist
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| EngineError::Config(format!("IP de liste blanche invalide: {}", s)))
            })
            .collect()
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval)
    }

    pub fn pending_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_idle_timeout)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval)
    }

    pub fn status_path(&self) -> PathBuf {
        PathBuf::from(&self.status_file)
    }

    /// Convertit le niveau de log textuel en filtre
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.log_level.to_lowercase().as_str() {
            "trace" => log::LevelFilter::Trace,
            "debug" => log::LevelFilter::Debug,
            "info" => log::LevelFilter::Info,
            "warn" => log::LevelFilter::Warn,
            "error" => log::LevelFilter::Error,
            "off" => log::LevelFilter::Off,
            _ => log::LevelFilter::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.block_threshold, 0.85);
        assert_eq!(config.block_duration, 3600);
        assert_eq!(config.reconciliation_interval, 300);
        assert_eq!(config.window_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = Config::default();
        config.block_threshold = 1.5;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = Config::default();
        config.window_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_durations() {
        let mut config = Config::default();
        config.block_duration = u64::MAX;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        config.block_duration = MAX_BLOCK_DURATION.as_secs();
        assert!(config.validate().is_ok());

        config.reconciliation_interval = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_whitelist() {
        let mut config = Config::default();
        config.whitelist.push("pas-une-ip".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"interface": "wlan0", "block_threshold": 0.9}"#).unwrap();
        assert_eq!(config.interface, "wlan0");
        assert_eq!(config.block_threshold, 0.9);
        assert_eq!(config.block_duration, 3600);
    }

    #[test]
    fn test_level_filter() {
        let mut config = Config::default();
        config.log_level = "DEBUG".into();
        assert_eq!(config.level_filter(), log::LevelFilter::Debug);
        config.log_level = "n'importe quoi".into();
        assert_eq!(config.level_filter(), log::LevelFilter::Info);
    }
}
