//! Bibliothèque ZSentinel : moteur de décision pour pare-feu
//!
//! Les paquets capturés sont réduits en vecteurs de caractéristiques,
//! agrégés par fenêtre puis soumis à un pipeline de détection en deux
//! étapes (filtre d'anomalie, puis attribution du type de menace). Les
//! sources jugées dangereuses sont bloquées pour une durée limitée ; une
//! tâche de réconciliation retire les blocages expirés.

// Modèles et socle
pub mod clock;  // Source de temps injectable
pub mod config; // Configuration du système
pub mod error;  // Types d'erreurs
pub mod models; // Structures de données

// Chaîne d'analyse
pub mod capture;    // Sources de paquets (pcap, mémoire)
pub mod detection;  // Pipeline de détection et modèles
pub mod features;   // Extraction et agrégation des caractéristiques
pub mod monitor;    // Boucle d'ingestion
pub mod protection; // Moteur de décision, registre et blocages

// Sorties
pub mod cli;    // Interface en ligne de commande
pub mod logger; // Journal d'audit
pub mod status; // Instantané de statut

pub use config::{Config, EnforcementMode, LogMode};
pub use error::{EngineError, Result};
pub use models::{DetectionResult, FeatureVector, PacketInfo, PacketRecord, Report, ReportType, ThreatType};
pub use protection::{DecisionEngine, EngineSettings};
pub use status::EngineStatus;
