//! Types d'erreurs du moteur de décision
//!
//! Chaque variante correspond à une classe de défaillance dont la politique
//! de propagation est différente : les erreurs d'extraction et de modèle sont
//! absorbées localement, les erreurs d'application des règles sont journalisées
//! et exposées via le statut, seules les erreurs de configuration sont fatales.

use std::net::IpAddr;
use thiserror::Error;

/// Erreurs pouvant survenir dans le moteur
#[derive(Debug, Error)]
pub enum EngineError {
    /// Trame trop courte ou en-tête incohérent
    #[error("paquet malformé: {0}")]
    MalformedPacket(String),

    /// Trame non IP (ARP, LLDP, ...), ignorée comme un paquet malformé
    #[error("trame non prise en charge (ethertype 0x{0:04x})")]
    UnsupportedFrame(u16),

    /// Pas encore assez de paquets pour former une fenêtre
    #[error("fenêtre incomplète: {available}/{required} paquets")]
    InsufficientWindow { available: usize, required: usize },

    /// Vecteur dont la dimension ne correspond pas à celle de l'extracteur
    #[error("dimension de vecteur invalide: attendu {expected}, reçu {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Le normaliseur n'a pas encore été calibré
    #[error("normaliseur non calibré")]
    NormalizerNotCalibrated,

    /// Le normaliseur a déjà été calibré (calibration unique)
    #[error("normaliseur déjà calibré")]
    NormalizerAlreadyCalibrated,

    /// Modèle de détection ou de classification non entraîné
    #[error("modèle non entraîné: {0}")]
    ModelUntrained(&'static str),

    /// Échec de l'appel au mécanisme de blocage
    #[error("échec de l'application de la règle pour {ip}: {message}")]
    EnforcementFailure { ip: IpAddr, message: String },

    /// Erreur de la source de capture
    #[error("erreur de capture: {0}")]
    Capture(String),

    /// Configuration invalide (fatal au démarrage)
    #[error("configuration invalide: {0}")]
    Config(String),

    #[error("erreur d'E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("erreur JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Indique si l'erreur concerne un paquet isolé (à ignorer sans interrompre la fenêtre)
    pub fn is_packet_local(&self) -> bool {
        matches!(self, Self::MalformedPacket(_) | Self::UnsupportedFrame(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
