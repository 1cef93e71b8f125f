//! Pipeline de détection en deux étapes
//!
//! 1. Filtre d'anomalie binaire (normal / à investiguer)
//! 2. Attribution du type de menace avec un niveau de confiance, uniquement
//!    pour les vecteurs signalés par l'étape 1
//!
//! Les modèles sont fournis de l'extérieur via les traits `AnomalyModel` et
//! `ThreatModel`. Un modèle non entraîné n'est jamais une erreur fatale : le
//! pipeline produit alors un résultat normal, marqué comme dégradé.

mod artifacts;

pub use artifacts::*;

use crate::error::{EngineError, Result};
use crate::models::{DetectionResult, FeatureVector, ThreatType};
use log::{debug, error};
use std::sync::Arc;

/// Verdict du filtre d'anomalie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyLabel {
    Normal,
    Anomaly,
}

/// Prédiction brute du classifieur de menaces
#[derive(Debug, Clone, PartialEq)]
pub struct ThreatPrediction {
    pub label: usize,
    /// Distribution de probabilité sur les K classes
    pub probabilities: Vec<f64>,
}

/// Modèle de détection d'anomalies
pub trait AnomalyModel: Send + Sync {
    fn is_trained(&self) -> bool;

    /// Dimension d'entrée attendue, si connue
    fn dimension(&self) -> Option<usize>;

    /// Retourne `ModelUntrained` si le modèle n'est pas prêt
    fn predict(&self, vector: &FeatureVector) -> Result<AnomalyLabel>;
}

/// Modèle de classification des menaces
pub trait ThreatModel: Send + Sync {
    fn is_trained(&self) -> bool;

    fn dimension(&self) -> Option<usize>;

    /// Retourne `ModelUntrained` si le modèle n'est pas prêt
    fn predict(&self, vector: &FeatureVector) -> Result<ThreatPrediction>;

    /// Nom de la classe associée à un label
    fn threat_type(&self, label: usize) -> ThreatType {
        ThreatType::from_label(label)
    }
}

/// Modèle vide, toujours non entraîné
#[derive(Debug, Default, Clone, Copy)]
pub struct UntrainedModel;

impl AnomalyModel for UntrainedModel {
    fn is_trained(&self) -> bool {
        false
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    fn predict(&self, _vector: &FeatureVector) -> Result<AnomalyLabel> {
        Err(EngineError::ModelUntrained("détecteur d'anomalies"))
    }
}

impl ThreatModel for UntrainedModel {
    fn is_trained(&self) -> bool {
        false
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    fn predict(&self, _vector: &FeatureVector) -> Result<ThreatPrediction> {
        Err(EngineError::ModelUntrained("classifieur de menaces"))
    }
}

/// Index et valeur de la probabilité maximale.
///
/// En cas d'égalité, le premier index l'emporte. Les valeurs non finies sont
/// ignorées et le résultat est borné à [0, 1].
pub fn max_confidence(probabilities: &[f64]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (index, &p) in probabilities.iter().enumerate() {
        if !p.is_finite() {
            continue;
        }
        match best {
            Some((_, current)) if p <= current => {}
            _ => best = Some((index, p)),
        }
    }
    best.map(|(index, p)| (index, p.clamp(0.0, 1.0)))
}

#[derive(Clone)]
pub struct DetectionPipeline {
    anomaly_model: Arc<dyn AnomalyModel>,
    threat_model: Arc<dyn ThreatModel>,
}

impl DetectionPipeline {
    pub fn new(anomaly_model: Arc<dyn AnomalyModel>, threat_model: Arc<dyn ThreatModel>) -> Self {
        Self {
            anomaly_model,
            threat_model,
        }
    }

    pub fn anomaly_model_trained(&self) -> bool {
        self.anomaly_model.is_trained()
    }

    pub fn threat_model_trained(&self) -> bool {
        self.threat_model.is_trained()
    }

    /// Étape 1 : le vecteur doit-il être investigué ?
    pub fn screen(&self, vector: &FeatureVector) -> Result<bool> {
        Ok(self.anomaly_model.predict(vector)? == AnomalyLabel::Anomaly)
    }

    /// Étape 2 : type de menace et confiance
    pub fn classify(&self, vector: &FeatureVector) -> Result<(ThreatType, f64)> {
        let prediction = self.threat_model.predict(vector)?;
        let confidence = max_confidence(&prediction.probabilities)
            .map(|(_, p)| p)
            .unwrap_or(0.0);
        Ok((self.threat_model.threat_type(prediction.label), confidence))
    }

    /// Exécute les deux étapes, sans jamais échouer
    pub fn run(&self, vector: &FeatureVector) -> DetectionResult {
        match self.screen(vector) {
            Ok(false) => return DetectionResult::normal(),
            Ok(true) => {}
            Err(e) => return Self::recover(e),
        }

        match self.classify(vector) {
            Ok((threat_type, confidence)) => DetectionResult {
                is_anomaly: true,
                threat_type,
                confidence,
                degraded: false,
            },
            Err(e) => Self::recover(e),
        }
    }

    fn recover(err: EngineError) -> DetectionResult {
        match err {
            EngineError::ModelUntrained(model) => {
                debug!("Mode dégradé: {} non entraîné", model);
            }
            other => {
                error!("Erreur lors de la détection: {}", other);
            }
        }
        DetectionResult::degraded()
    }
}
