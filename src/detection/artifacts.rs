//! Modèles chargés depuis des artefacts JSON
//!
//! Ces modèles ne font que consommer des paramètres produits hors ligne ;
//! aucun apprentissage n'a lieu ici. Un artefact absent donne un modèle non
//! entraîné (mode dégradé), un artefact illisible est une erreur de démarrage.

use super::{AnomalyLabel, AnomalyModel, ThreatModel, ThreatPrediction, UntrainedModel};
use crate::error::{EngineError, Result};
use crate::models::{FeatureVector, ThreatType};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Seuil z par défaut au-delà duquel une dimension est jugée anormale
const DEFAULT_Z_THRESHOLD: f64 = 3.0;

fn default_z_threshold() -> f64 {
    DEFAULT_Z_THRESHOLD
}

/// Détecteur par écart à la moyenne (z-score) sur chaque dimension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZScoreAnomalyModel {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    #[serde(default = "default_z_threshold")]
    pub threshold: f64,
}

impl ZScoreAnomalyModel {
    pub fn new(means: Vec<f64>, stds: Vec<f64>, threshold: f64) -> Result<Self> {
        let model = Self { means, stds, threshold };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        if self.means.is_empty() || self.means.len() != self.stds.len() {
            return Err(EngineError::Config(format!(
                "modèle d'anomalie incohérent: {} moyennes, {} écarts-types",
                self.means.len(),
                self.stds.len()
            )));
        }
        if self.threshold.is_nan() || self.threshold <= 0.0 {
            return Err(EngineError::Config("seuil z du modèle d'anomalie invalide".into()));
        }
        Ok(())
    }

    /// Plus grand |z| observé sur le vecteur
    pub fn max_z_score(&self, vector: &FeatureVector) -> f64 {
        vector
            .as_slice()
            .iter()
            .zip(self.means.iter().zip(&self.stds))
            .map(|(x, (m, s))| {
                let scale = if *s > 0.0 { *s } else { 1.0 };
                ((x - m) / scale).abs()
            })
            .fold(0.0, f64::max)
    }
}

impl AnomalyModel for ZScoreAnomalyModel {
    fn is_trained(&self) -> bool {
        true
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.means.len())
    }

    fn predict(&self, vector: &FeatureVector) -> Result<AnomalyLabel> {
        check_dimension(self.means.len(), vector)?;
        if self.max_z_score(vector) > self.threshold {
            Ok(AnomalyLabel::Anomaly)
        } else {
            Ok(AnomalyLabel::Normal)
        }
    }
}

/// Centroïde d'une classe de menace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassCentroid {
    pub label: usize,
    pub name: String,
    pub centroid: Vec<f64>,
}

/// Classifieur au plus proche centroïde, probabilités par softmax des distances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidThreatModel {
    pub classes: Vec<ClassCentroid>,
}

impl CentroidThreatModel {
    pub fn new(classes: Vec<ClassCentroid>) -> Result<Self> {
        let model = Self { classes };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        let dim = match self.classes.first() {
            Some(class) if !class.centroid.is_empty() => class.centroid.len(),
            _ => return Err(EngineError::Config("classifieur sans classe".into())),
        };
        if self.classes.iter().any(|c| c.centroid.len() != dim) {
            return Err(EngineError::Config("centroïdes de dimensions différentes".into()));
        }
        Ok(())
    }
}

impl ThreatModel for CentroidThreatModel {
    fn is_trained(&self) -> bool {
        true
    }

    fn dimension(&self) -> Option<usize> {
        self.classes.first().map(|c| c.centroid.len())
    }

    fn predict(&self, vector: &FeatureVector) -> Result<ThreatPrediction> {
        let dim = self.dimension().unwrap_or(0);
        check_dimension(dim, vector)?;

        let scores: Vec<f64> = self
            .classes
            .iter()
            .map(|class| {
                -class
                    .centroid
                    .iter()
                    .zip(vector.as_slice())
                    .map(|(c, x)| (c - x) * (c - x))
                    .sum::<f64>()
                    .sqrt()
            })
            .collect();

        // Softmax stabilisé
        let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        let probabilities: Vec<f64> = exps.iter().map(|e| e / total).collect();

        let best = super::max_confidence(&probabilities).map(|(i, _)| i).unwrap_or(0);
        Ok(ThreatPrediction {
            label: self.classes[best].label,
            probabilities,
        })
    }

    fn threat_type(&self, label: usize) -> ThreatType {
        self.classes
            .iter()
            .find(|c| c.label == label)
            .map(|c| ThreatType::from_name(&c.name))
            .unwrap_or_else(|| ThreatType::from_label(label))
    }
}

fn check_dimension(expected: usize, vector: &FeatureVector) -> Result<()> {
    if vector.dim() != expected {
        return Err(EngineError::DimensionMismatch {
            expected,
            actual: vector.dim(),
        });
    }
    Ok(())
}

/// Charge le modèle d'anomalie ; un fichier absent donne un modèle non entraîné
pub fn load_anomaly_model(path: &Path) -> Result<Arc<dyn AnomalyModel>> {
    if !path.exists() {
        warn!("Modèle d'anomalie introuvable ({}), mode dégradé", path.display());
        return Ok(Arc::new(UntrainedModel));
    }
    let model: ZScoreAnomalyModel = serde_json::from_str(&fs::read_to_string(path)?)?;
    model.validate()?;
    info!("Modèle d'anomalie chargé depuis {} ({} dimensions)", path.display(), model.means.len());
    Ok(Arc::new(model))
}

/// Charge le classifieur de menaces ; un fichier absent donne un modèle non entraîné
pub fn load_threat_model(path: &Path) -> Result<Arc<dyn ThreatModel>> {
    if !path.exists() {
        warn!("Classifieur de menaces introuvable ({}), mode dégradé", path.display());
        return Ok(Arc::new(UntrainedModel));
    }
    let model: CentroidThreatModel = serde_json::from_str(&fs::read_to_string(path)?)?;
    model.validate()?;
    info!("Classifieur chargé depuis {} ({} classes)", path.display(), model.classes.len());
    Ok(Arc::new(model))
}

/// Vérifie qu'une dimension de modèle correspond à la sortie de l'extracteur
pub fn verify_dimension(name: &str, model_dimension: Option<usize>, expected: usize) -> Result<()> {
    match model_dimension {
        Some(dim) if dim != expected => Err(EngineError::Config(format!(
            "{}: dimension {} incompatible avec l'extracteur ({})",
            name, dim, expected
        ))),
        _ => Ok(()),
    }
}
