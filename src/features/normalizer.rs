//! Normalisation des vecteurs (centrage-réduction)
//!
//! Le normaliseur doit être calibré explicitement, une seule fois, sur un
//! jeu représentatif avant que le moteur n'accepte du trafic réel. Tant que
//! ce n'est pas fait, `transform` échoue avec `NormalizerNotCalibrated`.
//! La calibration est protégée par un `OnceCell` : une seule écriture,
//! lectures concurrentes sans verrou ensuite.

use crate::error::{EngineError, Result};
use crate::models::FeatureVector;
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Paramètres calculés lors de la calibration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalerParams {
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

#[derive(Debug)]
pub struct Normalizer {
    dimension: usize,
    params: OnceCell<ScalerParams>,
}

impl Normalizer {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            params: OnceCell::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn is_calibrated(&self) -> bool {
        self.params.get().is_some()
    }

    /// Calibre le normaliseur sur un ensemble d'échantillons
    pub fn calibrate(&self, samples: &[FeatureVector]) -> Result<()> {
        if samples.is_empty() {
            return Err(EngineError::InsufficientWindow {
                available: 0,
                required: 1,
            });
        }
        for sample in samples {
            self.check_dimension(sample)?;
        }

        let n = samples.len() as f64;
        let mut means = vec![0.0; self.dimension];
        for sample in samples {
            for (m, x) in means.iter_mut().zip(sample.as_slice()) {
                *m += x / n;
            }
        }
        let mut scales = vec![0.0; self.dimension];
        for sample in samples {
            for ((s, x), m) in scales.iter_mut().zip(sample.as_slice()).zip(&means) {
                *s += (x - m) * (x - m) / n;
            }
        }
        // Variance nulle : on garde l'échelle unitaire
        for s in scales.iter_mut() {
            *s = if *s > 0.0 { s.sqrt() } else { 1.0 };
        }

        self.params
            .set(ScalerParams { means, scales })
            .map_err(|_| EngineError::NormalizerAlreadyCalibrated)?;
        info!("Normaliseur calibré sur {} échantillons", samples.len());
        Ok(())
    }

    /// Calibre à partir d'un fichier JSON contenant une liste de vecteurs
    pub fn calibrate_from_file(&self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)?;
        let samples: Vec<FeatureVector> = serde_json::from_str(&content)?;
        self.calibrate(&samples)
    }

    pub fn transform(&self, vector: &FeatureVector) -> Result<FeatureVector> {
        self.check_dimension(vector)?;
        let params = self.params.get().ok_or(EngineError::NormalizerNotCalibrated)?;
        let values = vector
            .as_slice()
            .iter()
            .zip(params.means.iter().zip(&params.scales))
            .map(|(x, (m, s))| (x - m) / s)
            .collect();
        Ok(FeatureVector::new(values))
    }

    fn check_dimension(&self, vector: &FeatureVector) -> Result<()> {
        if vector.dim() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.dim(),
            });
        }
        Ok(())
    }
}
