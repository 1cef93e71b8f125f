//! Agrégation d'une fenêtre de paquets
//!
//! Pour chaque dimension du vecteur de paquet, on calcule dans cet ordre :
//! moyenne, écart-type (population), médiane, maximum, minimum, 75e et 25e
//! percentiles. Les blocs sont concaténés statistique par statistique ; cet
//! ordre est figé car les modèles sont entraînés sur lui.

use super::extractor::{extract_packet_features, PACKET_FEATURE_DIM};
use crate::error::{EngineError, Result};
use crate::models::{FeatureVector, PacketRecord};
use log::debug;

/// Noms des statistiques, dans l'ordre de concaténation
pub const WINDOW_STATISTICS: [&str; 7] = ["mean", "std", "median", "max", "min", "p75", "p25"];

/// Dimension d'un vecteur de fenêtre
pub const WINDOW_FEATURE_DIM: usize = PACKET_FEATURE_DIM * WINDOW_STATISTICS.len();

/// Agrège les `window_size` premiers paquets en un vecteur de fenêtre.
///
/// Retourne `Ok(None)` si la fenêtre n'est pas encore complète. Les paquets
/// malformés sont ignorés ; une fenêtre sans aucun paquet valide est une erreur.
pub fn aggregate_window(packets: &[PacketRecord], window_size: usize) -> Result<Option<FeatureVector>> {
    if window_size == 0 || packets.len() < window_size {
        debug!(
            "Fenêtre incomplète: {}/{} paquets",
            packets.len(),
            window_size
        );
        return Ok(None);
    }

    let mut vectors = Vec::with_capacity(window_size);
    let mut skipped = 0usize;
    for packet in &packets[..window_size] {
        match extract_packet_features(packet) {
            Ok(features) => vectors.push(features),
            Err(e) if e.is_packet_local() => {
                skipped += 1;
                debug!("Paquet ignoré dans la fenêtre: {}", e);
            }
            Err(e) => return Err(e),
        }
    }

    if vectors.is_empty() {
        return Err(EngineError::MalformedPacket(format!(
            "aucun paquet exploitable dans la fenêtre ({} ignorés)",
            skipped
        )));
    }

    aggregate_vectors(&vectors).map(Some)
}

/// Agrège des vecteurs de paquets déjà extraits
pub fn aggregate_vectors(vectors: &[FeatureVector]) -> Result<FeatureVector> {
    let first = vectors.first().ok_or(EngineError::InsufficientWindow {
        available: 0,
        required: 1,
    })?;
    let dim = first.dim();
    if let Some(bad) = vectors.iter().find(|v| v.dim() != dim) {
        return Err(EngineError::DimensionMismatch {
            expected: dim,
            actual: bad.dim(),
        });
    }

    let mut blocks: Vec<Vec<f64>> = vec![Vec::with_capacity(dim); WINDOW_STATISTICS.len()];
    let mut column = Vec::with_capacity(vectors.len());
    for d in 0..dim {
        column.clear();
        column.extend(vectors.iter().map(|v| v.as_slice()[d]));
        let stats = column_statistics(&mut column);
        for (block, value) in blocks.iter_mut().zip(stats) {
            block.push(value);
        }
    }

    Ok(FeatureVector::new(blocks.concat()))
}

/// Statistiques d'une colonne, dans l'ordre de `WINDOW_STATISTICS`
fn column_statistics(values: &mut [f64]) -> [f64; 7] {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;

    values.sort_by(|a, b| a.total_cmp(b));
    [
        mean,
        variance.sqrt(),
        percentile(values, 50.0),
        values[values.len() - 1],
        values[0],
        percentile(values, 75.0),
        percentile(values, 25.0),
    ]
}

/// Percentile par interpolation linéaire sur des valeurs triées
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    let fraction = rank - low as f64;
    sorted[low] + (sorted[high] - sorted[low]) * fraction
}
