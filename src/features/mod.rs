//! Extraction et agrégation des caractéristiques de trafic

mod extractor;
mod normalizer;
mod window;

pub use extractor::*;
pub use normalizer::*;
pub use window::*;

#[cfg(test)]
pub(crate) use extractor::tests;
