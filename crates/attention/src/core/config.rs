//! Configuration options shared by all attention implementations.

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
}

impl Config {
    /// Treats non-positive probabilities as "no dropout".
    pub fn with_dropout(p: f32) -> Self {
        Self {
            dropout_p: (p > 0.0).then_some(p),
        }
    }
}
