//! Layer configuration and the routing scheme it resolves to.

use layers::{ActivationKind, FeedForwardConfig};
use serde::{Deserialize, Serialize};

use crate::error::{MoeError, Result};

/// Token id hash used by hash routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HashKind {
    /// `token_id mod num_experts`.
    #[default]
    Modulo,
    /// splitmix64 of `token_id ^ seed`, then mod.
    Mixed { seed: u64 },
}

impl HashKind {
    pub fn expert_for(&self, token_id: u32, num_experts: usize) -> u32 {
        let n = num_experts.max(1) as u64;
        let hashed = match self {
            HashKind::Modulo => token_id as u64,
            HashKind::Mixed { seed } => splitmix64(token_id as u64 ^ seed),
        };
        (hashed % n) as u32
    }
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Router and assignment policy of a [`GroupMoELayer`](crate::GroupMoELayer).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoutingScheme {
    Hash { hash: HashKind },
    /// Each token picks its top `k` experts; a capacity factor optionally
    /// bounds how many pairs an expert accepts per group.
    TokenChoice { k: usize, capacity_factor: Option<f64> },
    /// Each expert picks its top `capacity` tokens per group.
    ExpertChoice { capacity_factor: f64 },
}

impl RoutingScheme {
    pub fn name(&self) -> &'static str {
        match self {
            RoutingScheme::Hash { .. } => "hash",
            RoutingScheme::TokenChoice { .. } => "token_choice",
            RoutingScheme::ExpertChoice { .. } => "expert_choice",
        }
    }
}

/// Options shared by every mixture-of-experts layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoeConfig {
    pub num_experts: usize,
    /// Experts per token for token-choice routing. Mutually exclusive with `c`.
    pub k: usize,
    /// Expert-choice capacity factor. Mutually exclusive with `k`.
    pub c: f64,
    /// Tokens are routed in consecutive runs of this many tokens.
    pub group_size: usize,
    pub router_str: String,
    pub slots_per_expert: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub activation: ActivationKind,
    pub expert_dropout: f32,
    /// Enables capacity enforcement for token-choice routing.
    pub token_capacity_factor: Option<f64>,
    pub hash: HashKind,
    pub lb_coef: f64,
    pub z_coef: f64,
}

impl Default for MoeConfig {
    fn default() -> Self {
        Self {
            num_experts: 8,
            k: 0,
            c: 1.0,
            group_size: 16,
            router_str: "linear".to_string(),
            slots_per_expert: 1,
            hidden_size: 256,
            intermediate_size: 1024,
            activation: ActivationKind::NewGelu,
            expert_dropout: 0.1,
            token_capacity_factor: None,
            hash: HashKind::Modulo,
            lb_coef: 0.01,
            z_coef: 0.001,
        }
    }
}

impl MoeConfig {
    /// Checks the dimensions every layer variant depends on.
    pub fn validate_dims(&self) -> Result<()> {
        if self.num_experts == 0 {
            return Err(MoeError::Config("num_experts must be greater than zero".into()));
        }
        if self.group_size == 0 {
            return Err(MoeError::Config("group_size must be at least 1".into()));
        }
        if self.slots_per_expert == 0 {
            return Err(MoeError::Config("slots_per_expert must be greater than zero".into()));
        }
        if self.hidden_size == 0 || self.intermediate_size == 0 {
            return Err(MoeError::Config(format!(
                "expert dimensions must be positive (hidden={}, intermediate={})",
                self.hidden_size, self.intermediate_size
            )));
        }
        if !(0.0..1.0).contains(&self.expert_dropout) {
            return Err(MoeError::Config(format!(
                "expert_dropout must be in [0, 1), got {}",
                self.expert_dropout
            )));
        }
        Ok(())
    }

    /// Full validation for discretely routed layers.
    pub fn validate(&self) -> Result<()> {
        self.validate_dims()?;
        if !self.c.is_finite() || self.c < 0.0 {
            return Err(MoeError::InvalidRouting(format!(
                "c must be a finite non-negative number, got {}",
                self.c
            )));
        }
        match (self.k > 0, self.c > 0.0) {
            (true, true) | (false, false) => {
                return Err(MoeError::InvalidRouting(format!(
                    "exactly one of k ({}) and c ({}) must be nonzero",
                    self.k, self.c
                )))
            }
            _ => {}
        }
        if self.k > self.num_experts {
            return Err(MoeError::InvalidRouting(format!(
                "k ({}) cannot exceed num_experts ({})",
                self.k, self.num_experts
            )));
        }
        if let Some(factor) = self.token_capacity_factor {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(MoeError::InvalidRouting(format!(
                    "token_capacity_factor must be positive, got {factor}"
                )));
            }
        }
        Ok(())
    }

    /// Resolves `router_str`, `k` and `c` into a [`RoutingScheme`].
    pub fn routing_scheme(&self) -> Result<RoutingScheme> {
        let hashed = match self.router_str.as_str() {
            "hash" => true,
            "linear" => false,
            other => return Err(MoeError::InvalidRouter(other.to_string())),
        };
        self.validate()?;
        Ok(if hashed {
            RoutingScheme::Hash { hash: self.hash }
        } else if self.k > 0 {
            RoutingScheme::TokenChoice {
                k: self.k,
                capacity_factor: self.token_capacity_factor,
            }
        } else {
            RoutingScheme::ExpertChoice {
                capacity_factor: self.c,
            }
        })
    }

    /// Per-expert feed-forward configuration.
    pub fn expert_config(&self) -> FeedForwardConfig {
        FeedForwardConfig::new(self.hidden_size, self.intermediate_size, self.activation)
            .with_dropout(self.expert_dropout)
    }
}
