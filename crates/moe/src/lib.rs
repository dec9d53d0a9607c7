//! Mixture-of-experts routing on candle.
//!
//! The crate is organised along the data flow of a routed layer:
//!
//! 1. [`router`] scores `[tokens, hidden]` features against the experts.
//! 2. [`assignment`] turns scores into token-choice, expert-choice or hash
//!    selections plus combination weights, applying the limits from
//!    [`capacity`].
//! 3. [`experts`] runs the selected tokens through the expert bank and
//!    [`combiner`] scatters the weighted outputs back into token order.
//! 4. Every layer returns a [`LayerCache`]; the model collects them into a
//!    [`FullCache`] from which [`losses`] computes the auxiliary objectives.
//!
//! [`GroupMoELayer`] wires the discrete policies together. [`SoftExpertLayer`]
//! and [`SmearLayer`] are the fully differentiable alternatives.

pub mod assignment;
pub mod cache;
pub mod capacity;
pub mod combiner;
pub mod config;
pub mod error;
pub mod experts;
pub mod layer;
pub mod losses;
pub mod router;
pub mod smear;
pub mod soft;

pub use cache::{FullCache, LayerCache, RoutingKind};
pub use capacity::capacity;
pub use config::{HashKind, MoeConfig, RoutingScheme};
pub use error::{MoeError, Result};
pub use experts::{Expert, ExpertBank, ExpertFromWeights, ExpertLinearParams};
pub use layer::GroupMoELayer;
pub use losses::{AuxLossWeights, AuxLosses};
pub use router::Router;
pub use smear::SmearLayer;
pub use soft::SoftExpertLayer;
