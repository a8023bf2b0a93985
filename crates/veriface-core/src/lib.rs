//! Face feature extraction, liveness gating and cascade identity verification.

pub mod capture;
pub mod cascade;
pub mod errors;
pub mod faces;
pub mod providers;

pub use cascade::{ActionContext, Cascade, CascadeDecision, DecisionReason};
pub use errors::{AppError, AppResult};
