//! Core types and rules for arbor-credits.
//!
//! This crate provides the foundational types used throughout the
//! arbor-credits service:
//!
//! - **Identifiers**: `UserId`, `GenerationId`, `TransactionId`
//! - **Users**: `User`, `Subscription`, trial counters
//! - **Token accounts**: `TokenAccount`
//! - **Ledger**: `TokenTransaction`, `TransactionType`
//! - **Generations**: `Generation`, `GenerationStatus`, `PaymentMethod`
//! - **Entitlement**: the payment-method priority resolver
//! - **Rate limiting**: `RateLimitRecord` request-attempt records
//!
//! # Token Unit
//!
//! **1 token = 1 generation.** A generation request consumes exactly one
//! entitlement unit regardless of how many areas it renders. Balances are
//! stored as integers; there is no fractional spend.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod entitlement;
pub mod generation;
pub mod ids;
pub mod rate_limit;
pub mod transaction;
pub mod user;

pub use account::TokenAccount;
pub use entitlement::resolve_entitlement;
pub use generation::{
    Generation, GenerationOutcome, GenerationRequest, GenerationStatus, PaymentMethod,
};
pub use ids::{GenerationId, IdError, TransactionId, UserId};
pub use rate_limit::RateLimitRecord;
pub use transaction::{TokenTransaction, TransactionType};
pub use user::{Subscription, SubscriptionStatus, SubscriptionTier, User};
