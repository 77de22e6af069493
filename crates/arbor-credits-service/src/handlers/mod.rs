//! API handlers.

pub mod accounts;
pub mod credits;
pub mod generations;
pub mod health;
pub mod webhooks;
