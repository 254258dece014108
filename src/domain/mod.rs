//! Core domain types and logic.

pub mod series;
pub mod stats;
pub mod calendar;
pub mod qc;
pub mod rule;
pub mod expression;
pub mod evaluator;
pub mod event;
pub mod ledger;
pub mod notification;
pub mod engine;
pub mod config_validation;
pub mod error;
