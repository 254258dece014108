//! Rule store port. Rules are read-only to the engine.

use crate::domain::error::QcwatchError;
use crate::domain::rule::RuleDefinition;

pub trait RulePort: Send + Sync {
    fn list_enabled_rules(&self) -> Result<Vec<RuleDefinition>, QcwatchError>;

    fn list_rules(&self) -> Result<Vec<RuleDefinition>, QcwatchError>;
}
