//! Validation gate and rules.
//!
//! The gate decides whether a set of task outputs is acceptable for a phase.
//! It never raises: every verdict, including failures of the rules
//! themselves, comes back as a [`ValidationResult`].

mod gate;
mod rule;

pub use gate::{ValidationError, ValidationGate, ValidationResult};
pub use rule::{
    payload_text, FnRule, MinimumLength, NonEmptyContent, NonEmptyOutputs, Rule, RuleOutcome,
    RuleScope,
};
