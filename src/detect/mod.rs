//! Detection layer: baseline statistics, threshold rules, and
//! multi-scanner correlation.

pub mod baseline;
pub mod correlation;
pub mod rules;

pub use baseline::BaselineManager;
pub use correlation::Correlator;
pub use rules::RuleEngine;
