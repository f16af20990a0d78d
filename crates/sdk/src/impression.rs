//! Impression reporting policy.
//!
//! One `count_impression` call drives two independent reporting paths:
//! a metered hit (only for users with a valid subscription) and a sampled
//! anonymous report that fires for a small fraction of all calls regardless
//! of authentication state.

use serde::Serialize;
use uuid::Uuid;

/// Fraction of `count_impression` calls that produce an anonymous report.
pub const SAMPLING_RATE: f64 = 0.05;

/// Number of leading property-id characters included in the anonymous
/// payload.
const PROPERTY_ID_PREFIX_LEN: usize = 8;

/// Decide whether a uniform draw in `[0,1)` triggers the anonymous report.
///
/// The comparison is strict: a draw exactly at the sampling rate does not
/// fire.
#[must_use]
pub fn should_report(draw: f64) -> bool {
    draw < SAMPLING_RATE
}

/// Payload of the sampled anonymous report, POSTed to the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SampledImpression {
    ea: &'static str,
    ec: &'static str,
    cpabid: Uuid,
    cppid: String,
    cpsr: f64,
}

impl SampledImpression {
    /// Build a payload for the given property. Each payload carries a fresh
    /// random impression id.
    #[must_use]
    pub fn new(property_id: &str) -> Self {
        Self {
            ea: "load",
            ec: "tcf-sampled",
            cpabid: Uuid::new_v4(),
            cppid: property_id.chars().take(PROPERTY_ID_PREFIX_LEN).collect(),
            cpsr: SAMPLING_RATE,
        }
    }
}
