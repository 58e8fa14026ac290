//! Head sampling.
//!
//! A sampling decision is made once, when a trace is originated, and then
//! travels with the trace in its flags. Inbound contexts are honored as-is.

use super::context::SpanContext;
use super::span::TraceId;
use crate::config::schema::{SamplerKind, TracingConfig};

/// Parent-based sampler with a configurable root policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampler {
    /// Sample every new trace.
    AlwaysOn,
    /// Sample no new trace.
    AlwaysOff,
    /// Sample the given fraction of new traces, decided from the trace id.
    TraceIdRatio(f64),
}

impl Sampler {
    pub fn from_config(config: &TracingConfig) -> Self {
        match config.sampler {
            SamplerKind::AlwaysOn => Self::AlwaysOn,
            SamplerKind::AlwaysOff => Self::AlwaysOff,
            SamplerKind::Ratio => Self::TraceIdRatio(config.sampling_ratio),
        }
    }

    /// Decide for a span in `trace_id` whose parent is `parent`.
    pub fn should_sample(&self, parent: Option<&SpanContext>, trace_id: TraceId) -> bool {
        if let Some(parent) = parent.filter(|p| p.is_valid()) {
            return parent.is_sampled();
        }

        match *self {
            Self::AlwaysOn => true,
            Self::AlwaysOff => false,
            Self::TraceIdRatio(ratio) => ratio_decision(ratio, trace_id),
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::AlwaysOn
    }
}

/// The low 64 bits of the trace id are compared against `ratio * u64::MAX`,
/// so every service in the trace reaches the same decision.
fn ratio_decision(ratio: f64, trace_id: TraceId) -> bool {
    if ratio >= 1.0 {
        return true;
    }
    if ratio <= 0.0 || ratio.is_nan() {
        return false;
    }
    let threshold = (ratio * u64::MAX as f64) as u64;
    (trace_id.to_u128() as u64) < threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::span::SpanId;

    #[test]
    fn test_root_policies() {
        let id = TraceId::generate();
        assert!(Sampler::AlwaysOn.should_sample(None, id));
        assert!(!Sampler::AlwaysOff.should_sample(None, id));
        assert!(Sampler::TraceIdRatio(1.0).should_sample(None, id));
        assert!(!Sampler::TraceIdRatio(0.0).should_sample(None, id));
    }

    #[test]
    fn test_parent_decision_wins() {
        let id = TraceId::generate();
        let sampled_parent = SpanContext::new(id, SpanId::generate()).with_remote(true);
        let unsampled_parent = sampled_parent.clone().with_sampled(false);

        assert!(Sampler::AlwaysOff.should_sample(Some(&sampled_parent), id));
        assert!(!Sampler::AlwaysOn.should_sample(Some(&unsampled_parent), id));
        // an invalid parent does not count as a parent
        assert!(Sampler::AlwaysOn.should_sample(Some(&SpanContext::invalid()), id));
    }

    #[test]
    fn test_ratio_uses_low_bits() {
        let low = TraceId::from_u128((1u128 << 64) | 1);
        let high = TraceId::from_u128((1u128 << 64) | u64::MAX as u128);
        let sampler = Sampler::TraceIdRatio(0.5);
        assert!(sampler.should_sample(None, low));
        assert!(!sampler.should_sample(None, high));
    }

    #[test]
    fn test_ratio_is_deterministic() {
        let sampler = Sampler::TraceIdRatio(0.25);
        let id = TraceId::generate();
        let first = sampler.should_sample(None, id);
        assert!((0..10).all(|_| sampler.should_sample(None, id) == first));
    }
}
