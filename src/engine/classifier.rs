//! Single-shot classification of a scored movement.
//!
//! Confidence is `sigmoid(k * (sharp - trap))`: the stated probability that
//! the scored outcome wins. Squashing the score difference rather than
//! reporting a raw score keeps confidence comparable across sports whose
//! score ranges differ.

use crate::db::models::Classification;

use super::signal_config::SignalConfig;

pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// Map scores onto PICK / FADE / CAUTION. Trap dominance is checked first.
pub fn classify(
    sharp_score: f64,
    trap_score: f64,
    books_reporting: u32,
    cfg: &SignalConfig,
) -> Classification {
    if trap_score >= cfg.fade_threshold {
        Classification::Fade
    } else if sharp_score >= cfg.pick_threshold && books_reporting >= cfg.min_consensus_books {
        Classification::Pick
    } else {
        Classification::Caution
    }
}

/// Monotonic non-decreasing in `sharp_score - trap_score`; 0.5 when the
/// inputs are not finite.
pub fn confidence(sharp_score: f64, trap_score: f64, logistic_k: f64) -> f64 {
    let x = logistic_k * (sharp_score - trap_score);
    if !x.is_finite() {
        return 0.5;
    }
    sigmoid(x).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pick_needs_threshold_and_books() {
        let cfg = SignalConfig::default();
        assert_eq!(classify(3.0, 0.5, 3, &cfg), Classification::Pick);
        assert_eq!(classify(3.0, 0.5, 2, &cfg), Classification::Caution);
        assert_eq!(classify(2.0, 0.5, 5, &cfg), Classification::Caution);
    }

    #[test]
    fn trap_dominance_overrides_sharp() {
        let cfg = SignalConfig::default();
        assert_eq!(classify(10.0, cfg.fade_threshold, 8, &cfg), Classification::Fade);
        assert_eq!(classify(0.0, cfg.fade_threshold - 0.01, 8, &cfg), Classification::Caution);
    }

    #[test]
    fn mixed_scores_are_caution() {
        let mut cfg = SignalConfig::default();
        cfg.fade_threshold = 3.0;
        assert_eq!(classify(2.4, 2.9, 4, &cfg), Classification::Caution);
    }

    #[test]
    fn confidence_is_monotonic() {
        let mut prev = 0.0;
        for i in -100..=100 {
            let diff = i as f64 * 0.1;
            let c = confidence(diff, 0.0, 1.3);
            assert!(c >= prev, "confidence decreased at diff={}", diff);
            assert!((0.0..=1.0).contains(&c));
            prev = c;
        }
    }

    #[test]
    fn confidence_is_half_at_balance() {
        assert_relative_eq!(confidence(2.0, 2.0, 1.0), 0.5, epsilon = 1e-12);
        assert_relative_eq!(confidence(f64::NAN, 0.0, 1.0), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn sigmoid_is_stable_at_extremes() {
        assert!(sigmoid(1000.0) <= 1.0);
        assert!(sigmoid(-1000.0) >= 0.0);
    }
}
