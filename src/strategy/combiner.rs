// =============================================================================
// Combiner — fold five strategy votes into one decision
// =============================================================================
//
// Policies:
//   ensemble     — weighted direction sum picks the side; confidence is the
//                  weighted mean of the agreeing votes.
//   consensus    — unanimous action only, else Hold.
//   best         — argmax confidence wins outright.
//   conservative — one SELL ≥ 0.8 wins; otherwise ≥ 2 BUYs ≥ 0.6; else Hold.
// =============================================================================

use super::{NamedSignal, Signal, TradeAction};

/// Sell votes this strong carry the conservative mode alone.
const CONSERVATIVE_SELL_FLOOR: f64 = 0.8;
/// Buy votes must be at least this strong to count in conservative mode.
const CONSERVATIVE_BUY_FLOOR: f64 = 0.6;
/// Ensemble scores inside this band are treated as noise.
const ENSEMBLE_DEADBAND: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinerMode {
    Ensemble,
    Consensus,
    Best,
    Conservative,
}

impl CombinerMode {
    /// Parse the settings string, defaulting to ensemble on anything unknown.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "consensus" => Self::Consensus,
            "best" => Self::Best,
            "conservative" => Self::Conservative,
            _ => Self::Ensemble,
        }
    }
}

/// Fold the votes under the given policy.
pub fn combine(votes: &[NamedSignal], mode: CombinerMode) -> Signal {
    if votes.is_empty() {
        return Signal::hold("no strategy votes");
    }

    match mode {
        CombinerMode::Ensemble => ensemble(votes),
        CombinerMode::Consensus => consensus(votes),
        CombinerMode::Best => best(votes),
        CombinerMode::Conservative => conservative(votes),
    }
}

fn ensemble(votes: &[NamedSignal]) -> Signal {
    let total_weight: f64 = votes.iter().map(|v| v.weight).sum();
    if total_weight <= 0.0 {
        return Signal::hold("zero ensemble weight");
    }

    let score: f64 = votes
        .iter()
        .map(|v| v.weight * v.signal.action.direction() * v.signal.confidence)
        .sum::<f64>()
        / total_weight;

    let action = if score > ENSEMBLE_DEADBAND {
        TradeAction::Buy
    } else if score < -ENSEMBLE_DEADBAND {
        TradeAction::Sell
    } else {
        return Signal::hold(format!("ensemble score {score:.3} inside deadband"));
    };

    // Confidence: weighted mean of the votes agreeing with the winner.
    let agreeing: Vec<&NamedSignal> = votes
        .iter()
        .filter(|v| v.signal.action == action)
        .collect();
    let agree_weight: f64 = agreeing.iter().map(|v| v.weight).sum();
    let confidence = if agree_weight > 0.0 {
        agreeing
            .iter()
            .map(|v| v.weight * v.signal.confidence)
            .sum::<f64>()
            / agree_weight
    } else {
        score.abs()
    };

    let mut combined = strongest_of(&agreeing).clone();
    combined.confidence = confidence.clamp(0.0, 1.0);
    combined.reason = format!(
        "ensemble score {score:.3}: {}",
        agreeing
            .iter()
            .map(|v| format!("{}={:.2}", v.name, v.signal.confidence))
            .collect::<Vec<_>>()
            .join(", ")
    );
    combined
}

fn consensus(votes: &[NamedSignal]) -> Signal {
    let first = votes[0].signal.action;
    if votes.iter().any(|v| v.signal.action != first) {
        return Signal::hold("no unanimous consensus");
    }
    if first == TradeAction::Hold {
        return Signal::hold("unanimous hold");
    }

    let confidence =
        votes.iter().map(|v| v.signal.confidence).sum::<f64>() / votes.len() as f64;
    let mut combined = strongest(votes).clone();
    combined.confidence = confidence;
    combined.reason = format!("unanimous {first} across {} strategies", votes.len());
    combined
}

fn best(votes: &[NamedSignal]) -> Signal {
    let winner = votes
        .iter()
        .max_by(|a, b| {
            a.signal
                .confidence
                .partial_cmp(&b.signal.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("votes checked non-empty");

    let mut combined = winner.signal.clone();
    combined.reason = format!("best vote from {}: {}", winner.name, winner.signal.reason);
    combined
}

fn conservative(votes: &[NamedSignal]) -> Signal {
    // A strong sell always wins — protecting an existing position beats
    // opening a new one.
    if let Some(seller) = votes
        .iter()
        .filter(|v| {
            v.signal.action == TradeAction::Sell
                && v.signal.confidence >= CONSERVATIVE_SELL_FLOOR
        })
        .max_by(|a, b| {
            a.signal
                .confidence
                .partial_cmp(&b.signal.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    {
        let mut combined = seller.signal.clone();
        combined.reason = format!("conservative sell via {}", seller.name);
        return combined;
    }

    let buyers: Vec<&NamedSignal> = votes
        .iter()
        .filter(|v| {
            v.signal.action == TradeAction::Buy && v.signal.confidence >= CONSERVATIVE_BUY_FLOOR
        })
        .collect();

    if buyers.len() >= 2 {
        let confidence =
            buyers.iter().map(|v| v.signal.confidence).sum::<f64>() / buyers.len() as f64;
        let mut combined = strongest_of(&buyers).clone();
        combined.confidence = confidence;
        combined.reason = format!(
            "conservative buy: {} high-confidence votes",
            buyers.len()
        );
        return combined;
    }

    Signal::hold("conservative mode: not enough high-confidence agreement")
}

fn strongest(votes: &[NamedSignal]) -> &Signal {
    &votes
        .iter()
        .max_by(|a, b| {
            a.signal
                .confidence
                .partial_cmp(&b.signal.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("votes checked non-empty")
        .signal
}

fn strongest_of<'a>(votes: &[&'a NamedSignal]) -> &'a Signal {
    &votes
        .iter()
        .max_by(|a, b| {
            a.signal
                .confidence
                .partial_cmp(&b.signal.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("votes checked non-empty")
        .signal
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn vote(name: &'static str, signal: Signal) -> NamedSignal {
        NamedSignal {
            name,
            weight: 1.0,
            signal,
        }
    }

    fn two_buys_three_holds() -> Vec<NamedSignal> {
        vec![
            vote("a", Signal::buy(0.75, "r", "P")),
            vote("b", Signal::buy(0.60, "r", "P")),
            vote("c", Signal::hold("r")),
            vote("d", Signal::hold("r")),
            vote("e", Signal::hold("r")),
        ]
    }

    #[test]
    fn ensemble_confidence_is_mean_of_agreeing() {
        let signal = combine(&two_buys_three_holds(), CombinerMode::Ensemble);
        assert_eq!(signal.action, TradeAction::Buy);
        assert!((signal.confidence - 0.675).abs() < 1e-9);
    }

    #[test]
    fn ensemble_deadband_holds() {
        let votes = vec![
            vote("a", Signal::buy(0.6, "r", "P")),
            vote("b", Signal::sell(0.6, "r")),
            vote("c", Signal::hold("r")),
        ];
        let signal = combine(&votes, CombinerMode::Ensemble);
        assert_eq!(signal.action, TradeAction::Hold);
    }

    #[test]
    fn consensus_requires_unanimity() {
        assert_eq!(
            combine(&two_buys_three_holds(), CombinerMode::Consensus).action,
            TradeAction::Hold
        );

        let unanimous = vec![
            vote("a", Signal::buy(0.7, "r", "P")),
            vote("b", Signal::buy(0.9, "r", "P")),
        ];
        let signal = combine(&unanimous, CombinerMode::Consensus);
        assert_eq!(signal.action, TradeAction::Buy);
        assert!((signal.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn best_takes_argmax() {
        let votes = vec![
            vote("a", Signal::buy(0.55, "r", "P")),
            vote("b", Signal::sell(0.9, "r")),
        ];
        let signal = combine(&votes, CombinerMode::Best);
        assert_eq!(signal.action, TradeAction::Sell);
        assert!((signal.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn conservative_sell_overrides_buys() {
        let votes = vec![
            vote("a", Signal::buy(0.9, "r", "P")),
            vote("b", Signal::buy(0.9, "r", "P")),
            vote("c", Signal::sell(0.85, "r")),
        ];
        let signal = combine(&votes, CombinerMode::Conservative);
        assert_eq!(signal.action, TradeAction::Sell);
    }

    #[test]
    fn conservative_needs_two_strong_buys() {
        let one_buy = vec![
            vote("a", Signal::buy(0.95, "r", "P")),
            vote("b", Signal::hold("r")),
        ];
        assert_eq!(
            combine(&one_buy, CombinerMode::Conservative).action,
            TradeAction::Hold
        );

        let weak_sell = vec![
            vote("a", Signal::buy(0.7, "r", "P")),
            vote("b", Signal::buy(0.65, "r", "P")),
            vote("c", Signal::sell(0.5, "r")),
        ];
        let signal = combine(&weak_sell, CombinerMode::Conservative);
        assert_eq!(signal.action, TradeAction::Buy);
        assert!((signal.confidence - 0.675).abs() < 1e-9);
    }

    #[test]
    fn mode_parsing_defaults_to_ensemble() {
        assert_eq!(CombinerMode::parse("consensus"), CombinerMode::Consensus);
        assert_eq!(CombinerMode::parse("BEST"), CombinerMode::Best);
        assert_eq!(CombinerMode::parse("garbage"), CombinerMode::Ensemble);
    }
}
