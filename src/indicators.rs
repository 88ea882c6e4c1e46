// =============================================================================
// Technical Indicators — Wilder RSI and divergence detection
// =============================================================================
//
// RSI uses Wilder's smoothing: the averages are seeded with the SMA of the
// first `period` gains/losses, then each subsequent value blends in at
// weight 1/period.
//
//   avg_gain = (prev_avg_gain * (period - 1) + gain) / period
//   RS = avg_gain / avg_loss,  RSI = 100 - 100 / (1 + RS)
// =============================================================================

/// Full RSI series over `closes`. The first value corresponds to index
/// `period`; shorter inputs produce an empty series.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let period_f = period as f64;

    let mut avg_gain = deltas[..period].iter().filter(|&&d| d > 0.0).sum::<f64>() / period_f;
    let mut avg_loss = deltas[..period]
        .iter()
        .filter(|&&d| d < 0.0)
        .map(|d| d.abs())
        .sum::<f64>()
        / period_f;

    let mut series = Vec::with_capacity(deltas.len() - period + 1);
    series.push(rsi_value(avg_gain, avg_loss));

    for &delta in &deltas[period..] {
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
        series.push(rsi_value(avg_gain, avg_loss));
    }

    series
}

/// Latest RSI value, when enough data exists.
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    rsi_series(closes, period).last().copied()
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Bullish divergence: over the trailing `window`, the price's lowest point
/// is more recent than the RSI's lowest point — momentum bottomed before
/// price did.
pub fn bullish_divergence(closes: &[f64], period: usize, window: usize) -> bool {
    let rsi = rsi_series(closes, period);
    if rsi.len() < window || closes.len() < window {
        return false;
    }

    let price_tail = &closes[closes.len() - window..];
    let rsi_tail = &rsi[rsi.len() - window..];

    let price_low_idx = min_index(price_tail);
    let rsi_low_idx = min_index(rsi_tail);

    price_low_idx > rsi_low_idx
}

fn min_index(values: &[f64]) -> usize {
    let mut idx = 0;
    for (i, &v) in values.iter().enumerate() {
        if v < values[idx] {
            idx = i;
        }
    }
    idx
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_needs_period_plus_one_closes() {
        assert!(rsi_series(&[], 14).is_empty());
        let fourteen: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(rsi_series(&fourteen, 14).is_empty());
        let fifteen: Vec<f64> = (1..=15).map(|x| x as f64).collect();
        assert_eq!(rsi_series(&fifteen, 14).len(), 1);
    }

    #[test]
    fn rsi_extremes() {
        let rising: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for v in rsi_series(&rising, 14) {
            assert!((v - 100.0).abs() < 1e-9);
        }

        let falling: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for v in rsi_series(&falling, 14) {
            assert!(v.abs() < 1e-9);
        }

        let flat = vec![5.0; 30];
        for v in rsi_series(&flat, 14) {
            assert!((v - 50.0).abs() < 1e-9);
        }
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13, 44.01, 43.50,
        ];
        for v in rsi_series(&closes, 14) {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn divergence_detects_later_price_low() {
        // Sharp early sell-off (RSI crashes), recovery, then a slow grind to
        // a marginally lower price low. Wilder smoothing keeps the second
        // RSI low well above the first, so the price low lands later in the
        // window than the RSI low.
        let mut closes: Vec<f64> = (0..20)
            .map(|i| 100.0 + if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect(); // warmup
        closes.extend((1..=5).map(|i| 100.0 - i as f64 * 6.0)); // crash to 70
        closes.extend((1..=8).map(|i| 70.0 + i as f64 * 1.875)); // recover to 85
        closes.extend((1..=12).map(|i| 85.0 - i as f64 * 1.417)); // grind to ~68

        assert!(bullish_divergence(&closes, 14, 24));
    }

    #[test]
    fn no_divergence_on_rising_series() {
        let rising: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        assert!(!bullish_divergence(&rising, 14, 10));
    }

    #[test]
    fn divergence_requires_enough_data() {
        assert!(!bullish_divergence(&[1.0, 2.0, 3.0], 14, 10));
    }
}
