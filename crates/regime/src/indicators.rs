//! Indicator math over f64 series.
//!
//! All functions return one value per input bar, `NaN` where the lookback is
//! not yet satisfied. RSI and ADX use Wilder smoothing (alpha = 1/period).

/// Exponential moving average, seeded with the SMA of the first `period`
/// values.
#[must_use]
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period {
        return result;
    }

    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if seed.is_nan() {
        return result;
    }
    result[period - 1] = seed;

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut prev = seed;
    for i in period..n {
        if values[i].is_nan() {
            return result;
        }
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        result[i] = prev;
    }
    result
}

fn wilder_smooth(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n <= period {
        return result;
    }

    // Seed with the simple average of the first `period` defined values,
    // which start at index 1 (index 0 has no prior bar).
    let mut seed = 0.0;
    for &v in &values[1..=period] {
        if v.is_nan() {
            return result;
        }
        seed += v;
    }
    seed /= period as f64;
    result[period] = seed;

    let alpha = 1.0 / period as f64;
    let mut prev = seed;
    for i in (period + 1)..n {
        if values[i].is_nan() {
            return result;
        }
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        result[i] = prev;
    }
    result
}

/// Relative Strength Index.
///
/// avg_loss == 0 maps to 100, avg_gain == 0 maps to 0, no movement to 50.
#[must_use]
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return result;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = closes[i] - closes[i - 1];
        if change.is_nan() {
            return result;
        }
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    result[period] = rsi_value(avg_gain, avg_loss);

    let alpha = 1.0 / period as f64;
    for i in (period + 1)..n {
        let change = closes[i] - closes[i - 1];
        if change.is_nan() {
            return result;
        }
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = alpha * gain + (1.0 - alpha) * avg_gain;
        avg_loss = alpha * loss + (1.0 - alpha) * avg_loss;
        result[i] = rsi_value(avg_gain, avg_loss);
    }
    result
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Average Directional Index (Wilder). Lookback is `2 * period`.
#[must_use]
pub fn adx(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = highs.len().min(lows.len()).min(closes.len());
    if n < 2 {
        return vec![f64::NAN; n];
    }

    let mut plus_dm = vec![f64::NAN; n];
    let mut minus_dm = vec![f64::NAN; n];
    let mut tr = vec![f64::NAN; n];
    for i in 1..n {
        let high_diff = highs[i] - highs[i - 1];
        let low_diff = lows[i - 1] - lows[i];
        plus_dm[i] = if high_diff > low_diff && high_diff > 0.0 {
            high_diff
        } else {
            0.0
        };
        minus_dm[i] = if low_diff > high_diff && low_diff > 0.0 {
            low_diff
        } else {
            0.0
        };
        tr[i] = (highs[i] - lows[i])
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs());
    }

    let smooth_tr = wilder_smooth(&tr, period);
    let smooth_plus = wilder_smooth(&plus_dm, period);
    let smooth_minus = wilder_smooth(&minus_dm, period);

    let mut dx = vec![f64::NAN; n];
    for i in 0..n {
        if smooth_tr[i].is_nan()
            || smooth_plus[i].is_nan()
            || smooth_minus[i].is_nan()
            || smooth_tr[i] == 0.0
        {
            continue;
        }
        let plus_di = 100.0 * smooth_plus[i] / smooth_tr[i];
        let minus_di = 100.0 * smooth_minus[i] / smooth_tr[i];
        let di_sum = plus_di + minus_di;
        dx[i] = if di_sum == 0.0 {
            0.0
        } else {
            100.0 * (plus_di - minus_di).abs() / di_sum
        };
    }

    wilder_smooth(&dx, period)
}

/// Simple moving average.
#[must_use]
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period {
        return result;
    }
    let mut sum: f64 = values[..period].iter().sum();
    result[period - 1] = sum / period as f64;
    for i in period..n {
        sum += values[i] - values[i - period];
        result[i] = sum / period as f64;
    }
    result
}

/// Count of trailing bars for which `fast > slow` (positive) or
/// `fast < slow` (negative), ending at the last bar.
#[must_use]
pub fn trailing_ordering_bars(fast: &[f64], slow: &[f64]) -> i32 {
    let n = fast.len().min(slow.len());
    if n == 0 {
        return 0;
    }
    let last = n - 1;
    if fast[last].is_nan() || slow[last].is_nan() {
        return 0;
    }
    let above = fast[last] > slow[last];
    let mut count = 0i32;
    for i in (0..n).rev() {
        if fast[i].is_nan() || slow[i].is_nan() {
            break;
        }
        if (fast[i] > slow[i]) == above {
            count += 1;
        } else {
            break;
        }
    }
    if above {
        count
    } else {
        -count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_warms_up_then_tracks() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let result = ema(&values, 3);
        assert!(result[0].is_nan());
        assert!(result[1].is_nan());
        assert!((result[2] - 2.0).abs() < 1e-9);
        // Rising series keeps the EMA rising.
        assert!(result[5] > result[4]);
        assert!(result[5] < 6.0);
    }

    #[test]
    fn rsi_extremes() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + f64::from(i)).collect();
        let result = rsi(&rising, 14);
        assert!((result[19] - 100.0).abs() < 1e-9);

        let falling: Vec<f64> = (0..20).map(|i| 100.0 - f64::from(i)).collect();
        let result = rsi(&falling, 14);
        assert!(result[19].abs() < 1e-9);
    }

    #[test]
    fn rsi_stays_in_bounds() {
        let closes = vec![
            100.0, 105.0, 98.0, 110.0, 95.0, 115.0, 90.0, 120.0, 101.0, 99.0, 107.0, 96.0, 111.0,
            104.0, 108.0,
        ];
        for value in rsi(&closes, 5) {
            if !value.is_nan() {
                assert!((0.0..=100.0).contains(&value));
            }
        }
    }

    #[test]
    fn adx_elevated_in_strong_trend() {
        let mut highs = Vec::new();
        let mut lows = Vec::new();
        let mut closes = Vec::new();
        for i in 0..40 {
            let base = 100.0 + f64::from(i) * 5.0;
            highs.push(base + 3.0);
            lows.push(base - 3.0);
            closes.push(base + 2.0);
        }
        let result = adx(&highs, &lows, &closes, 5);
        let last = result.iter().rev().find(|v| !v.is_nan()).copied();
        assert!(last.is_some_and(|v| v > 25.0), "expected trending ADX, got {last:?}");
    }

    #[test]
    fn adx_stays_in_bounds() {
        let highs = vec![105.0, 108.0, 107.0, 103.0, 106.0, 110.0, 112.0, 111.0, 109.0, 113.0];
        let lows = vec![95.0, 100.0, 98.0, 97.0, 100.0, 103.0, 106.0, 104.0, 103.0, 105.0];
        let closes = vec![102.0, 106.0, 99.0, 101.0, 105.0, 108.0, 110.0, 105.0, 107.0, 112.0];
        for value in adx(&highs, &lows, &closes, 3) {
            if !value.is_nan() {
                assert!((0.0..=100.0).contains(&value));
            }
        }
    }

    #[test]
    fn trailing_ordering_counts_signed_runs() {
        let fast = vec![1.0, 3.0, 3.0, 4.0, 5.0];
        let slow = vec![2.0, 2.0, 2.0, 2.0, 2.0];
        assert_eq!(trailing_ordering_bars(&fast, &slow), 4);

        let fast = vec![3.0, 1.0, 1.0];
        let slow = vec![2.0, 2.0, 2.0];
        assert_eq!(trailing_ordering_bars(&fast, &slow), -2);
    }

    #[test]
    fn sma_sliding_window() {
        let values = vec![2.0, 4.0, 6.0, 8.0];
        let result = sma(&values, 2);
        assert!(result[0].is_nan());
        assert!((result[1] - 3.0).abs() < 1e-9);
        assert!((result[3] - 7.0).abs() < 1e-9);
    }
}
