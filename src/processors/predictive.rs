use serde_json::json;

use crate::chain::{ChainBlock, ChainEvent};
use crate::config::PredictiveConfig;
use crate::entities::EntityResolver;
use crate::processors::{CandidateSignal, HeightWindow, SignalProcessor, SignalType, clip01};

/// Short-horizon fee forecaster. Fits a least-squares trend over the recent
/// per-block median fee series and emits a forward-looking signal with an
/// explicit horizon and interval. Confidence is the inverse of the interval
/// width relative to the forecast value, normalized to [0,1].
pub struct PredictiveProcessor {
    cfg: PredictiveConfig,
    series: HeightWindow,
}

impl PredictiveProcessor {
    pub fn new(cfg: PredictiveConfig) -> Self {
        let series = HeightWindow::new(cfg.window);
        Self { cfg, series }
    }

    fn on_block(&mut self, block: &ChainBlock) -> Option<CandidateSignal> {
        self.series.push(block.height, block.fees.p50);

        if self.series.len() < self.cfg.min_points {
            return None;
        }
        if self.cfg.emit_every == 0 || block.height % self.cfg.emit_every != 0 {
            return None;
        }

        let (slope, intercept, residual_sd) = fit_trend(&self.series)?;
        let target_height = block.height + self.cfg.horizon_blocks;
        let forecast = slope * target_height as f64 + intercept;
        let half_width = 1.96 * residual_sd;
        let rel_width = (2.0 * half_width) / forecast.abs().max(1e-9);

        Some(CandidateSignal {
            signal_type: SignalType::Forecast,
            source_height: block.height,
            confidence: clip01(1.0 / (1.0 + rel_width)),
            metadata: json!({
                "metric": "median_fee",
                "horizon_blocks": self.cfg.horizon_blocks,
                "target_height": target_height,
                "forecast_value": forecast,
                "interval_low": forecast - half_width,
                "interval_high": forecast + half_width,
                "slope_per_block": slope,
                "samples": self.series.len(),
            }),
        })
    }
}

/// Least-squares line over (height, value); returns (slope, intercept,
/// residual standard deviation). None when the series is degenerate.
fn fit_trend(series: &HeightWindow) -> Option<(f64, f64, f64)> {
    let n = series.len() as f64;
    if n < 2.0 {
        return None;
    }
    let mean_x = series.values().map(|(h, _)| h as f64).sum::<f64>() / n;
    let mean_y = series.values().map(|(_, v)| v).sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (h, v) in series.values() {
        let dx = h as f64 - mean_x;
        sxx += dx * dx;
        sxy += dx * (v - mean_y);
    }
    if sxx.abs() < 1e-12 {
        return None;
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let ss_res: f64 = series
        .values()
        .map(|(h, v)| {
            let r = v - (slope * h as f64 + intercept);
            r * r
        })
        .sum();
    Some((slope, intercept, (ss_res / n).sqrt()))
}

impl SignalProcessor for PredictiveProcessor {
    fn name(&self) -> &'static str {
        "predictive"
    }

    fn process(&mut self, event: &ChainEvent, _resolver: &EntityResolver) -> Vec<CandidateSignal> {
        match event {
            ChainEvent::NewBlock(b) => self.on_block(b).into_iter().collect(),
            ChainEvent::MempoolUpdate(_) => Vec::new(),
            ChainEvent::Reorg {
                ancestor_height,
                blocks,
            } => {
                self.series.trim_from(ancestor_height + 1);
                blocks.iter().filter_map(|b| self.on_block(b)).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::FeePercentiles;
    use chrono::Utc;

    fn block(height: u64, p50: f64) -> ChainBlock {
        ChainBlock {
            height,
            hash: format!("h{height}"),
            parent_hash: format!("h{}", height - 1),
            timestamp: Utc::now(),
            txs: vec![],
            fees: FeePercentiles {
                p10: p50 / 2.0,
                p50,
                p90: p50 * 2.0,
            },
        }
    }

    fn cfg() -> PredictiveConfig {
        PredictiveConfig {
            enabled: true,
            window: 30,
            min_points: 10,
            horizon_blocks: 6,
            emit_every: 5,
        }
    }

    #[test]
    fn linear_trend_forecasts_ahead_with_high_confidence() {
        let r = EntityResolver::empty();
        let mut p = PredictiveProcessor::new(cfg());
        let mut signals = Vec::new();
        // Perfectly linear: fee = height.
        for h in 1..=15u64 {
            signals.extend(p.process(&ChainEvent::NewBlock(block(h, h as f64)), &r));
        }
        // Emission points past min_points: heights 10 and 15.
        assert_eq!(signals.len(), 2);
        let s = &signals[1];
        assert_eq!(s.signal_type, SignalType::Forecast);
        assert_eq!(s.source_height, 15);
        assert_eq!(s.metadata["target_height"], 21);
        let forecast = s.metadata["forecast_value"].as_f64().unwrap();
        assert!((forecast - 21.0).abs() < 1e-6);
        // Zero residuals: interval collapses, confidence saturates.
        assert!(s.confidence > 0.99);
    }

    #[test]
    fn noisy_series_lowers_confidence() {
        let r = EntityResolver::empty();
        let mut flat = PredictiveProcessor::new(cfg());
        let mut noisy = PredictiveProcessor::new(cfg());
        let mut flat_conf = None;
        let mut noisy_conf = None;
        for h in 1..=10u64 {
            if let Some(s) = flat
                .process(&ChainEvent::NewBlock(block(h, 10.0)), &r)
                .pop()
            {
                flat_conf = Some(s.confidence);
            }
            let wobble = if h % 2 == 0 { 18.0 } else { 2.0 };
            if let Some(s) = noisy
                .process(&ChainEvent::NewBlock(block(h, wobble)), &r)
                .pop()
            {
                noisy_conf = Some(s.confidence);
            }
        }
        let flat_conf = flat_conf.expect("flat forecast at height 10");
        let noisy_conf = noisy_conf.expect("noisy forecast at height 10");
        assert!(flat_conf > noisy_conf);
    }

    #[test]
    fn no_forecast_below_min_points() {
        let r = EntityResolver::empty();
        let mut p = PredictiveProcessor::new(cfg());
        for h in 1..=9u64 {
            assert!(p.process(&ChainEvent::NewBlock(block(h, 10.0)), &r).is_empty());
        }
    }

    #[test]
    fn reorg_trims_series_before_replay() {
        let r = EntityResolver::empty();
        let mut p = PredictiveProcessor::new(cfg());
        for h in 1..=12u64 {
            p.process(&ChainEvent::NewBlock(block(h, 10.0)), &r);
        }
        assert_eq!(p.series.len(), 12);
        let signals = p.process(
            &ChainEvent::Reorg {
                ancestor_height: 9,
                blocks: vec![block(10, 11.0), block(11, 11.0)],
            },
            &r,
        );
        // 9 kept + 2 corrected = 11 points.
        assert_eq!(p.series.len(), 11);
        // Height 10 is an emission point and the series is back past min_points.
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].source_height, 10);
    }
}
