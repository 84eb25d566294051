//! Measurement filters feeding the servo.

use std::collections::VecDeque;

/// Moving weighted average for mean path delay, with ageing: older samples
/// count for progressively less by a configurable factor per slot.
#[derive(Debug, Clone)]
pub struct MeanPathDelayFilter {
    size: usize,
    ageing: f64,
    window: VecDeque<f64>,
}

impl MeanPathDelayFilter {
    pub fn new(size: usize, ageing: f64) -> Self {
        Self {
            size: size.max(1),
            ageing: ageing.max(1.0),
            window: VecDeque::new(),
        }
    }

    /// Push a path-delay sample and return the current weighted mean.
    pub fn update(&mut self, sample: f64) -> f64 {
        if self.window.len() == self.size {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        self.mean()
    }

    pub fn mean(&self) -> f64 {
        let mut num = 0.0;
        let mut den = 0.0;
        // Newest sample carries weight 1; each step back divides by ageing.
        let n = self.window.len();
        for (i, &x) in self.window.iter().enumerate() {
            let age = (n - 1 - i) as i32;
            let w = self.ageing.powi(-age);
            num += w * x;
            den += w;
        }
        if den == 0.0 { 0.0 } else { num / den }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

/// Rolling-window outlier filter with an adaptive threshold derived from the
/// window standard deviation.
#[derive(Debug, Clone)]
pub struct OutlierFilter {
    size: usize,
    /// Std-dev multiple beyond which a sample is discarded.
    threshold: f64,
    window: VecDeque<f64>,
    pub outliers: u64,
    pub num_samples: u64,
}

/// Minimum window fill before the filter starts rejecting.
const OUTLIER_MIN_SAMPLES: usize = 4;

impl OutlierFilter {
    pub fn new(size: usize, threshold: f64) -> Self {
        Self {
            size: size.max(OUTLIER_MIN_SAMPLES),
            threshold,
            window: VecDeque::new(),
            outliers: 0,
            num_samples: 0,
        }
    }

    fn stats(&self) -> (f64, f64) {
        let n = self.window.len() as f64;
        if n == 0.0 {
            return (0.0, 0.0);
        }
        let mean = self.window.iter().sum::<f64>() / n;
        let var = self.window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        (mean, var.sqrt())
    }

    /// Accept or reject a sample. Rejected samples are counted and do not
    /// enter the window.
    pub fn accept(&mut self, sample: f64) -> bool {
        self.num_samples += 1;
        if self.window.len() >= OUTLIER_MIN_SAMPLES {
            let (mean, sd) = self.stats();
            if sd > 0.0 && (sample - mean).abs() > self.threshold * sd {
                self.outliers += 1;
                return false;
            }
        }
        if self.window.len() == self.size {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        true
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

/// Plain FIR smoothing stage: unweighted mean of the last `size` samples.
#[derive(Debug, Clone)]
pub struct FirFilter {
    size: usize,
    window: VecDeque<f64>,
}

impl FirFilter {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            window: VecDeque::new(),
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        if self.window.len() == self.size {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpd_weighted_mean_prefers_recent() {
        let mut f = MeanPathDelayFilter::new(4, 2.0);
        for x in [100.0, 100.0, 100.0] {
            f.update(x);
        }
        let m = f.update(200.0);
        // Weighted mean must sit above the unweighted 125.0.
        assert!(m > 125.0 && m < 200.0, "mean {m}");
    }

    #[test]
    fn test_mpd_window_bounded() {
        let mut f = MeanPathDelayFilter::new(3, 1.0);
        for x in [1.0, 2.0, 3.0, 4.0] {
            f.update(x);
        }
        assert_eq!(f.len(), 3);
        assert!((f.mean() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_outlier_rejected_and_counted() {
        let mut f = OutlierFilter::new(16, 3.0);
        for _ in 0..8 {
            assert!(f.accept(1000.0));
            assert!(f.accept(1010.0));
        }
        assert!(!f.accept(50_000.0));
        assert_eq!(f.outliers, 1);
        assert_eq!(f.num_samples, 17);
        // An in-range sample still passes.
        assert!(f.accept(1005.0));
    }

    #[test]
    fn test_outlier_filter_warms_up_before_rejecting() {
        let mut f = OutlierFilter::new(16, 3.0);
        // First few samples are always accepted, however spread out.
        assert!(f.accept(0.0));
        assert!(f.accept(1e6));
        assert!(f.accept(-1e6));
        assert!(f.accept(5e5));
    }

    #[test]
    fn test_fir_mean() {
        let mut f = FirFilter::new(4);
        f.update(0.0);
        f.update(10.0);
        assert!((f.update(20.0) - 10.0).abs() < 1e-9);
    }
}
