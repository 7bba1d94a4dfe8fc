//! Pluggable overlap kernels over sorted timestamp lists.
//!
//! A kernel is a pure function from two nondecreasing `u64` nanosecond
//! lists to a total overlap in nanoseconds. Kernels are passed to the
//! matrix builder by reference; they hold no state beyond their tuning.

use std::f64::consts::PI;

/// Total time overlap between two sorted timestamp lists, in nanoseconds.
pub trait OverlapKernel {
    fn overlap(&self, a: &[u64], b: &[u64]) -> u64;
}

/// Expands every timestamp `t` into the interval `[t − margin, t + margin]`
/// and measures where the two sets of intervals intersect, via a single
/// sweep over the merged interval endpoints.
///
/// Endpoints are computed in signed 128-bit space so timestamps near 0 or
/// `u64::MAX` never wrap. Intervals that merely touch contribute nothing:
/// at equal event times, ends are processed before starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedMarginSweep {
    /// Half-width of the interval around each timestamp, nanoseconds.
    pub margin: u64,
}

/// End sorts before Start so touching boundaries accumulate no width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    End,
    Start,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SweepEvent {
    time: i128,
    kind: EventKind,
    list: u8,
}

impl FixedMarginSweep {
    fn push_events(&self, events: &mut Vec<SweepEvent>, times: &[u64], list: u8) {
        let margin = i128::from(self.margin);
        for &t in times {
            let t = i128::from(t);
            events.push(SweepEvent {
                time: t - margin,
                kind: EventKind::Start,
                list,
            });
            events.push(SweepEvent {
                time: t + margin,
                kind: EventKind::End,
                list,
            });
        }
    }
}

impl OverlapKernel for FixedMarginSweep {
    fn overlap(&self, a: &[u64], b: &[u64]) -> u64 {
        if self.margin == 0 || a.is_empty() || b.is_empty() {
            return 0;
        }

        let mut events = Vec::with_capacity(2 * (a.len() + b.len()));
        self.push_events(&mut events, a, 1);
        self.push_events(&mut events, b, 2);
        events.sort_unstable();

        let mut total = 0u128;
        let mut active_a = 0u32;
        let mut active_b = 0u32;
        let mut last_time = 0i128;
        for event in events {
            if active_a > 0 && active_b > 0 {
                total += (event.time - last_time) as u128;
            }
            let active = if event.list == 1 {
                &mut active_a
            } else {
                &mut active_b
            };
            match event.kind {
                EventKind::Start => *active += 1,
                EventKind::End => *active -= 1,
            }
            last_time = event.time;
        }
        u64::try_from(total).unwrap_or(u64::MAX)
    }
}

/// Replaces every timestamp with a normal kernel of standard deviation
/// `sigma`, truncated at `cutoff` standard deviations; the overlap of a
/// pair is the product integral of the two bumps, and the total is the sum
/// over all pairs whose truncated supports intersect.
///
/// The pairwise reference formula, scaled so the result reads as an
/// equivalent width in nanoseconds, is
/// `2·σ·√π · exp(−d² / 4σ²)` for separation `d`, and exactly 0 once
/// `d ≥ 2·cutoff·σ`. The summed total is rounded to whole nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianCutoff {
    /// Standard deviation of the per-timestamp kernel, nanoseconds.
    pub sigma: u64,
    /// Truncation point in standard deviations.
    pub cutoff: f64,
}

impl GaussianCutoff {
    /// 4σ retains 99.99% of the kernel mass.
    pub const DEFAULT_CUTOFF: f64 = 4.0;

    pub fn new(sigma: u64) -> Self {
        Self {
            sigma,
            cutoff: Self::DEFAULT_CUTOFF,
        }
    }

    /// Two bumps interact only within this separation.
    fn window(&self) -> u64 {
        let w = 2.0 * self.cutoff * self.sigma as f64;
        if w >= u64::MAX as f64 {
            u64::MAX
        } else {
            w as u64
        }
    }

    fn pair_overlap(&self, t1: u64, t2: u64, window: u64) -> f64 {
        let d = t1.abs_diff(t2);
        if d >= window {
            return 0.0;
        }
        let sigma = self.sigma as f64;
        let d = d as f64;
        2.0 * sigma * PI.sqrt() * (-(d * d) / (4.0 * sigma * sigma)).exp()
    }
}

impl OverlapKernel for GaussianCutoff {
    fn overlap(&self, a: &[u64], b: &[u64]) -> u64 {
        if self.sigma == 0 || self.cutoff <= 0.0 || a.is_empty() || b.is_empty() {
            return 0;
        }
        let window = self.window();

        // both lists are sorted: slide a window over b instead of the full
        // quadratic pair loop
        let mut total = 0.0f64;
        let mut lo = 0usize;
        for &t1 in a {
            let min_t2 = t1.saturating_sub(window);
            while lo < b.len() && b[lo] < min_t2 {
                lo += 1;
            }
            for &t2 in &b[lo..] {
                if t2 > t1.saturating_add(window) {
                    break;
                }
                total += self.pair_overlap(t1, t2, window);
            }
        }
        total.round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: u64 = 10;

    fn sweep() -> FixedMarginSweep {
        FixedMarginSweep { margin: M }
    }

    #[test]
    fn identical_timestamps_overlap_twice_the_margin() {
        assert_eq!(sweep().overlap(&[100], &[100]), 2 * M);
    }

    #[test]
    fn touching_intervals_do_not_overlap() {
        assert_eq!(sweep().overlap(&[0], &[2 * M]), 0);
        assert_eq!(sweep().overlap(&[100], &[100 + 2 * M]), 0);
    }

    #[test]
    fn disjoint_pairs_sum_independently() {
        // two far-apart coincident pairs: each contributes 2·margin
        let a = [5 * M, 9 * M];
        let b = [5 * M, 9 * M];
        assert_eq!(sweep().overlap(&a, &b), 4 * M);
    }

    #[test]
    fn partial_overlap_measures_the_intersection() {
        // [90,110] vs [95,115] intersect in [95,110]; the others are far away
        assert_eq!(sweep().overlap(&[100, 200], &[105, 5000]), 15);
    }

    #[test]
    fn low_timestamps_do_not_wrap() {
        // t < margin must not wrap to a huge interval start
        assert_eq!(sweep().overlap(&[0], &[0]), 2 * M);
        assert_eq!(sweep().overlap(&[0], &[5]), 15); // [-10,10] ∩ [-5,15]
        assert_eq!(sweep().overlap(&[3], &[0]), 17); // [-7,13] ∩ [-10,10]
    }

    #[test]
    fn high_timestamps_do_not_wrap() {
        assert_eq!(sweep().overlap(&[u64::MAX - 2], &[u64::MAX - 2]), 2 * M);
    }

    #[test]
    fn empty_or_zero_margin_is_zero() {
        assert_eq!(sweep().overlap(&[], &[100]), 0);
        assert_eq!(sweep().overlap(&[100], &[]), 0);
        assert_eq!(FixedMarginSweep { margin: 0 }.overlap(&[100], &[100]), 0);
    }

    #[test]
    fn sweep_is_symmetric() {
        let a = [100, 205, 333, 900];
        let b = [95, 210, 950];
        assert_eq!(sweep().overlap(&a, &b), sweep().overlap(&b, &a));
    }

    #[test]
    fn overlapping_intervals_within_one_list_are_counted_once_per_cover() {
        // a's intervals [90,110] and [95,115] both cover [95,110]; b covers
        // [85,105]. Active counts make the measure [85..115]∩[90..115]-style
        // unions, not double counts: expect [90,105] = 15.
        assert_eq!(sweep().overlap(&[100, 105], &[95]), 15);
    }

    fn gaussian() -> GaussianCutoff {
        GaussianCutoff::new(M)
    }

    fn reference(sigma: f64, d: f64) -> f64 {
        2.0 * sigma * std::f64::consts::PI.sqrt() * (-(d * d) / (4.0 * sigma * sigma)).exp()
    }

    #[test]
    fn gaussian_matches_reference_formula() {
        for d in [0u64, 1, 5, 10, 25, 79] {
            let expected = reference(M as f64, d as f64).round() as u64;
            assert_eq!(gaussian().overlap(&[1000], &[1000 + d]), expected, "d={d}");
        }
    }

    #[test]
    fn gaussian_is_zero_beyond_the_cutoff_window() {
        // cutoff 1σ keeps the boundary inside the quantisation range:
        // window = 2 · cutoff · sigma = 20
        let kernel = GaussianCutoff {
            sigma: M,
            cutoff: 1.0,
        };
        assert_eq!(kernel.overlap(&[1000], &[1020]), 0, "at the window edge");
        assert_ne!(kernel.overlap(&[1000], &[1019]), 0, "inside the window");
        // with the default 4σ cutoff the same pair is far from truncated
        assert_ne!(gaussian().overlap(&[1000], &[1020]), 0);
    }

    #[test]
    fn gaussian_decays_with_distance() {
        let at = |d: u64| gaussian().overlap(&[1000], &[1000 + d]);
        assert!(at(0) > at(10));
        assert!(at(10) > at(30));
        assert!(at(30) > at(60));
    }

    #[test]
    fn gaussian_sums_over_pairs() {
        // pairs in sweep order: (0, 5, 5, 0) nanoseconds apart
        let sigma = M as f64;
        let expected = (reference(sigma, 0.0)
            + reference(sigma, 5.0)
            + reference(sigma, 5.0)
            + reference(sigma, 0.0))
        .round();
        assert_eq!(
            gaussian().overlap(&[1000, 1005], &[1000, 1005]),
            expected as u64
        );
    }

    #[test]
    fn gaussian_is_symmetric() {
        let a = [100, 107, 230];
        let b = [95, 111];
        assert_eq!(gaussian().overlap(&a, &b), gaussian().overlap(&b, &a));
    }

    #[test]
    fn degenerate_gaussian_is_zero() {
        assert_eq!(GaussianCutoff::new(0).overlap(&[1], &[1]), 0);
        let negative_cutoff = GaussianCutoff {
            sigma: M,
            cutoff: -1.0,
        };
        assert_eq!(negative_cutoff.overlap(&[1], &[1]), 0);
        assert_eq!(gaussian().overlap(&[], &[1]), 0);
    }
}
