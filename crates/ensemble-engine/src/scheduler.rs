use std::iter::FusedIterator;

use chrono::NaiveDate;

use ensemble_core::{EnsembleError, Result, TimeWindow};

/// Derives rolling (train, validate, trade) windows from a trade calendar.
///
/// The first window ends its trade slice at calendar index
/// `rebalance_window + validation_window`; each following window advances by
/// `rebalance_window`. Lengths count trading dates, not calendar days.
#[derive(Debug, Clone)]
pub struct WindowScheduler<'a> {
    calendar: &'a [NaiveDate],
    train_start: NaiveDate,
    rebalance_window: usize,
    validation_window: usize,
}

impl<'a> WindowScheduler<'a> {
    pub fn new(
        calendar: &'a [NaiveDate],
        train_start: NaiveDate,
        rebalance_window: usize,
        validation_window: usize,
    ) -> Result<Self> {
        if rebalance_window == 0 || validation_window == 0 {
            return Err(EnsembleError::Configuration(format!(
                "window lengths must be positive (rebalance={rebalance_window}, validation={validation_window})"
            )));
        }
        if calendar.windows(2).any(|w| w[1] <= w[0]) {
            return Err(EnsembleError::DataIntegrity(
                "trade calendar is not strictly increasing".to_string(),
            ));
        }
        Ok(Self {
            calendar,
            train_start,
            rebalance_window,
            validation_window,
        })
    }

    /// Number of windows [`Self::windows`] yields. Zero when the calendar is
    /// not longer than `rebalance_window + validation_window`.
    pub fn window_count(&self) -> usize {
        let first = self.rebalance_window + self.validation_window;
        if self.calendar.len() <= first {
            return 0;
        }
        (self.calendar.len() - first).div_ceil(self.rebalance_window)
    }

    /// A fresh pass over the windows; call again to restart.
    pub fn windows(&self) -> Windows<'a> {
        Windows {
            calendar: self.calendar,
            train_start: self.train_start,
            rebalance_window: self.rebalance_window,
            validation_window: self.validation_window,
            next_index: self.rebalance_window + self.validation_window,
            ordinal: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Windows<'a> {
    calendar: &'a [NaiveDate],
    train_start: NaiveDate,
    rebalance_window: usize,
    validation_window: usize,
    next_index: usize,
    ordinal: usize,
}

impl Iterator for Windows<'_> {
    type Item = TimeWindow;

    fn next(&mut self) -> Option<TimeWindow> {
        let i = self.next_index;
        if i >= self.calendar.len() {
            return None;
        }
        let validation_start = self.calendar[i - self.rebalance_window - self.validation_window];
        let trade_start = self.calendar[i - self.rebalance_window];
        let window = TimeWindow {
            index: i,
            ordinal: self.ordinal,
            train_start: self.train_start,
            validation_start,
            validation_end: trade_start,
            trade_start,
            trade_end: self.calendar[i],
            is_initial: self.ordinal == 0,
        };
        self.next_index += self.rebalance_window;
        self.ordinal += 1;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.next_index >= self.calendar.len() {
            0
        } else {
            (self.calendar.len() - self.next_index).div_ceil(self.rebalance_window)
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Windows<'_> {}

impl FusedIterator for Windows<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn calendar(n: usize) -> Vec<NaiveDate> {
        let start = NaiveDate::from_ymd_opt(2015, 10, 2).unwrap();
        (0..n)
            .map(|i| start + chrono::Duration::days(i as i64))
            .collect()
    }

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2009, 1, 2).unwrap()
    }

    #[test]
    fn test_window_count_matches_iteration() {
        for (n, rb, vw) in [(400, 20, 20), (401, 20, 20), (1200, 63, 63), (130, 63, 63)] {
            let cal = calendar(n);
            let sched = WindowScheduler::new(&cal, start(), rb, vw).unwrap();
            assert_eq!(sched.windows().count(), sched.window_count(), "n={n}");
            assert_eq!(sched.windows().len(), sched.window_count());
        }
        let cal = calendar(400);
        let sched = WindowScheduler::new(&cal, start(), 20, 20).unwrap();
        assert_eq!(sched.window_count(), (400 - 40) / 20);
    }

    #[test]
    fn test_short_calendar_yields_nothing() {
        let cal = calendar(126);
        let sched = WindowScheduler::new(&cal, start(), 63, 63).unwrap();
        assert_eq!(sched.window_count(), 0);
        assert!(sched.windows().next().is_none());

        let cal = calendar(10);
        let sched = WindowScheduler::new(&cal, start(), 63, 63).unwrap();
        assert_eq!(sched.windows().count(), 0);
    }

    #[test]
    fn test_zero_length_rejected() {
        let cal = calendar(100);
        assert!(matches!(
            WindowScheduler::new(&cal, start(), 0, 10),
            Err(EnsembleError::Configuration(_))
        ));
    }

    #[test]
    fn test_window_boundaries() {
        let cal = calendar(400);
        let sched = WindowScheduler::new(&cal, start(), 20, 30).unwrap();
        let windows: Vec<TimeWindow> = sched.windows().collect();

        let first = &windows[0];
        assert_eq!(first.index, 50);
        assert!(first.is_initial);
        assert_eq!(first.validation_start, cal[0]);
        assert_eq!(first.validation_end, cal[30]);
        assert_eq!(first.trade_start, cal[30]);
        assert_eq!(first.trade_end, cal[50]);
        assert!(windows[1..].iter().all(|w| !w.is_initial));

        for w in &windows {
            assert!(w.train_start <= w.validation_start);
            assert!(w.validation_start < w.validation_end);
            assert_eq!(w.validation_end, w.trade_start);
            assert!(w.trade_start < w.trade_end);
        }
    }

    #[test]
    fn test_trade_slices_are_contiguous() {
        let cal = calendar(300);
        let sched = WindowScheduler::new(&cal, start(), 25, 25).unwrap();
        let windows: Vec<TimeWindow> = sched.windows().collect();
        for pair in windows.windows(2) {
            assert_eq!(pair[0].trade_end, pair[1].trade_start);
            assert!(pair[1].index > pair[0].index);
            assert_eq!(pair[1].ordinal, pair[0].ordinal + 1);
        }
    }

    #[test]
    fn test_windows_restartable() {
        let cal = calendar(200);
        let sched = WindowScheduler::new(&cal, start(), 20, 20).unwrap();
        let a: Vec<TimeWindow> = sched.windows().collect();
        let b: Vec<TimeWindow> = sched.windows().collect();
        assert_eq!(a, b);
    }
}
