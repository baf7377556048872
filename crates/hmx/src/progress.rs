//! 📊 progress.rs: "Are we there yet?" Every heightmap, every time, forever.
//!
//! 🚀 The result collector owns the samples-done counter and publishes it on a
//! `tokio::sync::watch` channel. The reporter task in here subscribes, works out the
//! sampling pace, and draws a bar with a panel underneath it.
//!
//! ⚠️ Watching this progress bar will not make the game servers go faster.
//! We've tried. Science says no.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 🪟 How far back the pace looks. Backends finish in bursts; five seconds smooths them.
const PACE_WINDOW: Duration = Duration::from_secs(5);

/// 🔢 "1000000" → "1 000 000". Heights are counted in wagons, wagons in the millions.
pub(crate) fn group_digits(n: u64) -> String {
    let digits = n.to_string();
    let head = digits.len() % 3;
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    grouped.push_str(&digits[..head]);
    for (i, group) in digits.as_bytes()[head..].chunks(3).enumerate() {
        if head > 0 || i > 0 {
            grouped.push(' ');
        }
        grouped.extend(group.iter().map(|&b| char::from(b)));
    }
    grouped
}

/// ⏱️ `75 s` → `1m15s`, `3725 s` → `1h02m05s`. A whole island can take a while.
pub(crate) fn clock(duration: Duration) -> String {
    let secs = duration.as_secs();
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m{s:02}s"),
        (h, m, s) => format!("{h}h{m:02}m{s:02}s"),
    }
}

/// 🐢 How quickly wagons are landing right now, and what that means for the finish.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SamplingPace {
    samples_per_sec: f64,
    eta: Option<Duration>,
}

/// 📊 Samples done, the windowed sampling pace, and the bar that shows them.
pub(crate) struct ProgressMetrics {
    map_name: String,
    total_samples: u64,
    samples_done: u64,
    bar: ProgressBar,
    landings: VecDeque<(Instant, u64)>,
    started: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("ProgressMetrics")
            .field("map_name", &self.map_name)
            .field("total_samples", &self.total_samples)
            .field("samples_done", &self.samples_done)
            .finish()
    }
}

impl ProgressMetrics {
    /// 🚀 `visible = false` gets a hidden bar: same bookkeeping, no terminal output.
    pub(crate) fn new(map_name: String, total_samples: u64, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(total_samples)
        } else {
            ProgressBar::hidden()
        };
        let style = ProgressStyle::default_bar()
            .template("🗺️ {prefix} [{bar:40.green/white}] {percent:>3}%\n{msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>.");
        bar.set_style(style);
        bar.set_prefix(map_name.clone());

        let started = Instant::now();
        Self {
            map_name,
            total_samples,
            samples_done: 0,
            bar,
            landings: VecDeque::from([(started, 0)]),
            started,
        }
    }

    /// 🔄 The counter only ever goes up; a stale value is ignored.
    pub(crate) fn set(&mut self, samples_done: u64) {
        if samples_done < self.samples_done {
            return;
        }
        self.samples_done = samples_done;
        let pace = self.record_landing(Instant::now());
        self.redraw_panel(pace);
        self.bar.set_position(self.samples_done);
    }

    pub(crate) fn samples_done(&self) -> u64 {
        self.samples_done
    }

    pub(crate) fn finish(&self) {
        self.bar.finish();
    }

    /// 🪟 Log the current count at `now`, forget anything older than the window, and
    /// derive the pace from the oldest landing still in it.
    fn record_landing(&mut self, now: Instant) -> SamplingPace {
        while self
            .landings
            .front()
            .is_some_and(|&(at, _)| now.duration_since(at) > PACE_WINDOW)
        {
            self.landings.pop_front();
        }
        self.landings.push_back((now, self.samples_done));

        let Some(&(since, count_then)) = self.landings.front() else {
            return SamplingPace { samples_per_sec: 0.0, eta: None };
        };
        let span = now.duration_since(since).as_secs_f64();
        if span <= 0.0 {
            return SamplingPace { samples_per_sec: 0.0, eta: None };
        }
        let samples_per_sec = self.samples_done.saturating_sub(count_then) as f64 / span;
        let left = self.total_samples.saturating_sub(self.samples_done);
        let eta = (samples_per_sec > 0.0).then(|| Duration::from_secs_f64(left as f64 / samples_per_sec));
        SamplingPace { samples_per_sec, eta }
    }

    /// 🎨 Two rows under the bar:
    /// ```text
    ///   <done> / <total> samples   <pace> samples/s
    ///   <elapsed> elapsed          eta <eta>
    /// ```
    fn redraw_panel(&self, pace: SamplingPace) {
        let eta = pace.eta.map_or_else(|| "?".to_string(), clock);

        let mut panel = Table::new();
        panel.load_preset(NOTHING);
        panel.set_content_arrangement(ContentArrangement::Dynamic);
        panel.add_row(vec![
            Cell::new(format!(
                "{} / {} samples",
                group_digits(self.samples_done),
                group_digits(self.total_samples)
            )),
            Cell::new(format!("{} samples/s", group_digits(pace.samples_per_sec as u64)))
                .set_alignment(CellAlignment::Right),
        ]);
        panel.add_row(vec![
            Cell::new(format!("{} elapsed", clock(self.started.elapsed()))),
            Cell::new(format!("eta {eta}")).set_alignment(CellAlignment::Right),
        ]);
        self.bar.set_message(panel.to_string());
    }
}

/// 📡 Follow the collector's counter until it hangs up, then finish the bar.
/// Returns the last value seen.
pub(crate) fn spawn_reporter(mut samples_done: watch::Receiver<u64>, mut metrics: ProgressMetrics) -> JoinHandle<u64> {
    tokio::spawn(async move {
        metrics.set(*samples_done.borrow_and_update());
        while samples_done.changed().await.is_ok() {
            let latest = *samples_done.borrow_and_update();
            metrics.set(latest);
        }
        metrics.finish();
        metrics.samples_done()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_big_counts_are_grouped_in_threes() {
        assert_eq!(group_digits(0), "0");
        assert_eq!(group_digits(999), "999");
        assert_eq!(group_digits(1_000), "1 000");
        assert_eq!(group_digits(262_144), "262 144");
        assert_eq!(group_digits(1_234_567), "1 234 567");
    }

    #[test]
    fn the_one_where_the_clock_grows_units_as_needed() {
        assert_eq!(clock(Duration::from_secs(9)), "9s");
        assert_eq!(clock(Duration::from_secs(75)), "1m15s");
        assert_eq!(clock(Duration::from_secs(3_725)), "1h02m05s");
    }

    #[test]
    fn the_one_where_the_counter_never_goes_backwards() {
        let mut metrics = ProgressMetrics::new("Kuban".to_string(), 100, false);
        metrics.set(40);
        metrics.set(10);
        assert_eq!(metrics.samples_done(), 40);
    }

    #[test]
    fn the_one_where_the_pace_predicts_the_finish() {
        let mut metrics = ProgressMetrics::new("Kuban".to_string(), 1_000, false);
        let origin = metrics.started;
        metrics.samples_done = 200;
        let pace = metrics.record_landing(origin + Duration::from_secs(2));
        assert_eq!(pace.samples_per_sec, 100.0);
        assert_eq!(pace.eta, Some(Duration::from_secs(8)));

        // 🧪 six seconds on, the origin has slid out of the window
        metrics.samples_done = 300;
        let pace = metrics.record_landing(origin + Duration::from_secs(6));
        assert_eq!(pace.samples_per_sec, 25.0);
        assert_eq!(pace.eta, Some(Duration::from_secs(28)));
    }

    #[tokio::test]
    async fn the_one_where_the_reporter_sees_the_last_value() {
        let (tx, rx) = watch::channel(0u64);
        let reporter = spawn_reporter(rx, ProgressMetrics::new("Kuban".to_string(), 100, false));
        tx.send_replace(30);
        tx.send_replace(100);
        drop(tx);
        assert_eq!(reporter.await.ok(), Some(100));
    }
}
