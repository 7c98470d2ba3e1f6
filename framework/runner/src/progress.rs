use std::cmp::min;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressState, ProgressStyle};

/// Progress bar shown while the master runs, to show the user how long is left.
///
/// Master output goes through [RunProgress::println] so it is printed above the bar instead of
/// through it.
pub struct RunProgress {
    bar: Option<ProgressBar>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RunProgress {
    /// Start the bar, or a plain printer when `planned_runtime` is unknown or the bar is disabled.
    pub fn start(planned_runtime: Option<Duration>, enabled: bool) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let planned_runtime = match planned_runtime {
            Some(runtime) if enabled && !runtime.is_zero() => runtime,
            _ => {
                return Self {
                    bar: None,
                    stop,
                    thread: None,
                }
            }
        };

        let bar = ProgressBar::new(planned_runtime.as_secs());
        bar.set_style(progress_style(planned_runtime));

        let thread_bar = bar.clone();
        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("progress".to_string())
            .spawn(move || {
                let start_time = Instant::now();
                while !thread_stop.load(Ordering::Acquire) {
                    let new = min(start_time.elapsed().as_secs(), planned_runtime.as_secs());
                    thread_bar.set_position(new);
                    std::thread::sleep(Duration::from_millis(250));
                }
                log::trace!("Progress thread shutting down");
                thread_bar.finish_and_clear();
            });

        match thread {
            Ok(thread) => Self {
                bar: Some(bar),
                stop,
                thread: Some(thread),
            },
            Err(e) => {
                log::warn!("Failed to start progress thread, continuing without it: {e}");
                Self {
                    bar: None,
                    stop,
                    thread: None,
                }
            }
        }
    }

    pub fn is_visible(&self) -> bool {
        self.bar.is_some()
    }

    pub fn println(&self, line: &str) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }

    /// Stop the progress thread and clear the bar.
    pub fn finish(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Progress thread panicked");
            }
        }
    }
}

impl Drop for RunProgress {
    fn drop(&mut self) {
        self.finish();
    }
}

fn progress_style(planned_runtime: Duration) -> ProgressStyle {
    let total = planned_runtime.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);

    ProgressStyle::with_template(
        "{spinner:.green} [{wide_bar:.cyan/blue}] [{elapsed_precise} / {planned_runtime}]",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .with_key(
        "planned_runtime",
        move |_state: &ProgressState, w: &mut dyn Write| {
            let _ = write!(w, "{hours:02}:{minutes:02}:{seconds:02}");
        },
    )
    .progress_chars("#>-")
}
