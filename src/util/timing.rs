use std::fmt;
use std::time::Duration;

/// Durations of the last import or read, for display.
///
/// Each phase is `None` until it has run once; running it again replaces the
/// previous value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingReport {
    pub prepare: Option<Duration>,
    pub execute: Option<Duration>,
    pub fetch: Option<Duration>,
}

impl TimingReport {
    pub fn record_prepare(&mut self, duration: Duration) {
        self.prepare = Some(duration);
    }

    pub fn record_execute(&mut self, duration: Duration) {
        self.execute = Some(duration);
    }

    pub fn record_fetch(&mut self, duration: Duration) {
        self.fetch = Some(duration);
    }

    pub fn prepare_secs(&self) -> Option<f64> {
        self.prepare.map(|d| d.as_secs_f64())
    }

    pub fn execute_secs(&self) -> Option<f64> {
        self.execute.map(|d| d.as_secs_f64())
    }

    pub fn fetch_secs(&self) -> Option<f64> {
        self.fetch.map(|d| d.as_secs_f64())
    }
}

fn write_phase(f: &mut fmt::Formatter<'_>, label: &str, secs: Option<f64>) -> fmt::Result {
    match secs {
        Some(secs) => writeln!(f, "{label}: {secs:.6} s"),
        None => writeln!(f, "{label}: -"),
    }
}

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_phase(f, "Data preparation", self.prepare_secs())?;
        write_phase(f, "Query execution", self.execute_secs())?;
        write_phase(f, "Data fetch", self.fetch_secs())
    }
}
