//! Frame profiling
//!
//! Two layers:
//! - [`FrameProfiler`] measures CPU time per draw stage and summarises it into the
//!   [`DrawResult`](crate::pipeline::DrawResult) profiling string when
//!   [`RenderConfig::profiling`](crate::RenderConfig::profiling) is set.
//! - The `profile_scope!` and `frame_mark!` macros emit Tracy spans when the
//!   `profiling` Cargo feature is enabled and compile to nothing otherwise.

use std::time::{Duration, Instant};

#[cfg(feature = "profiling")]
pub use tracy_client::{self, frame_mark as tracy_frame_mark, span};

/// Profile the rest of the enclosing scope.
#[macro_export]
#[cfg(feature = "profiling")]
macro_rules! profile_scope {
    ($name:expr) => {
        let _profile_span = $crate::profiling::span!($name);
    };
}

/// Profile the rest of the enclosing scope (no-op when profiling is disabled).
#[macro_export]
#[cfg(not(feature = "profiling"))]
macro_rules! profile_scope {
    ($name:expr) => {};
}

/// Mark the end of a frame.
#[macro_export]
#[cfg(feature = "profiling")]
macro_rules! frame_mark {
    () => {
        $crate::profiling::tracy_frame_mark()
    };
}

#[macro_export]
#[cfg(not(feature = "profiling"))]
macro_rules! frame_mark {
    () => {};
}

pub use crate::{frame_mark, profile_scope};

/// CPU time spent in each draw stage of one frame
#[derive(Debug, Default)]
pub struct FrameProfiler {
    enabled: bool,
    stages: Vec<(&'static str, Duration)>,
    current: Option<(&'static str, Instant)>,
}

impl FrameProfiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Close the running stage, if any, and open `stage`
    pub fn begin(&mut self, stage: &'static str) {
        if !self.enabled {
            return;
        }
        self.end();
        self.current = Some((stage, Instant::now()));
    }

    pub fn end(&mut self) {
        if let Some((stage, started)) = self.current.take() {
            self.stages.push((stage, started.elapsed()));
        }
    }

    pub fn stages(&self) -> &[(&'static str, Duration)] {
        &self.stages
    }

    pub fn total(&self) -> Duration {
        self.stages.iter().map(|(_, duration)| *duration).sum()
    }

    /// One line listing every closed stage, `None` when disabled
    pub fn summary(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let mut summary = self
            .stages
            .iter()
            .map(|(stage, duration)| format!("{stage}: {:.2}ms", duration.as_secs_f64() * 1000.0))
            .collect::<Vec<_>>()
            .join(", ");
        summary.push_str(&format!(
            " (total {:.2}ms)",
            self.total().as_secs_f64() * 1000.0
        ));
        Some(summary)
    }

    pub fn reset(&mut self) {
        self.stages.clear();
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_profiler_records_nothing() {
        let mut profiler = FrameProfiler::new(false);
        profiler.begin("first pass");
        profiler.end();
        assert!(profiler.stages().is_empty());
        assert!(profiler.summary().is_none());
    }

    #[test]
    fn test_stages_close_in_order() {
        let mut profiler = FrameProfiler::new(true);
        profiler.begin("first pass");
        profiler.begin("shadows");
        profiler.end();
        let names: Vec<_> = profiler.stages().iter().map(|(name, _)| *name).collect();
        assert_eq!(names, ["first pass", "shadows"]);
        let summary = profiler.summary().unwrap();
        assert!(summary.starts_with("first pass: "));
        assert!(summary.contains("shadows: "));
    }
}
