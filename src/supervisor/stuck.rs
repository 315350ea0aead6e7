//! Detects a server process that is alive but no longer doing any work.
//!
//! Every poll samples the CPU the process used since the previous poll. Once
//! `samples` consecutive readings all sit at or below `cpu_percent`, the
//! process is reported as possibly stuck. It is reported again only after it
//! has been seen busy in between.

use std::collections::VecDeque;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StuckPolicy {
    /// Window length. `0` disables detection.
    pub samples: u32,
    pub cpu_percent: f32,
}

impl Default for StuckPolicy {
    fn default() -> Self {
        Self {
            samples: 5,
            cpu_percent: 0.5,
        }
    }
}

impl StuckPolicy {
    pub fn enabled(&self) -> bool {
        self.samples > 0
    }
}

pub(crate) struct StuckDetector {
    policy: StuckPolicy,
    window: VecDeque<f32>,
    reported: bool,
}

impl StuckDetector {
    pub(crate) fn new(policy: StuckPolicy) -> Self {
        Self {
            policy,
            window: VecDeque::with_capacity(policy.samples as usize),
            reported: false,
        }
    }

    /// Returns the window mean the first time the window turns idle.
    pub(crate) fn record(&mut self, cpu_percent: f32) -> Option<f32> {
        let len = self.policy.samples as usize;
        if len == 0 {
            return None;
        }
        if self.window.len() == len {
            self.window.pop_front();
        }
        self.window.push_back(cpu_percent);

        let idle = self.window.len() == len
            && self.window.iter().all(|&c| c <= self.policy.cpu_percent);
        if !idle {
            self.reported = false;
            return None;
        }
        if self.reported {
            return None;
        }
        self.reported = true;
        Some(self.window.iter().sum::<f32>() / len as f32)
    }

    pub(crate) fn clear(&mut self) {
        self.window.clear();
        self.reported = false;
    }
}

/// CPU usage of one process between consecutive samples.
pub(crate) struct CpuSampler {
    system: System,
    pid: Option<Pid>,
}

impl CpuSampler {
    pub(crate) fn new() -> Self {
        Self {
            system: System::new(),
            pid: None,
        }
    }

    /// `None` on the first sample of a pid, which only sets the baseline, and
    /// for a process that is already gone.
    pub(crate) fn sample(&mut self, pid: u32) -> Option<f32> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_cpu(),
        );
        let usage = self.system.process(pid).map(|p| p.cpu_usage());
        if self.pid != Some(pid) {
            self.pid = Some(pid);
            return None;
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(samples: u32) -> StuckDetector {
        StuckDetector::new(StuckPolicy {
            samples,
            cpu_percent: 1.0,
        })
    }

    #[test]
    fn reports_once_window_is_idle() {
        let mut d = detector(3);
        assert_eq!(d.record(0.2), None);
        assert_eq!(d.record(0.0), None);
        let mean = d.record(0.4).unwrap();
        assert!((mean - 0.2).abs() < 1e-6);
        // still idle, already reported
        assert_eq!(d.record(0.0), None);
    }

    #[test]
    fn busy_sample_rearms() {
        let mut d = detector(2);
        d.record(0.0);
        assert!(d.record(0.0).is_some());
        assert_eq!(d.record(35.0), None);
        assert_eq!(d.record(0.0), None);
        assert!(d.record(0.0).is_some());
    }

    #[test]
    fn one_busy_sample_keeps_window_alive() {
        let mut d = detector(4);
        for cpu in [0.0, 0.0, 12.5, 0.0, 0.0] {
            assert_eq!(d.record(cpu), None);
        }
    }

    #[test]
    fn disabled_and_cleared() {
        let mut d = detector(0);
        assert!(!StuckPolicy { samples: 0, cpu_percent: 1.0 }.enabled());
        assert_eq!(d.record(0.0), None);

        let mut d = detector(2);
        d.record(0.0);
        d.clear();
        assert_eq!(d.record(0.0), None);
    }
}
