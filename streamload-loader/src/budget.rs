use crate::config::LoaderConfig;
use std::time::{Duration, Instant};
use streamload_base::PackageName;

#[derive(Copy, Clone, Debug)]
struct OverrunWarning {
    multiplier: f32,
    min_time: Duration,
}

/// Soft wall-clock allowance for one tick of the loader, shared by every package ticked in it.
///
/// `use_full_time_limit` lets IO waits block past the point where work would normally give up
/// its time slice, the limit itself is still checked between units of work.
pub struct TickBudget {
    use_time_limit: bool,
    use_full_time_limit: bool,
    time_limit: Duration,
    tick_start: Instant,
    exceeded: bool,
    overrun_warning: Option<OverrunWarning>,
    overrun_warned: bool,
    last_work: &'static str,
    last_package: Option<PackageName>,
}

impl TickBudget {
    pub fn new(
        use_time_limit: bool,
        use_full_time_limit: bool,
        time_limit: Duration,
    ) -> Self {
        TickBudget {
            use_time_limit,
            use_full_time_limit,
            time_limit,
            tick_start: Instant::now(),
            exceeded: false,
            overrun_warning: None,
            overrun_warned: false,
            last_work: "unknown",
            last_package: None,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(false, false, Duration::ZERO)
    }

    pub fn with_overrun_warning(
        mut self,
        config: &LoaderConfig,
    ) -> Self {
        if config.warn_if_time_limit_exceeded {
            self.overrun_warning = Some(OverrunWarning {
                multiplier: config.time_limit_exceeded_multiplier,
                min_time: config.time_limit_exceeded_min_time(),
            });
        }
        self
    }

    // A budget for a sub-phase that starts now and gets at most `limit`, never more than what
    // this budget has left
    pub fn sub_budget(
        &self,
        limit: Duration,
    ) -> TickBudget {
        let time_limit = match self.remaining() {
            Some(remaining) => remaining.min(limit),
            None => limit,
        };
        TickBudget {
            use_time_limit: self.use_time_limit,
            use_full_time_limit: self.use_full_time_limit,
            time_limit,
            tick_start: Instant::now(),
            exceeded: false,
            overrun_warning: self.overrun_warning,
            overrun_warned: false,
            last_work: "unknown",
            last_package: None,
        }
    }

    pub fn use_time_limit(&self) -> bool {
        self.use_time_limit
    }

    pub fn use_full_time_limit(&self) -> bool {
        self.use_full_time_limit
    }

    pub fn elapsed(&self) -> Duration {
        self.tick_start.elapsed()
    }

    /// Time left in the budget, None if there is no limit
    pub fn remaining(&self) -> Option<Duration> {
        if self.use_time_limit {
            Some(self.time_limit.saturating_sub(self.elapsed()))
        } else {
            None
        }
    }

    /// Called before each package is ticked. A package giving up its time slice doesn't stop the
    /// next one from using what's left.
    pub fn begin_package(&mut self) {
        self.exceeded = false;
        self.last_work = "unknown";
        self.last_package = None;
    }

    pub fn set_last_work(
        &mut self,
        work: &'static str,
        package: &PackageName,
    ) {
        self.last_work = work;
        if self.last_package.as_ref() != Some(package) {
            self.last_package = Some(package.clone());
        }
    }

    pub fn is_time_limit_exceeded(&mut self) -> bool {
        if self.exceeded || !self.use_time_limit {
            return self.exceeded;
        }

        let elapsed = self.elapsed();
        if elapsed > self.time_limit {
            self.exceeded = true;
        }

        if let Some(warning) = self.overrun_warning {
            if !self.overrun_warned
                && elapsed > warning.min_time
                && elapsed.as_secs_f32() > warning.multiplier * self.time_limit.as_secs_f32()
            {
                self.overrun_warned = true;
                log::warn!(
                    "Time limit exceeded: {} {} took (less than) {:5.2} ms",
                    self.last_work,
                    self.last_package
                        .as_ref()
                        .map_or("<none>", |package| package.as_str()),
                    elapsed.as_secs_f64() * 1000.0
                );
            }
        }

        self.exceeded
    }

    /// Gives up the rest of the time slice if there is a time limit and IO waits aren't allowed
    /// to use all of it. Returns whether the work should stop for this tick.
    pub fn give_up_time_slice(&mut self) -> bool {
        if self.use_time_limit && !self.use_full_time_limit {
            self.exceeded = true;
        }
        self.exceeded
    }
}
