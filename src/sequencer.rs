use std::time::Duration;

use tokio::time;
use tracing::{info, warn};

use crate::errors::{OperatorError, OperatorResult};
use crate::orchestrator::RunContext;

/// One named unit of lifecycle work. Steps are executed strictly
/// sequentially; external side effects of completed steps are never rolled
/// back.
pub trait LifecycleStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &RunContext) -> OperatorResult<()>;

    /// Complete-postcondition check consulted in incremental mode. Must
    /// verify the whole postcondition of the step, not just its first side
    /// effect, so a partial prior failure is never masked as success.
    fn already_satisfied(&self, _ctx: &RunContext) -> OperatorResult<bool> {
        Ok(false)
    }

    /// Earliest unix time this step may start, if it is gated on wall-clock
    /// time (e.g. tree merges wait for the voting window to close).
    fn ready_at(&self, _ctx: &RunContext) -> OperatorResult<Option<u64>> {
        Ok(None)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

#[derive(Clone, Debug)]
pub struct StepRecord {
    pub name: &'static str,
    pub status: StepStatus,
    pub detail: Option<String>,
}

/// Ordered progress ledger for one run; the only shared mutable resource
/// the sequencer itself owns.
#[derive(Clone, Debug, Default)]
pub struct RunLedger {
    records: Vec<StepRecord>,
}

impl RunLedger {
    fn push(&mut self, name: &'static str) {
        self.records.push(StepRecord {
            name,
            status: StepStatus::Pending,
            detail: None,
        });
    }

    fn mark(&mut self, status: StepStatus, detail: Option<String>) {
        if let Some(record) = self.records.last_mut() {
            record.status = status;
            record.detail = detail;
        }
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn completed(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == StepStatus::Completed)
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == StepStatus::Skipped)
            .count()
    }
}

/// Pacing policy between steps. Best-effort spacing for rate-limited
/// external systems, not a correctness mechanism.
#[derive(Clone, Copy, Debug, Default)]
pub struct Pacing {
    between_steps: Duration,
}

impl Pacing {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn fixed_secs(secs: u64) -> Self {
        Self {
            between_steps: Duration::from_secs(secs),
        }
    }

    fn delay(&self) -> Option<Duration> {
        (!self.between_steps.is_zero()).then_some(self.between_steps)
    }
}

/// Drives an ordered step list to completion, honoring skip-by-ordinal,
/// incremental re-entry, and inter-step pacing. The first failure aborts
/// the remaining sequence.
pub struct Sequencer {
    pacing: Pacing,
    skip: usize,
    incremental: bool,
}

impl Sequencer {
    pub fn new(pacing: Pacing, skip: usize, incremental: bool) -> Self {
        Self {
            pacing,
            skip,
            incremental,
        }
    }

    pub async fn run(
        &self,
        steps: &[Box<dyn LifecycleStep>],
        ctx: &RunContext,
    ) -> OperatorResult<RunLedger> {
        let mut ledger = RunLedger::default();
        for (index, step) in steps.iter().enumerate() {
            let ordinal = index + 1;
            let name = step.name();
            ledger.push(name);

            if ordinal <= self.skip {
                info!(step = name, ordinal, "skipping step by index");
                ledger.mark(StepStatus::Skipped, Some("skipped by index".into()));
                continue;
            }

            if self.incremental {
                match step.already_satisfied(ctx) {
                    Ok(true) => {
                        info!(step = name, "postcondition already holds; skipping");
                        ledger.mark(StepStatus::Skipped, Some("already satisfied".into()));
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        ledger.mark(StepStatus::Failed, Some(err.to_string()));
                        return Err(OperatorError::in_step(name, err));
                    }
                }
            }

            match step.ready_at(ctx) {
                Ok(Some(ready_at)) => {
                    let now = ctx.clock().unix_now();
                    if ready_at > now {
                        let wait = ready_at - now;
                        info!(step = name, wait_secs = wait, "waiting before step");
                        time::sleep(Duration::from_secs(wait)).await;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    ledger.mark(StepStatus::Failed, Some(err.to_string()));
                    return Err(OperatorError::in_step(name, err));
                }
            }

            ledger.mark(StepStatus::Running, None);
            info!(step = name, ordinal, total = steps.len(), "running step");
            match step.run(ctx) {
                Ok(()) => ledger.mark(StepStatus::Completed, None),
                Err(err) => {
                    warn!(step = name, error = %err, "step failed; aborting run");
                    ledger.mark(StepStatus::Failed, Some(err.to_string()));
                    return Err(OperatorError::in_step(name, err));
                }
            }

            if index + 1 < steps.len() {
                if let Some(delay) = self.pacing.delay() {
                    info!(
                        step = name,
                        pause_secs = delay.as_secs(),
                        "pausing between steps"
                    );
                    time::sleep(delay).await;
                }
            }
        }
        Ok(ledger)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::devnet::sample_context;
    use crate::errors::OperatorError;

    struct ScriptedStep {
        name: &'static str,
        trace: Arc<Mutex<Vec<&'static str>>>,
        runs: AtomicUsize,
        fail: bool,
        satisfied: bool,
    }

    impl ScriptedStep {
        fn new(name: &'static str, trace: Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                name,
                trace,
                runs: AtomicUsize::new(0),
                fail: false,
                satisfied: false,
            }
        }

        fn failing(name: &'static str, trace: Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                fail: true,
                ..Self::new(name, trace)
            }
        }

        fn satisfied(name: &'static str, trace: Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                satisfied: true,
                ..Self::new(name, trace)
            }
        }
    }

    impl LifecycleStep for ScriptedStep {
        fn name(&self) -> &'static str {
            self.name
        }

        fn run(&self, _ctx: &RunContext) -> OperatorResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.trace.lock().push(self.name);
            if self.fail {
                Err(OperatorError::LedgerUnavailable("rpc timeout".into()))
            } else {
                Ok(())
            }
        }

        fn already_satisfied(&self, _ctx: &RunContext) -> OperatorResult<bool> {
            Ok(self.satisfied)
        }
    }

    fn boxed(steps: Vec<ScriptedStep>) -> Vec<Box<dyn LifecycleStep>> {
        steps
            .into_iter()
            .map(|step| Box::new(step) as Box<dyn LifecycleStep>)
            .collect()
    }

    #[tokio::test]
    async fn steps_run_in_declared_order() {
        let (ctx, _dir) = sample_context();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let steps = boxed(vec![
            ScriptedStep::new("first", trace.clone()),
            ScriptedStep::new("second", trace.clone()),
            ScriptedStep::new("third", trace.clone()),
        ]);
        let sequencer = Sequencer::new(Pacing::none(), 0, false);
        let ledger = sequencer.run(&steps, &ctx).await.expect("run");
        assert_eq!(*trace.lock(), vec!["first", "second", "third"]);
        assert_eq!(ledger.completed(), 3);
    }

    #[tokio::test]
    async fn skip_by_ordinal_excludes_leading_steps() {
        let (ctx, _dir) = sample_context();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let steps = boxed(vec![
            ScriptedStep::new("first", trace.clone()),
            ScriptedStep::new("second", trace.clone()),
            ScriptedStep::new("third", trace.clone()),
        ]);
        let sequencer = Sequencer::new(Pacing::none(), 2, false);
        let ledger = sequencer.run(&steps, &ctx).await.expect("run");
        assert_eq!(*trace.lock(), vec!["third"]);
        assert_eq!(ledger.skipped(), 2);
    }

    #[tokio::test]
    async fn incremental_mode_skips_satisfied_steps() {
        let (ctx, _dir) = sample_context();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let steps = boxed(vec![
            ScriptedStep::satisfied("first", trace.clone()),
            ScriptedStep::new("second", trace.clone()),
        ]);
        let sequencer = Sequencer::new(Pacing::none(), 0, true);
        let ledger = sequencer.run(&steps, &ctx).await.expect("run");
        assert_eq!(*trace.lock(), vec!["second"]);
        assert_eq!(ledger.skipped(), 1);
        assert_eq!(ledger.completed(), 1);
    }

    #[tokio::test]
    async fn postcondition_checks_are_ignored_outside_incremental_mode() {
        let (ctx, _dir) = sample_context();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let steps = boxed(vec![ScriptedStep::satisfied("first", trace.clone())]);
        let sequencer = Sequencer::new(Pacing::none(), 0, false);
        sequencer.run(&steps, &ctx).await.expect("run");
        assert_eq!(*trace.lock(), vec!["first"]);
    }

    #[tokio::test]
    async fn first_failure_aborts_the_remainder() {
        let (ctx, _dir) = sample_context();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let steps = boxed(vec![
            ScriptedStep::new("first", trace.clone()),
            ScriptedStep::failing("second", trace.clone()),
            ScriptedStep::new("third", trace.clone()),
        ]);
        let sequencer = Sequencer::new(Pacing::none(), 0, false);
        let err = sequencer.run(&steps, &ctx).await.unwrap_err();
        assert_eq!(*trace.lock(), vec!["first", "second"]);
        match err {
            OperatorError::Step { step, source } => {
                assert_eq!(step, "second");
                assert!(matches!(*source, OperatorError::LedgerUnavailable(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_delays_are_inserted_between_steps() {
        let (ctx, _dir) = sample_context();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let steps = boxed(vec![
            ScriptedStep::new("first", trace.clone()),
            ScriptedStep::new("second", trace.clone()),
        ]);
        let sequencer = Sequencer::new(Pacing::fixed_secs(30), 0, false);
        let started = tokio::time::Instant::now();
        sequencer.run(&steps, &ctx).await.expect("run");
        // One pause between two steps, none after the last.
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }
}
