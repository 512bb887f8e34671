//! Autoscaler: resizes the worker pool from observed queue depth.
//!
//! [`ScalingPolicy`] is the pure decision, [`ControlLoop`] applies it through
//! a [`PoolControl`], and [`AutoscalerActor`] drives the loop on a fixed
//! interval. Ticks are actor messages, so they never overlap.

use std::sync::Arc;
use std::time::Duration;

use analysis_core::{ScalingConfig, WorkEvent};
use chrono::Utc;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::messages::{AutoscalerMessage, QueueMessage, ScaleError};
use crate::pool::PoolControl;

const SAMPLE_TIMEOUT: Duration = Duration::from_secs(5);

/// What one tick decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    ScaleUp { from: usize, to: usize },
    ScaleDown { from: usize, to: usize },
    /// The pool is under its floor; restored without waiting for a cooldown.
    Restore { from: usize, to: usize },
}

/// Pool bounds, sizing target and cooldowns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingPolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub target_items_per_worker: u64,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
}

impl ScalingPolicy {
    pub fn from_config(config: &ScalingConfig) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            target_items_per_worker: config.target_items_per_worker,
            scale_up_cooldown: config.scale_up_cooldown(),
            scale_down_cooldown: config.scale_down_cooldown(),
        }
    }

    /// `ceil(depth / target_items_per_worker)`, clamped to the pool bounds.
    pub fn desired_workers(&self, depth: u64) -> usize {
        let needed = depth.div_ceil(self.target_items_per_worker.max(1));
        let needed = usize::try_from(needed).unwrap_or(usize::MAX);
        needed.clamp(self.min_workers, self.max_workers)
    }

    pub fn decide(
        &self,
        depth: u64,
        current: usize,
        last_action: Option<Instant>,
        now: Instant,
    ) -> ScaleDecision {
        if current < self.min_workers {
            return ScaleDecision::Restore {
                from: current,
                to: self.min_workers,
            };
        }

        let elapsed = |cooldown: Duration| match last_action {
            Some(at) => now.saturating_duration_since(at) >= cooldown,
            None => true,
        };

        let desired = self.desired_workers(depth);
        if desired > current && elapsed(self.scale_up_cooldown) {
            ScaleDecision::ScaleUp {
                from: current,
                to: desired,
            }
        } else if desired < current && elapsed(self.scale_down_cooldown) {
            ScaleDecision::ScaleDown {
                from: current,
                to: desired,
            }
        } else {
            ScaleDecision::Hold
        }
    }
}

/// Result of one control loop tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Held { current: usize, desired: usize },
    Scaled { from: usize, to: usize },
    DirectiveFailed(ScaleError),
}

/// Applies the policy to a pool and remembers when it last acted.
pub struct ControlLoop {
    policy: ScalingPolicy,
    pool: Arc<dyn PoolControl>,
    last_action: Option<Instant>,
    event_tx: Option<broadcast::Sender<WorkEvent>>,
}

impl ControlLoop {
    pub fn new(policy: ScalingPolicy, pool: Arc<dyn PoolControl>) -> Self {
        Self {
            policy,
            pool,
            last_action: None,
            event_tx: None,
        }
    }

    /// Set the event broadcaster.
    pub fn with_event_tx(mut self, tx: broadcast::Sender<WorkEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn last_action(&self) -> Option<Instant> {
        self.last_action
    }

    pub async fn tick(&mut self, depth: u64, now: Instant) -> TickOutcome {
        let current = match self.pool.current_count().await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!("Cannot read worker count: {}", e);
                return TickOutcome::DirectiveFailed(e);
            }
        };

        let decision = self.policy.decide(depth, current, self.last_action, now);
        let applied = match decision {
            ScaleDecision::Hold => {
                return TickOutcome::Held {
                    current,
                    desired: self.policy.desired_workers(depth),
                };
            }
            ScaleDecision::Restore { from, to } => {
                tracing::warn!("Worker pool below minimum ({} < {}), restoring", from, to);
                self.pool.scale_to(to).await.map(|n| (from, n))
            }
            ScaleDecision::ScaleUp { from, to } => {
                self.pool.scale_to(to).await.map(|n| (from, n))
            }
            ScaleDecision::ScaleDown { from, to } => match self.drain(from, to).await {
                (reached, Some(e)) if reached == from => Err(e),
                (reached, Some(e)) => {
                    tracing::warn!("Scale-down stopped at {} workers (target {}): {}", reached, to, e);
                    Ok((from, reached))
                }
                (reached, None) => Ok((from, reached)),
            },
        };

        match applied {
            Ok((from, to)) => {
                if !matches!(decision, ScaleDecision::Restore { .. }) {
                    self.last_action = Some(now);
                }
                tracing::info!(depth, "Scaled worker pool from {} to {}", from, to);
                if let Some(ref tx) = self.event_tx {
                    let _ = tx.send(WorkEvent::PoolScaled {
                        from,
                        to,
                        queue_depth: depth,
                        timestamp: Utc::now(),
                    });
                }
                TickOutcome::Scaled { from, to }
            }
            Err(e) => {
                tracing::warn!(?decision, "Scaling directive failed, retrying next tick: {}", e);
                TickOutcome::DirectiveFailed(e)
            }
        }
    }

    /// Drain down towards `to`, returning the count reached and the error
    /// that stopped it early, if any.
    async fn drain(&self, from: usize, to: usize) -> (usize, Option<ScaleError>) {
        let mut current = from;
        for _ in to..from {
            match self.pool.drain_one().await {
                Ok(n) => current = n,
                Err(e) => return (current, Some(e)),
            }
        }
        (current, None)
    }
}

/// Autoscaler actor arguments.
pub struct AutoscalerArgs {
    pub control: ControlLoop,
    pub queue: ActorRef<QueueMessage>,
    pub check_interval: Duration,
}

/// Actor that ticks the control loop.
pub struct AutoscalerActor;

impl Actor for AutoscalerActor {
    type Msg = AutoscalerMessage;
    type State = AutoscalerArgs;
    type Arguments = AutoscalerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting autoscaler, checking every {:?}", args.check_interval);

        let interval = args.check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if myself.send_message(AutoscalerMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(args)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            AutoscalerMessage::Tick => {
                let stats = ractor::rpc::call(
                    &state.queue,
                    |reply| QueueMessage::GetStats { reply },
                    Some(SAMPLE_TIMEOUT),
                )
                .await;
                match stats {
                    Ok(CallResult::Success(stats)) => {
                        let outcome = state.control.tick(stats.depth(), Instant::now()).await;
                        tracing::debug!(?outcome, depth = stats.depth(), "Autoscaler tick");
                    }
                    _ => tracing::warn!("Cannot sample queue depth, skipping tick"),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Pool stand-in recording the directives it receives.
    #[derive(Default)]
    struct FakePool {
        count: Mutex<usize>,
        min: usize,
        max: usize,
        directives: Mutex<Vec<String>>,
        failing: AtomicBool,
        /// Drains allowed before `drain_one` starts failing.
        drain_budget: Mutex<Option<usize>>,
    }

    impl FakePool {
        fn new(count: usize, min: usize, max: usize) -> Arc<Self> {
            Arc::new(Self {
                count: Mutex::new(count),
                min,
                max,
                ..Default::default()
            })
        }

        fn count(&self) -> usize {
            *self.count.lock().unwrap()
        }

        fn directives(&self) -> Vec<String> {
            self.directives.lock().unwrap().clone()
        }

        fn check(&self) -> Result<(), ScaleError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(ScaleError::Unavailable("down".into()))
            } else {
                Ok(())
            }
        }
    }

    impl PoolControl for FakePool {
        fn current_count(&self) -> BoxFuture<'_, Result<usize, ScaleError>> {
            Box::pin(async move { Ok(self.count()) })
        }

        fn scale_to(&self, target: usize) -> BoxFuture<'_, Result<usize, ScaleError>> {
            Box::pin(async move {
                self.directives.lock().unwrap().push(format!("scale_to({target})"));
                self.check()?;
                let mut count = self.count.lock().unwrap();
                *count = target.clamp(self.min, self.max);
                Ok::<_, ScaleError>(*count)
            })
        }

        fn drain_one(&self) -> BoxFuture<'_, Result<usize, ScaleError>> {
            Box::pin(async move {
                self.directives.lock().unwrap().push("drain_one".into());
                self.check()?;
                if let Some(budget) = self.drain_budget.lock().unwrap().as_mut() {
                    if *budget == 0 {
                        return Err(ScaleError::Unavailable("drain refused".into()));
                    }
                    *budget -= 1;
                }
                let mut count = self.count.lock().unwrap();
                if *count <= self.min {
                    return Err(ScaleError::AtMinimum(self.min));
                }
                *count -= 1;
                Ok::<_, ScaleError>(*count)
            })
        }
    }

    fn policy() -> ScalingPolicy {
        ScalingPolicy::from_config(&ScalingConfig::default())
    }

    #[test]
    fn desired_workers_rounds_up_and_clamps() {
        let mut p = policy();
        assert_eq!(p.desired_workers(0), 3);
        assert_eq!(p.desired_workers(7), 7);
        assert_eq!(p.desired_workers(500), 20);

        p.target_items_per_worker = 5;
        assert_eq!(p.desired_workers(11), 3);
        assert_eq!(p.desired_workers(21), 5);
        assert_eq!(p.desired_workers(100), 20);
    }

    #[test]
    fn decide_respects_cooldowns() {
        let p = policy();
        let now = Instant::now();
        let recent = Some(now);
        let later = now + Duration::from_secs(31);
        let much_later = now + Duration::from_secs(121);

        assert_eq!(p.decide(10, 3, recent, now), ScaleDecision::Hold);
        assert_eq!(
            p.decide(10, 3, recent, later),
            ScaleDecision::ScaleUp { from: 3, to: 10 }
        );
        assert_eq!(p.decide(0, 10, recent, later), ScaleDecision::Hold);
        assert_eq!(
            p.decide(0, 10, recent, much_later),
            ScaleDecision::ScaleDown { from: 10, to: 3 }
        );
        assert_eq!(
            p.decide(0, 1, recent, now),
            ScaleDecision::Restore { from: 1, to: 3 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_queue_at_minimum_holds() {
        let pool = FakePool::new(3, 3, 20);
        let mut control = ControlLoop::new(policy(), pool.clone());

        let outcome = control.tick(0, Instant::now()).await;

        assert_eq!(outcome, TickOutcome::Held { current: 3, desired: 3 });
        assert!(pool.directives().is_empty());
        assert_eq!(pool.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn jump_in_depth_scales_straight_to_desired() {
        let pool = FakePool::new(3, 3, 20);
        let mut p = policy();
        p.target_items_per_worker = 5;
        let mut control = ControlLoop::new(p, pool.clone());

        assert_eq!(control.tick(0, Instant::now()).await, TickOutcome::Held { current: 3, desired: 3 });
        let outcome = control.tick(50, Instant::now()).await;

        assert_eq!(outcome, TickOutcome::Scaled { from: 3, to: 10 });
        assert_eq!(pool.directives(), vec!["scale_to(10)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn deep_queue_is_capped_at_maximum() {
        let pool = FakePool::new(3, 3, 20);
        let mut p = policy();
        p.target_items_per_worker = 5;
        let mut control = ControlLoop::new(p, pool.clone());

        control.tick(100, Instant::now()).await;
        assert_eq!(pool.count(), 20);

        control.tick(5_000, Instant::now() + Duration::from_secs(60)).await;
        assert_eq!(pool.count(), 20);
        assert_eq!(pool.directives(), vec!["scale_to(20)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn no_second_scale_up_inside_cooldown() {
        let pool = FakePool::new(3, 3, 20);
        let mut control = ControlLoop::new(policy(), pool.clone());
        let start = Instant::now();

        control.tick(5, start).await;
        let outcome = control.tick(15, start + Duration::from_secs(10)).await;
        assert_eq!(outcome, TickOutcome::Held { current: 5, desired: 15 });

        let outcome = control.tick(15, start + Duration::from_secs(30)).await;
        assert_eq!(outcome, TickOutcome::Scaled { from: 5, to: 15 });
        assert_eq!(pool.directives(), vec!["scale_to(5)", "scale_to(15)"]);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_drains_the_whole_delta() {
        let pool = FakePool::new(8, 3, 20);
        let mut control = ControlLoop::new(policy(), pool.clone());

        let outcome = control.tick(4, Instant::now()).await;

        assert_eq!(outcome, TickOutcome::Scaled { from: 8, to: 4 });
        assert_eq!(pool.directives(), vec!["drain_one"; 4]);
        assert_eq!(pool.count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_scale_down_keeps_progress_and_starts_cooldown() {
        let pool = FakePool::new(8, 3, 20);
        *pool.drain_budget.lock().unwrap() = Some(2);
        let mut control = ControlLoop::new(policy(), pool.clone());
        let start = Instant::now();

        let outcome = control.tick(4, start).await;

        assert_eq!(outcome, TickOutcome::Scaled { from: 8, to: 6 });
        assert_eq!(pool.count(), 6);
        assert_eq!(control.last_action(), Some(start));

        // Inside the scale-down cooldown nothing further is drained.
        let outcome = control.tick(4, start + Duration::from_secs(10)).await;
        assert_eq!(outcome, TickOutcome::Held { current: 6, desired: 4 });
        assert_eq!(pool.directives().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_failing_on_first_drain_is_a_failed_directive() {
        let pool = FakePool::new(8, 3, 20);
        *pool.drain_budget.lock().unwrap() = Some(0);
        let mut control = ControlLoop::new(policy(), pool.clone());

        let outcome = control.tick(4, Instant::now()).await;

        assert!(matches!(outcome, TickOutcome::DirectiveFailed(ScaleError::Unavailable(_))));
        assert_eq!(control.last_action(), None);
        assert_eq!(pool.count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_directive_is_retried_next_tick() {
        let pool = FakePool::new(3, 3, 20);
        pool.failing.store(true, Ordering::SeqCst);
        let mut control = ControlLoop::new(policy(), pool.clone());
        let start = Instant::now();

        let outcome = control.tick(12, start).await;
        assert!(matches!(outcome, TickOutcome::DirectiveFailed(_)));
        assert_eq!(control.last_action(), None);

        pool.failing.store(false, Ordering::SeqCst);
        let outcome = control.tick(12, start + Duration::from_secs(1)).await;
        assert_eq!(outcome, TickOutcome::Scaled { from: 3, to: 12 });
        assert_eq!(control.last_action(), Some(start + Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn pool_below_floor_is_restored_despite_cooldown() {
        let pool = FakePool::new(3, 3, 20);
        let mut control = ControlLoop::new(policy(), pool.clone());
        let start = Instant::now();

        control.tick(6, start).await;
        *pool.count.lock().unwrap() = 1;

        let outcome = control.tick(0, start + Duration::from_secs(1)).await;
        assert_eq!(outcome, TickOutcome::Scaled { from: 1, to: 3 });
        assert_eq!(control.last_action(), Some(start));
    }

    #[tokio::test(start_paused = true)]
    async fn scaling_is_broadcast() {
        let (tx, mut rx) = broadcast::channel(8);
        let pool = FakePool::new(3, 3, 20);
        let mut control = ControlLoop::new(policy(), pool).with_event_tx(tx);

        control.tick(9, Instant::now()).await;

        match rx.try_recv().unwrap() {
            WorkEvent::PoolScaled {
                from,
                to,
                queue_depth,
                ..
            } => assert_eq!((from, to, queue_depth), (3, 9, 9)),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
