//! Thread-backed optimizer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use bytes::Bytes;

use super::{NullCallback, Optimizer, OptimizerCallback};
use crate::error::{RemoteFitError, Result};
use crate::protocol::{ParameterInfo, ProgressUpdate, ResultInfo};

/// A fitting algorithm run by [`BackgroundOptimizer`].
pub trait Solver: Send + Sync + 'static {
    /// Run one fit to completion.
    ///
    /// Should check [`SolveContext::should_stop`] between iterations and
    /// return a `Stopped` result when it is set. An error becomes a
    /// `Failed` result.
    fn solve(&self, model: &[u8], fit_params: &[u8], ctx: &SolveContext) -> Result<ResultInfo>;
}

type SharedCallbacks = Arc<RwLock<Arc<dyn OptimizerCallback>>>;

/// Handle given to a running solver
pub struct SolveContext {
    stop: Arc<AtomicBool>,
    callbacks: SharedCallbacks,
}

impl SolveContext {
    /// Whether a stop was requested
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Emit a status line
    pub fn text(&self, text: &str) {
        if let Some(cb) = current(&self.callbacks) {
            cb.text_output(text);
        }
    }

    /// Emit parameter metadata
    pub fn parameter_info(&self, info: ParameterInfo) {
        if let Some(cb) = current(&self.callbacks) {
            cb.parameter_info(info);
        }
    }

    /// Emit a progress snapshot
    pub fn progress(&self, update: ProgressUpdate) {
        if let Some(cb) = current(&self.callbacks) {
            cb.progress(update);
        }
    }
}

fn current(callbacks: &SharedCallbacks) -> Option<Arc<dyn OptimizerCallback>> {
    callbacks.read().ok().map(|cb| Arc::clone(&*cb))
}

/// Runs a [`Solver`] on a dedicated OS thread.
pub struct BackgroundOptimizer<S: Solver> {
    solver: Arc<S>,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    callbacks: SharedCallbacks,
}

impl<S: Solver> BackgroundOptimizer<S> {
    /// Create an idle optimizer with no subscriber
    pub fn new(solver: S) -> Self {
        Self {
            solver: Arc::new(solver),
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(RwLock::new(Arc::new(NullCallback))),
        }
    }

    /// Get the solver
    pub fn solver(&self) -> &S {
        &self.solver
    }
}

impl<S: Solver> Optimizer for BackgroundOptimizer<S> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn start(&self, model: Bytes, fit_params: Bytes) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RemoteFitError::Optimizer(
                "a fit is already running".to_string(),
            ));
        }
        self.stop.store(false, Ordering::Release);

        let solver = Arc::clone(&self.solver);
        let running = Arc::clone(&self.running);
        let ctx = SolveContext {
            stop: Arc::clone(&self.stop),
            callbacks: Arc::clone(&self.callbacks),
        };

        let spawned = thread::Builder::new()
            .name("remotefit-optimizer".to_string())
            .spawn(move || {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| solver.solve(&model, &fit_params, &ctx)));
                let result = match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Solver failed");
                        ResultInfo::failed(e.to_string())
                    },
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        tracing::warn!(panic = %msg, "Solver panicked");
                        ResultInfo::failed(format!("solver panicked: {msg}"))
                    },
                };

                if let Some(cb) = current(&ctx.callbacks) {
                    cb.fitting_ended(result);
                }
                running.store(false, Ordering::Release);
            });

        if let Err(e) = spawned {
            self.running.store(false, Ordering::Release);
            return Err(RemoteFitError::Io(e));
        }
        Ok(())
    }

    fn request_stop(&self) {
        if self.is_running() {
            self.stop.store(true, Ordering::Release);
        }
    }

    fn subscribe(&self, callbacks: Arc<dyn OptimizerCallback>) {
        if let Ok(mut slot) = self.callbacks.write() {
            *slot = callbacks;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use crate::protocol::TerminationReason;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        results: Mutex<Vec<ResultInfo>>,
    }

    impl OptimizerCallback for Recorder {
        fn text_output(&self, text: &str) {
            self.events.lock().unwrap().push(format!("text:{text}"));
        }
        fn parameter_info(&self, _info: ParameterInfo) {
            self.events.lock().unwrap().push("parameters".to_string());
        }
        fn progress(&self, update: ProgressUpdate) {
            self.events
                .lock()
                .unwrap()
                .push(format!("progress:{}", update.generation));
        }
        fn fitting_ended(&self, result: ResultInfo) {
            self.events.lock().unwrap().push("ended".to_string());
            self.results.lock().unwrap().push(result);
        }
    }

    /// Counts generations until stopped or the budget runs out
    struct Counting {
        generations: u64,
        pause: Duration,
    }

    impl Solver for Counting {
        fn solve(&self, _model: &[u8], _params: &[u8], ctx: &SolveContext) -> Result<ResultInfo> {
            ctx.parameter_info(ParameterInfo::default());
            for generation in 1..=self.generations {
                if ctx.should_stop() {
                    return Ok(ResultInfo {
                        best_values: vec![],
                        fom: Some(1.0),
                        generations: generation - 1,
                        termination: TerminationReason::Stopped,
                    });
                }
                ctx.progress(ProgressUpdate {
                    generation,
                    ..Default::default()
                });
                thread::sleep(self.pause);
            }
            Ok(ResultInfo {
                best_values: vec![],
                fom: Some(0.5),
                generations: self.generations,
                termination: TerminationReason::MaxGenerations,
            })
        }
    }

    struct Failing;

    impl Solver for Failing {
        fn solve(&self, _model: &[u8], _params: &[u8], _ctx: &SolveContext) -> Result<ResultInfo> {
            Err(RemoteFitError::Optimizer("bad model".to_string()))
        }
    }

    struct Panicking;

    impl Solver for Panicking {
        fn solve(&self, _model: &[u8], _params: &[u8], _ctx: &SolveContext) -> Result<ResultInfo> {
            panic!("boom");
        }
    }

    fn wait_idle(opt: &dyn Optimizer) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while opt.is_running() {
            assert!(Instant::now() < deadline, "optimizer did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_run_to_completion() {
        let opt = BackgroundOptimizer::new(Counting {
            generations: 3,
            pause: Duration::ZERO,
        });
        let recorder = Arc::new(Recorder::default());
        opt.subscribe(recorder.clone());

        opt.start(Bytes::new(), Bytes::new()).unwrap();
        wait_idle(&opt);

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["parameters", "progress:1", "progress:2", "progress:3", "ended"]
        );
        let results = recorder.results.lock().unwrap();
        assert_eq!(results[0].termination, TerminationReason::MaxGenerations);
    }

    #[test]
    fn test_double_start_rejected() {
        let opt = BackgroundOptimizer::new(Counting {
            generations: 1000,
            pause: Duration::from_millis(2),
        });
        opt.start(Bytes::new(), Bytes::new()).unwrap();
        assert!(opt.is_running());
        assert!(opt.start(Bytes::new(), Bytes::new()).is_err());

        opt.request_stop();
        wait_idle(&opt);
    }

    #[test]
    fn test_request_stop() {
        let opt = BackgroundOptimizer::new(Counting {
            generations: 10_000,
            pause: Duration::from_millis(1),
        });
        let recorder = Arc::new(Recorder::default());
        opt.subscribe(recorder.clone());

        opt.start(Bytes::new(), Bytes::new()).unwrap();
        thread::sleep(Duration::from_millis(20));
        opt.request_stop();
        wait_idle(&opt);

        let results = recorder.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].termination, TerminationReason::Stopped);
    }

    #[test]
    fn test_request_stop_when_idle_is_noop() {
        let opt = BackgroundOptimizer::new(Counting {
            generations: 2,
            pause: Duration::ZERO,
        });
        opt.request_stop();

        // A stale stop must not cancel the next run
        let recorder = Arc::new(Recorder::default());
        opt.subscribe(recorder.clone());
        opt.start(Bytes::new(), Bytes::new()).unwrap();
        wait_idle(&opt);
        assert_eq!(
            recorder.results.lock().unwrap()[0].termination,
            TerminationReason::MaxGenerations
        );
    }

    #[test]
    fn test_solver_error_still_ends_fit() {
        let opt = BackgroundOptimizer::new(Failing);
        let recorder = Arc::new(Recorder::default());
        opt.subscribe(recorder.clone());

        opt.start(Bytes::new(), Bytes::new()).unwrap();
        wait_idle(&opt);

        let results = recorder.results.lock().unwrap();
        assert!(!results[0].is_success());
    }

    #[test]
    fn test_solver_panic_still_ends_fit() {
        let opt = BackgroundOptimizer::new(Panicking);
        let recorder = Arc::new(Recorder::default());
        opt.subscribe(recorder.clone());

        opt.start(Bytes::new(), Bytes::new()).unwrap();
        wait_idle(&opt);

        let results = recorder.results.lock().unwrap();
        assert_eq!(
            results[0].termination,
            TerminationReason::Failed("solver panicked: boom".to_string())
        );
        // Usable again afterwards
        drop(results);
        opt.start(Bytes::new(), Bytes::new()).unwrap();
        wait_idle(&opt);
    }
}
