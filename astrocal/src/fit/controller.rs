//! Staged minimization and outlier-rejection control loop.
//!
//! Distortion and star-position parameters are partially degenerate, so a
//! cold joint step is poorly conditioned. The controller therefore warms the
//! engine up with three unconditional minimizations (distortions alone,
//! positions alone, then both) before entering the rejection loop:
//!
//! ```text
//! WarmupDistortions → WarmupPositions → WarmupJoint
//!     → RejectionLoop(1..=max_iterations) → Converged | Exhausted | Failed
//! ```
//!
//! In the loop every iteration asks for a joint minimization with clipping:
//!
//! | outcome                          | action                       |
//! |----------------------------------|------------------------------|
//! | `Converged`                      | stop, `Converged`            |
//! | `OutliersRemainButChi2Increased` | warn, next iteration         |
//! | `Failed`                         | stop, `Failed`               |
//! | `OtherUnexpected`                | stop, `Exhausted`            |
//!
//! Running out of iterations ends in `Exhausted`. Whatever the terminal state,
//! [`FitConvergenceController::run_and_emit`] still writes the residual tuple
//! and every exposure's transform.

use super::{Chi2, DistortionFitEngine, FitStage, MinimizeOutcome};
use crate::emit::{emit_results, EmissionReport, TransformSink};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Parameters of the rejection loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Upper bound on rejection-loop iterations
    pub max_iterations: usize,
    /// Clipping threshold in standard deviations of the per-term chi2
    pub rejection_sigma: f64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            rejection_sigma: 5.0,
        }
    }
}

/// How the fit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalState {
    /// No outliers remained to be removed
    Converged,
    /// Stopped without convergence; results are usable but not settled
    Exhausted,
    /// The engine could not solve the problem; results are not valid
    Failed,
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalState::Converged => "converged",
            TerminalState::Exhausted => "exhausted",
            TerminalState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where the controller is in its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    WarmupDistortions,
    WarmupPositions,
    WarmupJoint,
    /// 1-based iteration about to run
    RejectionLoop(usize),
    Done(TerminalState),
}

/// One minimization call and the chi2 that followed it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageRecord {
    pub stage: FitStage,
    pub outcome: MinimizeOutcome,
    pub chi2: Chi2,
}

/// History of a controller run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub terminal: TerminalState,
    pub warmup: Vec<StageRecord>,
    /// One record per rejection-loop iteration actually run
    pub iterations: Vec<StageRecord>,
}

impl ConvergenceReport {
    pub fn iterations_run(&self) -> usize {
        self.iterations.len()
    }

    /// Chi2 after the last minimization.
    pub fn final_chi2(&self) -> Option<Chi2> {
        self.iterations
            .last()
            .or_else(|| self.warmup.last())
            .map(|r| r.chi2)
    }
}

/// Drives a [`DistortionFitEngine`] from warm-up to a terminal state.
#[derive(Debug, Clone, Default)]
pub struct FitConvergenceController {
    config: ConvergenceConfig,
}

impl FitConvergenceController {
    pub fn new(config: ConvergenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    /// Run warm-up and the rejection loop on `engine`.
    pub fn run<E: DistortionFitEngine + ?Sized>(&self, engine: &mut E) -> ConvergenceReport {
        let mut warmup = Vec::with_capacity(3);
        let mut iterations = Vec::new();
        let mut phase = ControllerPhase::WarmupDistortions;

        let terminal = loop {
            phase = match phase {
                ControllerPhase::WarmupDistortions => {
                    warmup.push(self.warm_up(engine, FitStage::Distortions));
                    ControllerPhase::WarmupPositions
                }
                ControllerPhase::WarmupPositions => {
                    warmup.push(self.warm_up(engine, FitStage::Positions));
                    ControllerPhase::WarmupJoint
                }
                ControllerPhase::WarmupJoint => {
                    warmup.push(self.warm_up(engine, FitStage::DistortionsAndPositions));
                    ControllerPhase::RejectionLoop(1)
                }
                ControllerPhase::RejectionLoop(i) if i > self.config.max_iterations => {
                    log::warn!(
                        "Outlier rejection did not converge within {} iterations",
                        self.config.max_iterations
                    );
                    ControllerPhase::Done(TerminalState::Exhausted)
                }
                ControllerPhase::RejectionLoop(i) => {
                    let outcome = engine.minimize(
                        FitStage::DistortionsAndPositions,
                        Some(self.config.rejection_sigma),
                    );
                    let chi2 = engine.compute_chi2();
                    log::info!("Iteration {i}: {chi2}");
                    iterations.push(StageRecord {
                        stage: FitStage::DistortionsAndPositions,
                        outcome,
                        chi2,
                    });

                    match outcome {
                        MinimizeOutcome::Converged => {
                            log::info!("Fit converged after {i} iterations");
                            ControllerPhase::Done(TerminalState::Converged)
                        }
                        MinimizeOutcome::OutliersRemainButChi2Increased => {
                            log::warn!("Iteration {i}: chi2 increased after outlier removal, fit is oscillating");
                            ControllerPhase::RejectionLoop(i + 1)
                        }
                        MinimizeOutcome::Failed => {
                            log::error!("Iteration {i}: minimization failed");
                            ControllerPhase::Done(TerminalState::Failed)
                        }
                        MinimizeOutcome::OtherUnexpected(code) => {
                            log::error!("Iteration {i}: unexpected minimization status {code}, stopping");
                            ControllerPhase::Done(TerminalState::Exhausted)
                        }
                    }
                }
                ControllerPhase::Done(terminal) => break terminal,
            };
        };

        ConvergenceReport {
            terminal,
            warmup,
            iterations,
        }
    }

    /// [`Self::run`], then write the residual tuple to `tuple_path` and persist
    /// every exposure's corrected transform through `sink`.
    pub fn run_and_emit<E: DistortionFitEngine + ?Sized>(
        &self,
        engine: &mut E,
        tuple_path: &Path,
        sink: &mut dyn TransformSink,
    ) -> (ConvergenceReport, EmissionReport) {
        let report = self.run(engine);
        let emission = emit_results(&*engine, tuple_path, sink);
        (report, emission)
    }

    fn warm_up<E: DistortionFitEngine + ?Sized>(&self, engine: &mut E, stage: FitStage) -> StageRecord {
        let outcome = engine.minimize(stage, None);
        let chi2 = engine.compute_chi2();
        log::info!("Warm-up {stage}: {chi2}");
        if outcome == MinimizeOutcome::Failed {
            log::warn!("Warm-up {stage} minimization failed, continuing to outlier rejection");
        }
        StageRecord {
            stage,
            outcome,
            chi2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ExposureId;
    use crate::fit::{CorrectedWcs, EngineError};

    /// Engine replaying fixed loop outcomes; warm-up calls always converge.
    struct Replay {
        outcomes: Vec<MinimizeOutcome>,
        calls: Vec<(FitStage, Option<f64>)>,
    }

    impl DistortionFitEngine for Replay {
        fn minimize(&mut self, stage: FitStage, sigma: Option<f64>) -> MinimizeOutcome {
            self.calls.push((stage, sigma));
            match sigma {
                None => MinimizeOutcome::Converged,
                Some(_) => {
                    let n = self.calls.iter().filter(|(_, s)| s.is_some()).count();
                    self.outcomes[n - 1]
                }
            }
        }

        fn compute_chi2(&self) -> Chi2 {
            Chi2 {
                chi2: 100.0 / self.calls.len() as f64,
                ndof: 10,
            }
        }

        fn exposures(&self) -> Vec<ExposureId> {
            Vec::new()
        }

        fn produce_corrected_transform(&self, id: ExposureId) -> Result<CorrectedWcs, EngineError> {
            Err(EngineError::UnknownExposure(id))
        }

        fn write_residual_tuple(&self, _path: &Path) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[test]
    fn test_warmup_stage_order() {
        let mut engine = Replay {
            outcomes: vec![MinimizeOutcome::Converged],
            calls: Vec::new(),
        };
        let report = FitConvergenceController::default().run(&mut engine);

        assert_eq!(report.terminal, TerminalState::Converged);
        assert_eq!(
            engine.calls,
            vec![
                (FitStage::Distortions, None),
                (FitStage::Positions, None),
                (FitStage::DistortionsAndPositions, None),
                (FitStage::DistortionsAndPositions, Some(5.0)),
            ]
        );
        assert_eq!(report.warmup.len(), 3);
        assert_eq!(report.final_chi2().unwrap().chi2, 25.0);
    }

    #[test]
    fn test_zero_iterations_is_exhausted() {
        let mut engine = Replay {
            outcomes: Vec::new(),
            calls: Vec::new(),
        };
        let controller = FitConvergenceController::new(ConvergenceConfig {
            max_iterations: 0,
            ..Default::default()
        });
        let report = controller.run(&mut engine);
        assert_eq!(report.terminal, TerminalState::Exhausted);
        assert_eq!(report.iterations_run(), 0);
    }
}
