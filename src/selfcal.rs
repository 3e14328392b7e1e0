//! The self-calibration loop.
//!
//! Each round images the current measurement set in fill-model mode, solves
//! for gains against the model, optionally archives the solutions, then applies
//! them into a new measurement set which becomes the next round's input.
//!
//! ```text
//! Initial -> Imaged -> Calibrated [-> Archived] -> Applied -> (Imaged | Done)
//! ```

use std::fmt::{self, Debug, Display};

use log::info;

use crate::{error::PipelineError, stage::StageSpec};

/// Logical name of the image made in round `round`
pub fn image_name(round: u32) -> String {
    format!("selfcal_image_iter_{round}")
}

/// Logical name of the measurement set written by round `round`
pub fn ms_name(round: u32) -> String {
    format!("selfcal_ms_iter_{round}")
}

/// Logical name of the archived copy of round `round`'s solutions
pub fn solution_archive_name(round: u32) -> String {
    format!("solution_iter_{round}")
}

/// Where the loop is. Rounds are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfCalState {
    /// nothing done yet
    Initial,
    /// the model of this round is in MODEL_DATA
    Imaged(u32),
    /// the stable solution file holds this round's gains
    Calibrated(u32),
    /// this round's gains were copied aside
    Archived(u32),
    /// this round's measurement set has been written
    Applied(u32),
    /// every round is finished
    Done,
}

/// One step of the loop, run as one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfCalStep {
    /// image in fill-model mode
    Image(u32),
    /// gaincal against the model
    Solve(u32),
    /// copy the solution file aside
    Archive(u32),
    /// applycal into a new measurement set
    Apply(u32),
}

impl SelfCalStep {
    /// Round this step belongs to
    pub fn round(&self) -> u32 {
        match *self {
            Self::Image(r) | Self::Solve(r) | Self::Archive(r) | Self::Apply(r) => r,
        }
    }

    /// Stage name, e.g. `selfcal_solve_iter_2`
    pub fn stage_name(&self) -> String {
        let kind = match self {
            Self::Image(_) => "image",
            Self::Solve(_) => "solve",
            Self::Archive(_) => "archive",
            Self::Apply(_) => "apply",
        };
        format!("selfcal_{kind}_iter_{}", self.round())
    }
}

impl Display for SelfCalStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stage_name())
    }
}

/// Builds the stage for one step of the loop.
pub trait SelfCalStages: Debug {
    /// The stage running `step` on the measurement set registered as
    /// `current_ms`.
    ///
    /// # Errors
    ///
    /// any [`PipelineError`] raised while building
    fn stage(&self, step: SelfCalStep, current_ms: &str) -> Result<StageSpec, PipelineError>;
}

/// Bounded image / solve / apply controller.
#[derive(Debug)]
pub struct SelfCalLoop {
    input: String,
    rounds: u32,
    archive: bool,
    state: SelfCalState,
    current_ms: String,
    stages: Box<dyn SelfCalStages>,
}

impl SelfCalLoop {
    /// A loop of `rounds` rounds starting from the measurement set registered
    /// as `input`.
    pub fn new(
        input: impl Into<String>,
        rounds: u32,
        archive: bool,
        stages: Box<dyn SelfCalStages>,
    ) -> Self {
        let input = input.into();
        Self {
            current_ms: input.clone(),
            input,
            rounds,
            archive,
            state: if rounds == 0 {
                SelfCalState::Done
            } else {
                SelfCalState::Initial
            },
            stages,
        }
    }

    /// Number of rounds
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Current state
    pub fn state(&self) -> SelfCalState {
        self.state
    }

    /// Logical name of the measurement set the next step works on.
    pub fn current_ms(&self) -> &str {
        &self.current_ms
    }

    /// Logical name of the loop's result once it's done. This is the input
    /// itself when there are no rounds.
    pub fn output(&self) -> String {
        if self.rounds == 0 {
            self.input.clone()
        } else {
            ms_name(self.rounds)
        }
    }

    /// The step that runs next, `None` when done.
    pub fn next_step(&self) -> Option<SelfCalStep> {
        match self.state {
            SelfCalState::Initial => Some(SelfCalStep::Image(1)),
            SelfCalState::Imaged(r) => Some(SelfCalStep::Solve(r)),
            SelfCalState::Calibrated(r) if self.archive => Some(SelfCalStep::Archive(r)),
            SelfCalState::Calibrated(r) | SelfCalState::Archived(r) => Some(SelfCalStep::Apply(r)),
            SelfCalState::Applied(r) => Some(SelfCalStep::Image(r + 1)),
            SelfCalState::Done => None,
        }
    }

    /// Record that the next step finished.
    fn advance(&mut self) {
        self.state = match self.next_step() {
            Some(SelfCalStep::Image(r)) => SelfCalState::Imaged(r),
            Some(SelfCalStep::Solve(r)) => SelfCalState::Calibrated(r),
            Some(SelfCalStep::Archive(r)) => SelfCalState::Archived(r),
            Some(SelfCalStep::Apply(r)) => {
                self.current_ms = ms_name(r);
                if r >= self.rounds {
                    SelfCalState::Done
                } else {
                    SelfCalState::Applied(r)
                }
            }
            None => SelfCalState::Done,
        };
    }

    /// Every step the loop will take, in order.
    pub fn steps(&self) -> Vec<SelfCalStep> {
        let mut steps = vec![];
        for r in 1..=self.rounds {
            steps.push(SelfCalStep::Image(r));
            steps.push(SelfCalStep::Solve(r));
            if self.archive {
                steps.push(SelfCalStep::Archive(r));
            }
            steps.push(SelfCalStep::Apply(r));
        }
        steps
    }

    /// Run the remaining steps, handing each stage to `execute`, and return
    /// the logical name of the last applied measurement set.
    ///
    /// # Errors
    ///
    /// The first error from building or executing a stage. The loop stays in
    /// the state before the failed step.
    pub fn run<F>(&mut self, mut execute: F) -> Result<String, PipelineError>
    where
        F: FnMut(StageSpec) -> Result<(), PipelineError>,
    {
        while let Some(step) = self.next_step() {
            if let SelfCalStep::Image(r) = step {
                info!("self-cal round {r} of {}", self.rounds);
            }
            let stage = self.stages.stage(step, &self.current_ms)?;
            execute(stage)?;
            self.advance();
        }
        Ok(self.current_ms.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{ArtifactKind, OutputDecl};
    use std::{cell::RefCell, rc::Rc};

    /// Records which step was built on which measurement set.
    #[derive(Debug, Default)]
    struct Recorder {
        built: Rc<RefCell<Vec<(String, String)>>>,
    }

    impl SelfCalStages for Recorder {
        fn stage(&self, step: SelfCalStep, current_ms: &str) -> Result<StageSpec, PipelineError> {
            self.built
                .borrow_mut()
                .push((step.stage_name(), current_ms.to_string()));
            let outputs = match step {
                SelfCalStep::Apply(r) => vec![OutputDecl::new(
                    ms_name(r),
                    format!("/tmp/cal_iter_{r}.ms"),
                    ArtifactKind::MeasurementSet,
                )],
                _ => vec![],
            };
            Ok(StageSpec::new(step.stage_name(), &[current_ms], outputs, |_| {
                unreachable!()
            }))
        }
    }

    fn recorder_loop(rounds: u32, archive: bool) -> (SelfCalLoop, Rc<RefCell<Vec<(String, String)>>>) {
        let recorder = Recorder::default();
        let built = recorder.built.clone();
        (
            SelfCalLoop::new("flagged_ms", rounds, archive, Box::new(recorder)),
            built,
        )
    }

    #[test]
    fn zero_rounds_returns_the_input() {
        let (mut selfcal, built) = recorder_loop(0, false);
        assert_eq!(selfcal.state(), SelfCalState::Done);
        assert_eq!(selfcal.output(), "flagged_ms");
        assert_eq!(selfcal.run(|_| Ok(())).unwrap(), "flagged_ms");
        assert!(built.borrow().is_empty());
        assert!(selfcal.steps().is_empty());
    }

    #[test]
    fn three_rounds_chain_their_measurement_sets() {
        let (mut selfcal, built) = recorder_loop(3, false);
        let mut executed = vec![];
        let output = selfcal
            .run(|stage| {
                executed.push(stage.name().to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(output, "selfcal_ms_iter_3");
        assert_eq!(output, selfcal.output());
        assert_eq!(selfcal.state(), SelfCalState::Done);
        assert_eq!(executed.len(), 9);

        let built = built.borrow();
        // each round reads the previous round's output
        let applies: Vec<_> = built
            .iter()
            .filter(|(name, _)| name.starts_with("selfcal_apply"))
            .map(|(_, ms)| ms.as_str())
            .collect();
        assert_eq!(applies, ["flagged_ms", "selfcal_ms_iter_1", "selfcal_ms_iter_2"]);
        assert_eq!(built[3], ("selfcal_image_iter_2".to_string(), "selfcal_ms_iter_1".to_string()));
        let names: Vec<_> = selfcal.steps().iter().map(SelfCalStep::stage_name).collect();
        assert_eq!(names, executed);
    }

    #[test]
    fn archive_step_follows_each_solve() {
        let (mut selfcal, _) = recorder_loop(2, true);
        let mut executed = vec![];
        selfcal
            .run(|stage| {
                executed.push(stage.name().to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(
            executed,
            [
                "selfcal_image_iter_1",
                "selfcal_solve_iter_1",
                "selfcal_archive_iter_1",
                "selfcal_apply_iter_1",
                "selfcal_image_iter_2",
                "selfcal_solve_iter_2",
                "selfcal_archive_iter_2",
                "selfcal_apply_iter_2",
            ]
        );
    }

    #[test]
    fn failure_stops_the_loop() {
        let (mut selfcal, built) = recorder_loop(3, false);
        let result = selfcal.run(|stage| {
            if stage.name() == "selfcal_solve_iter_2" {
                Err(PipelineError::Cancelled)
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(selfcal.state(), SelfCalState::Imaged(2));
        assert_eq!(selfcal.current_ms(), "selfcal_ms_iter_1");
        assert_eq!(built.borrow().len(), 5);
    }

    #[test]
    fn steps_name_their_round() {
        assert_eq!(SelfCalStep::Solve(2).stage_name(), "selfcal_solve_iter_2");
        assert_eq!(SelfCalStep::Apply(1).to_string(), "selfcal_apply_iter_1");
        assert_eq!(image_name(3), "selfcal_image_iter_3");
        assert_eq!(solution_archive_name(1), "solution_iter_1");
    }
}
