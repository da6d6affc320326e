//! Given/when/then harness for aggregate behavior.
//!
//! Runs entirely in memory against an [`AggregateRoot`]: replay the given
//! history, execute one command, inspect the produced events and resulting
//! state. No node, store, or bus involved, which keeps domain tests fast
//! and deterministic.

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::error::ScenarioFailure;
use crate::event::StreamEvent;

/// The outcome of a scenario run.
#[derive(Debug)]
pub struct ScenarioRun<A: Aggregate> {
    /// State after the produced events were applied.
    pub state: A,
    /// The produced stream events, in emission order.
    pub produced: Vec<StreamEvent<A::Event>>,
    /// Stream version after the run.
    pub version: u64,
}

/// A given/when/then scenario for one aggregate type.
///
/// # Examples
///
/// ```
/// # use gridlane::{Aggregate, AggregateScenario, Emission};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// # struct Light { on: bool }
/// # #[derive(Clone)] struct Toggle;
/// # #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// # #[serde(tag = "type", content = "data")]
/// # enum LightEvent { Toggled }
/// # #[derive(Debug, thiserror::Error)] #[error("never")] struct Never;
/// # impl Aggregate for Light {
/// #     const AGGREGATE_TYPE: &'static str = "light";
/// #     type Command = Toggle;
/// #     type Event = LightEvent;
/// #     type Error = Never;
/// #     fn handle(&self, _: Toggle) -> Result<Vec<Emission<LightEvent>>, Never> {
/// #         Ok(vec![Emission::event(LightEvent::Toggled)])
/// #     }
/// #     fn apply(mut self, _: &LightEvent) -> Self { self.on = !self.on; self }
/// # }
/// let state = AggregateScenario::<Light>::new()
///     .given([LightEvent::Toggled])
///     .when(Toggle)
///     .then([LightEvent::Toggled])
///     .unwrap();
/// assert!(!state.on);
/// ```
pub struct AggregateScenario<A: Aggregate> {
    given: Vec<StreamEvent<A::Event>>,
    when: Option<A::Command>,
}

impl<A: Aggregate> AggregateScenario<A> {
    /// An empty scenario: no history, no command.
    pub fn new() -> Self {
        Self {
            given: Vec::new(),
            when: None,
        }
    }

    /// Append domain events to the given history.
    #[must_use]
    pub fn given(mut self, events: impl IntoIterator<Item = A::Event>) -> Self {
        self.given
            .extend(events.into_iter().map(StreamEvent::Domain));
        self
    }

    /// Append raw stream events (including scheduling markers) to the
    /// given history.
    #[must_use]
    pub fn given_stream(mut self, events: impl IntoIterator<Item = StreamEvent<A::Event>>) -> Self {
        self.given.extend(events);
        self
    }

    /// The command under test.
    #[must_use]
    pub fn when(mut self, command: A::Command) -> Self {
        self.when = Some(command);
        self
    }

    /// Execute the scenario, applying the produced events.
    ///
    /// # Errors
    ///
    /// [`ScenarioFailure::Rejected`] if the handler rejects the command,
    /// [`ScenarioFailure::MissingCommand`] if `when` was never called.
    pub fn run(self) -> Result<ScenarioRun<A>, ScenarioFailure> {
        let (mut root, command) = self.replay()?;
        let emissions = root
            .state()
            .handle(command)
            .map_err(|error| ScenarioFailure::Rejected(error.to_string()))?;
        let produced = root.expand_emissions(emissions);
        for event in &produced {
            root.replay(event);
        }
        Ok(ScenarioRun {
            state: root.state().clone(),
            produced,
            version: root.version(),
        })
    }

    /// Execute and compare the produced *domain* events to `expected`,
    /// returning the final state on a match.
    ///
    /// # Errors
    ///
    /// [`ScenarioFailure::Mismatch`] when the produced events differ, plus
    /// everything [`run`](AggregateScenario::run) can fail with.
    pub fn then(self, expected: impl IntoIterator<Item = A::Event>) -> Result<A, ScenarioFailure>
    where
        A::Event: PartialEq,
    {
        let run = self.run()?;
        let actual: Vec<&A::Event> = run
            .produced
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Domain(e) => Some(e),
                _ => None,
            })
            .collect();
        let expected: Vec<A::Event> = expected.into_iter().collect();

        let matches =
            actual.len() == expected.len() && actual.iter().zip(&expected).all(|(a, e)| **a == *e);
        if !matches {
            return Err(ScenarioFailure::Mismatch {
                expected: format!("{expected:?}"),
                actual: format!("{actual:?}"),
            });
        }
        Ok(run.state)
    }

    /// Execute expecting the handler to reject the command; returns the
    /// domain error.
    ///
    /// # Errors
    ///
    /// [`ScenarioFailure::UnexpectedSuccess`] if the command succeeds,
    /// [`ScenarioFailure::MissingCommand`] if `when` was never called.
    pub fn then_rejected(self) -> Result<A::Error, ScenarioFailure> {
        let (root, command) = self.replay()?;
        match root.state().handle(command) {
            Err(error) => Ok(error),
            Ok(emissions) => Err(ScenarioFailure::UnexpectedSuccess {
                produced: emissions.len(),
            }),
        }
    }

    fn replay(self) -> Result<(AggregateRoot<A>, A::Command), ScenarioFailure> {
        let command = self.when.ok_or(ScenarioFailure::MissingCommand)?;
        let mut root = AggregateRoot::<A>::new("scenario");
        for event in &self.given {
            root.replay(event);
        }
        Ok((root, command))
    }
}

impl<A: Aggregate> Default for AggregateScenario<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand, CounterEvent};
    use crate::event::ScheduledRecord;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn create_on_fresh_counter_matches_expectation() {
        let state = AggregateScenario::<Counter>::new()
            .when(CounterCommand::Create {
                name: "X".to_owned(),
            })
            .then([CounterEvent::Created {
                name: "X".to_owned(),
            }])
            .expect("scenario should match");
        assert_eq!(state.name.as_deref(), Some("X"));
    }

    #[test]
    fn given_history_feeds_the_handler() {
        let state = AggregateScenario::<Counter>::new()
            .given([
                CounterEvent::Created {
                    name: "X".to_owned(),
                },
                CounterEvent::Added { amount: 3 },
            ])
            .when(CounterCommand::Add { amount: 4 })
            .then([CounterEvent::Added { amount: 4 }])
            .expect("scenario should match");
        assert_eq!(state.value, 7);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let error = AggregateScenario::<Counter>::new()
            .given([CounterEvent::Created {
                name: "X".to_owned(),
            }])
            .when(CounterCommand::Create {
                name: "Y".to_owned(),
            })
            .then_rejected()
            .expect("rejection expected");
        assert!(error.to_string().contains("already created"));
    }

    #[test]
    fn mismatch_reports_both_sides() {
        let failure = AggregateScenario::<Counter>::new()
            .when(CounterCommand::Create {
                name: "X".to_owned(),
            })
            .then([CounterEvent::Added { amount: 1 }])
            .expect_err("events differ");
        assert!(matches!(failure, ScenarioFailure::Mismatch { .. }));
        assert!(failure.to_string().contains("Added"));
        assert!(failure.to_string().contains("Created"));
    }

    #[test]
    fn unexpected_success_counts_events() {
        let failure = AggregateScenario::<Counter>::new()
            .when(CounterCommand::Create {
                name: "X".to_owned(),
            })
            .then_rejected()
            .expect_err("create succeeds");
        assert!(matches!(
            failure,
            ScenarioFailure::UnexpectedSuccess { produced: 1 }
        ));
    }

    #[test]
    fn missing_command_is_reported() {
        let failure = AggregateScenario::<Counter>::new()
            .run()
            .expect_err("no command configured");
        assert!(matches!(failure, ScenarioFailure::MissingCommand));
    }

    #[test]
    fn scheduling_command_produces_a_wrapper() {
        let run = AggregateScenario::<Counter>::new()
            .given([CounterEvent::Created {
                name: "X".to_owned(),
            }])
            .when(CounterCommand::ScheduleReset {
                at: Utc::now() + chrono::Duration::hours(1),
            })
            .run()
            .expect("scenario runs");

        assert_eq!(run.produced.len(), 1);
        assert!(matches!(
            run.produced[0],
            StreamEvent::FutureEventScheduled(_)
        ));
        // The wrapper is bookkeeping; the inner event has not applied.
        assert_eq!(run.state.value, 0);
    }

    #[test]
    fn given_stream_supports_pending_schedules() {
        let future_event_id = Uuid::new_v4();
        let run = AggregateScenario::<Counter>::new()
            .given([CounterEvent::Created {
                name: "X".to_owned(),
            }])
            .given_stream([StreamEvent::FutureEventScheduled(ScheduledRecord {
                future_event_id,
                raise_at: Utc::now(),
                inner: CounterEvent::Reset,
            })])
            .when(CounterCommand::CancelResets)
            .run()
            .expect("scenario runs");

        assert_eq!(
            run.produced,
            vec![StreamEvent::FutureEventCanceled { future_event_id }]
        );
    }
}
