//! Correlation-scoped waiting over the published message stream.
//!
//! A [`MessageWaiter`] combines typed predicates into an AND/OR condition
//! tree and resolves once the tree is satisfied by the messages flowing on
//! the bus -- in any arrival order -- or fails at a hard deadline. The
//! [`CommandWaiter`] couples a waiter to a command submission: subscribe
//! first, send, then wait, optionally failing on any fault the command
//! produced.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::bus::{BusStream, MessageBus};
use crate::command::{CommandEnvelope, ConfirmationMode};
use crate::error::WaitError;
use crate::message::{Envelope, Fault};
use crate::node::DomainNode;

/// A predicate over a bus envelope.
type MessagePredicate = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Binary combinator tree over typed-message predicates.
///
/// Leaves are satisfied monotonically: once a matching message has been
/// observed, the leaf stays satisfied, which is what makes evaluation
/// independent of arrival order.
enum ConditionNode {
    Leaf {
        satisfied: bool,
        predicate: MessagePredicate,
    },
    And(Box<ConditionNode>, Box<ConditionNode>),
    Or(Box<ConditionNode>, Box<ConditionNode>),
}

impl ConditionNode {
    fn leaf(predicate: MessagePredicate) -> Self {
        Self::Leaf {
            satisfied: false,
            predicate,
        }
    }

    /// Feed one message to every leaf.
    fn observe(&mut self, envelope: &Envelope) {
        match self {
            Self::Leaf {
                satisfied,
                predicate,
            } => {
                if !*satisfied && predicate(envelope) {
                    *satisfied = true;
                }
            }
            Self::And(left, right) | Self::Or(left, right) => {
                left.observe(envelope);
                right.observe(envelope);
            }
        }
    }

    fn satisfied(&self) -> bool {
        match self {
            Self::Leaf { satisfied, .. } => *satisfied,
            Self::And(left, right) => left.satisfied() && right.satisfied(),
            Self::Or(left, right) => left.satisfied() || right.satisfied(),
        }
    }
}

/// A composable wait condition.
///
/// # Examples
///
/// ```
/// use gridlane::Condition;
///
/// struct StepA;
/// struct StepB;
/// struct StepC;
///
/// // A AND (B OR C)
/// let condition = Condition::of::<StepA>()
///     .and(Condition::of::<StepB>().or(Condition::of::<StepC>()));
/// # let _ = condition;
/// ```
pub struct Condition {
    node: ConditionNode,
}

impl Condition {
    /// Satisfied by any message of type `M`.
    pub fn of<M: Any + Send + Sync>() -> Self {
        Self::matching::<M>(|_| true)
    }

    /// Satisfied by a message of type `M` matching `predicate`.
    pub fn matching<M: Any + Send + Sync>(
        predicate: impl Fn(&M) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            node: ConditionNode::leaf(Box::new(move |envelope: &Envelope| {
                envelope.payload_as::<M>().is_some_and(|m| predicate(m))
            })),
        }
    }

    /// Both conditions must be satisfied.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self {
            node: ConditionNode::And(Box::new(self.node), Box::new(other.node)),
        }
    }

    /// Either condition suffices.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self {
            node: ConditionNode::Or(Box::new(self.node), Box::new(other.node)),
        }
    }
}

/// Everything observed during a resolved wait.
///
/// Contains *every* correlated message seen while waiting, not just the
/// ones that satisfied the final predicate, enabling post-hoc inspection
/// (e.g. finding a fault even when the expected message also arrived).
#[derive(Debug)]
pub struct WaitResult {
    /// All observed envelopes, in arrival order.
    pub all: Vec<Envelope>,
}

impl WaitResult {
    /// First observed message of type `M`.
    pub fn message_of<M: Any>(&self) -> Option<&M> {
        self.all.iter().find_map(|env| env.payload_as::<M>())
    }

    /// Every observed message of type `M`, in arrival order.
    pub fn messages_of<M: Any>(&self) -> Vec<&M> {
        self.all
            .iter()
            .filter_map(|env| env.payload_as::<M>())
            .collect()
    }

    /// Envelope of the first observed message of type `M`.
    pub fn envelope_of<M: Any>(&self) -> Option<&Envelope> {
        self.all.iter().find(|env| env.is::<M>())
    }

    /// Every observed fault.
    pub fn faults(&self) -> Vec<&Fault> {
        self.messages_of::<Fault>()
    }
}

/// Builder for a condition-tree wait over the bus.
///
/// All expectations are implicitly scoped to one correlation ID unless
/// [`any_correlation`](MessageWaiter::any_correlation) is used. Chained
/// `expect_*` calls AND onto the tree, `or_*` calls OR onto it; nested
/// grouping goes through [`Condition`].
pub struct MessageWaiter {
    bus: Arc<dyn MessageBus>,
    correlation: Option<Uuid>,
    timeout: Duration,
    condition: Option<ConditionNode>,
}

impl MessageWaiter {
    /// A waiter scoped to `correlation_id` with the given deadline.
    pub fn new(bus: Arc<dyn MessageBus>, correlation_id: Uuid, timeout: Duration) -> Self {
        Self {
            bus,
            correlation: Some(correlation_id),
            timeout,
            condition: None,
        }
    }

    /// Drop the correlation scope: observe messages of every correlation.
    #[must_use]
    pub fn any_correlation(mut self) -> Self {
        self.correlation = None;
        self
    }

    /// Replace the deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// AND: a message of type `M` must be observed.
    #[must_use]
    pub fn expect<M: Any + Send + Sync>(self) -> Self {
        self.expect_condition(Condition::of::<M>())
    }

    /// AND: a message of type `M` matching `predicate` must be observed.
    #[must_use]
    pub fn expect_where<M: Any + Send + Sync>(
        self,
        predicate: impl Fn(&M) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.expect_condition(Condition::matching::<M>(predicate))
    }

    /// OR: a message of type `M` alternatively satisfies the wait.
    #[must_use]
    pub fn or_expect<M: Any + Send + Sync>(self) -> Self {
        self.or_condition(Condition::of::<M>())
    }

    /// OR: a matching message of type `M` alternatively satisfies the wait.
    #[must_use]
    pub fn or_expect_where<M: Any + Send + Sync>(
        self,
        predicate: impl Fn(&M) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.or_condition(Condition::matching::<M>(predicate))
    }

    /// AND a composed condition onto the tree.
    #[must_use]
    pub fn expect_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(match self.condition {
            None => condition.node,
            Some(existing) => ConditionNode::And(Box::new(existing), Box::new(condition.node)),
        });
        self
    }

    /// OR a composed condition onto the tree.
    #[must_use]
    pub fn or_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(match self.condition {
            None => condition.node,
            Some(existing) => ConditionNode::Or(Box::new(existing), Box::new(condition.node)),
        });
        self
    }

    /// Subscribe now and return the active wait.
    ///
    /// Subscribing before triggering the awaited activity is what closes
    /// the race between sending a command and observing its effects.
    #[must_use]
    pub fn start(self) -> ActiveWait {
        ActiveWait {
            stream: self.bus.subscribe(),
            correlation: self.correlation,
            timeout: self.timeout,
            condition: self.condition,
            observed: Vec::new(),
        }
    }

    /// Subscribe and wait in one step.
    ///
    /// # Errors
    ///
    /// See [`ActiveWait::finish`].
    pub async fn wait(self) -> Result<WaitResult, WaitError> {
        self.start().finish().await
    }
}

/// A subscribed wait whose condition is being evaluated.
pub struct ActiveWait {
    stream: BusStream,
    correlation: Option<Uuid>,
    timeout: Duration,
    condition: Option<ConditionNode>,
    observed: Vec<Envelope>,
}

impl ActiveWait {
    /// Consume the stream until the condition resolves or the deadline
    /// passes.
    ///
    /// # Errors
    ///
    /// * [`WaitError::Timeout`] -- deadline passed; carries everything
    ///   observed so far.
    /// * [`WaitError::BusClosed`] -- the bus shut down mid-wait.
    pub async fn finish(self) -> Result<WaitResult, WaitError> {
        let ActiveWait {
            mut stream,
            correlation,
            timeout,
            condition,
            mut observed,
        } = self;

        // No expectations: resolve immediately.
        let Some(mut condition) = condition else {
            return Ok(WaitResult { all: observed });
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, stream.recv()).await;
            match next {
                Err(_elapsed) => {
                    return Err(WaitError::Timeout {
                        elapsed: timeout,
                        observed,
                    });
                }
                Ok(None) => return Err(WaitError::BusClosed),
                Ok(Some(envelope)) => {
                    if let Some(correlation) = correlation
                        && envelope.metadata.correlation_id != correlation
                    {
                        continue;
                    }
                    condition.observe(&envelope);
                    observed.push(envelope);
                    if condition.satisfied() {
                        return Ok(WaitResult { all: observed });
                    }
                }
            }
        }
    }
}

/// A command submission coupled to a wait on its observable effects.
///
/// Subscribes before sending, executes the command detached, then waits
/// for the expected messages of the command's correlation. By default any
/// fault referencing the command ID short-circuits the wait and is
/// re-raised as [`WaitError::CommandFailed`].
pub struct CommandWaiter<A: Aggregate> {
    node: DomainNode,
    envelope: CommandEnvelope<A::Command>,
    waiter: MessageWaiter,
    fail_on_fault: bool,
}

impl<A: Aggregate> CommandWaiter<A> {
    pub(crate) fn new(
        node: DomainNode,
        envelope: CommandEnvelope<A::Command>,
        timeout: Duration,
    ) -> Self {
        let waiter = MessageWaiter::new(node.bus(), envelope.correlation_id(), timeout);
        Self {
            node,
            envelope,
            waiter,
            fail_on_fault: true,
        }
    }

    /// AND: a message of type `M` must be observed.
    #[must_use]
    pub fn expect<M: Any + Send + Sync>(mut self) -> Self {
        self.waiter = self.waiter.expect::<M>();
        self
    }

    /// AND: a message of type `M` matching `predicate` must be observed.
    #[must_use]
    pub fn expect_where<M: Any + Send + Sync>(
        mut self,
        predicate: impl Fn(&M) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.waiter = self.waiter.expect_where::<M>(predicate);
        self
    }

    /// OR: a message of type `M` alternatively satisfies the wait.
    #[must_use]
    pub fn or_expect<M: Any + Send + Sync>(mut self) -> Self {
        self.waiter = self.waiter.or_expect::<M>();
        self
    }

    /// AND a composed condition onto the tree.
    #[must_use]
    pub fn expect_condition(mut self, condition: Condition) -> Self {
        self.waiter = self.waiter.expect_condition(condition);
        self
    }

    /// Replace the deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.waiter = self.waiter.timeout(timeout);
        self
    }

    /// Do not fail the wait when the command faults; faults then show up
    /// in the [`WaitResult`] like any other message.
    #[must_use]
    pub fn tolerate_faults(mut self) -> Self {
        self.fail_on_fault = false;
        self
    }

    /// Subscribe, send the command, and wait.
    ///
    /// # Errors
    ///
    /// * [`WaitError::CommandFailed`] -- fail-on-fault observed faults
    ///   referencing this command; carries the collected set.
    /// * [`WaitError::Timeout`] / [`WaitError::BusClosed`] -- see
    ///   [`ActiveWait::finish`].
    /// * [`WaitError::Submit`] -- the command never reached its lane.
    pub async fn execute(self) -> Result<WaitResult, WaitError> {
        let CommandWaiter {
            node,
            envelope,
            mut waiter,
            fail_on_fault,
        } = self;
        let command_id = envelope.command_id;

        if fail_on_fault {
            // An implicit alternative branch: any fault blamed on this
            // command resolves the wait.
            waiter = waiter.or_expect_where::<Fault>(move |fault| fault.message_id == command_id);
        }

        let active = waiter.start();
        node.execute::<A>(envelope, ConfirmationMode::None)
            .await
            .map_err(|error| WaitError::Submit(error.to_string()))?;
        let result = active.finish().await?;

        if fail_on_fault {
            let faults: Vec<Fault> = result
                .all
                .iter()
                .filter_map(|env| env.payload_as::<Fault>())
                .filter(|fault| fault.message_id == command_id)
                .cloned()
                .collect();
            if !faults.is_empty() {
                return Err(WaitError::CommandFailed { command_id, faults });
            }
        }

        Ok(result)
    }
}
