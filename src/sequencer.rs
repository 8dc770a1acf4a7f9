//! Batched command sequencing with wait gates and abort.
//!
//! A [`CommandSequence`] is an ordered list of command batches, optionally
//! separated by [`WaitGate`]s.  The [`Sequencer`] sends batches back to back
//! until it reaches a gate, then holds the sequence until the gate's
//! condition holds on a heartbeat tick.  Gates are plain data so a sequence
//! can be inspected before it is run.
//!
//! ```text
//! Idle -> SendingBatch -> Waiting -> ReadyToAdvance -> SendingBatch -> ... -> Completed
//!   \__________ abort (any non-terminal state) __________________________-> Aborted
//!   \__________ write failure ___________________________________________-> Failed
//! ```
//!
//! A failed write is never retried: a repeated motion command could move an
//! axis twice.  Gates have no timeout; a gate that never opens holds its
//! sequence until it is aborted.

use std::collections::VecDeque;

use async_trait::async_trait;
use log::{debug, error, info};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::command::{Command, CommandBatch};
use crate::transport::TransportError;
use crate::tree::{truthy, PathError, StateView, TopicPath};
use crate::types::InstanceId;

pub type SequenceId = u64;

/// Something that accepts command batches.
#[async_trait]
pub trait CommandSink: Send {
    /// Writes `batch` as one message.
    async fn submit(&mut self, batch: &CommandBatch) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The value at the path is present and truthy.
    Truthy(TopicPath),
    /// The value at the path equals the given value.
    Equals(TopicPath, Value),
}

impl Condition {
    pub fn holds(&self, state: &dyn StateView) -> bool {
        match self {
            Condition::Truthy(path) => truthy(state.lookup(path)),
            Condition::Equals(path, expected) => state.lookup(path) == Some(expected),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitGate {
    pub condition: Condition,
    /// What the gate waits for, e.g. `axis 2 homed`.
    pub context: String,
}

impl WaitGate {
    pub fn new(condition: Condition, context: impl Into<String>) -> Self {
        Self {
            condition,
            context: context.into(),
        }
    }

    /// Waits until `axis` reports homed.
    pub fn axis_homed(axis: usize) -> Self {
        let path = TopicPath::status(["motion", "axis"]).child(axis).child("homed");
        Self::new(Condition::Truthy(path), format!("axis {} homed", axis))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Batch(CommandBatch),
    Wait(WaitGate),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSequence {
    steps: Vec<Step>,
}

impl CommandSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a batch; empty batches are skipped.
    pub fn batch(mut self, batch: impl Into<CommandBatch>) -> Self {
        self.push_batch(batch);
        self
    }

    pub fn wait(mut self, gate: WaitGate) -> Self {
        self.push_wait(gate);
        self
    }

    pub fn push_batch(&mut self, batch: impl Into<CommandBatch>) {
        let batch = batch.into();
        if !batch.is_empty() {
            self.steps.push(Step::Batch(batch));
        }
    }

    /// Appends each command as a batch of its own.
    pub fn push_each(&mut self, commands: impl IntoIterator<Item = Command>) {
        for command in commands {
            self.push_batch(CommandBatch::single(command));
        }
    }

    pub fn push_wait(&mut self, gate: WaitGate) {
        self.steps.push(Step::Wait(gate));
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn batch_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Step::Batch(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SequenceState {
    Idle,
    /// Writing the batch with this (zero based) batch number.
    SendingBatch(usize),
    /// Holding before the batch with this number.
    Waiting(usize),
    ReadyToAdvance(usize),
    Completed,
    Aborted,
    Failed(String),
}

impl SequenceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SequenceState::Completed | SequenceState::Aborted | SequenceState::Failed(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error("no command service available")]
    NoCommandService,
    #[error("machine state '{0}' is not available")]
    MissingState(String),
    #[error("unknown axis '{0}'")]
    UnknownAxis(char),
    #[error("command submission failed: {0}")]
    Submit(String),
    #[error("sequence was dropped before it finished")]
    Dropped,
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Caller side of a started sequence.
#[derive(Debug)]
pub struct SequenceHandle {
    id: SequenceId,
    state: watch::Receiver<SequenceState>,
}

impl SequenceHandle {
    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn state(&self) -> SequenceState {
        self.state.borrow().clone()
    }

    /// Waits for the sequence to end.  Completion and abort are both normal
    /// outcomes; a failed write is returned as an error.
    pub async fn finished(mut self) -> Result<SequenceState, SequenceError> {
        loop {
            let state = self.state.borrow_and_update().clone();
            match state {
                SequenceState::Failed(reason) => return Err(SequenceError::Submit(reason)),
                state if state.is_terminal() => return Ok(state),
                _ => {}
            }
            if self.state.changed().await.is_err() {
                let state = self.state.borrow().clone();
                return match state {
                    SequenceState::Failed(reason) => Err(SequenceError::Submit(reason)),
                    state if state.is_terminal() => Ok(state),
                    _ => Err(SequenceError::Dropped),
                };
            }
        }
    }
}

struct Running {
    id: SequenceId,
    steps: VecDeque<Step>,
    next_batch: usize,
    gate_open: bool,
    state: watch::Sender<SequenceState>,
}

impl Running {
    fn set(&self, state: SequenceState) {
        self.state.send_replace(state);
    }

    fn current(&self) -> SequenceState {
        self.state.borrow().clone()
    }
}

/// Runs the sequences of one machine, one at a time in submission order.
#[derive(Default)]
pub struct Sequencer {
    next_id: SequenceId,
    queue: VecDeque<Running>,
    finished: Vec<(SequenceId, SequenceState)>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `sequence` behind any sequence still running.
    pub fn enqueue(&mut self, sequence: CommandSequence) -> SequenceHandle {
        self.next_id += 1;
        let id = self.next_id;
        let (tx, rx) = watch::channel(SequenceState::Idle);
        debug!(
            "Queued sequence {} ({} batches, {} steps)",
            id,
            sequence.batch_count(),
            sequence.steps.len()
        );
        self.queue.push_back(Running {
            id,
            steps: sequence.steps.into(),
            next_batch: 0,
            gate_open: false,
            state: tx,
        });
        SequenceHandle { id, state: rx }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// State of the sequence currently at the head of the queue.
    pub fn active(&self) -> Option<(SequenceId, SequenceState)> {
        self.queue.front().map(|r| (r.id, r.current()))
    }

    /// Sequences that reached a terminal state since the last call.
    pub fn take_finished(&mut self) -> Vec<(SequenceId, SequenceState)> {
        std::mem::take(&mut self.finished)
    }

    /// Checks the gate the active sequence is waiting on.  Called once per
    /// heartbeat tick.
    pub fn evaluate(&mut self, state: &dyn StateView) {
        let Some(running) = self.queue.front_mut() else {
            return;
        };
        if running.gate_open {
            return;
        }
        if let Some(Step::Wait(gate)) = running.steps.front() {
            if gate.condition.holds(state) {
                debug!("Sequence {}: {} reached", running.id, gate.context);
                running.gate_open = true;
                running.set(SequenceState::ReadyToAdvance(running.next_batch));
            }
        }
    }

    /// Sends every batch that is free to go, until a closed gate or the end
    /// of the queue.
    pub async fn pump(&mut self, mut sink: Option<&mut dyn CommandSink>) -> Result<(), SequenceError> {
        loop {
            let Some(running) = self.queue.front_mut() else {
                return Ok(());
            };
            let batch = match running.steps.front() {
                None => {
                    self.finish_front(SequenceState::Completed);
                    continue;
                }
                Some(Step::Wait(_)) => {
                    if running.gate_open {
                        running.gate_open = false;
                        running.steps.pop_front();
                        continue;
                    }
                    let waiting = SequenceState::Waiting(running.next_batch);
                    if running.current() != waiting {
                        running.set(waiting);
                    }
                    return Ok(());
                }
                Some(Step::Batch(batch)) => batch.clone(),
            };

            let number = running.next_batch;
            running.set(SequenceState::SendingBatch(number));
            let result = match sink.as_deref_mut() {
                Some(sink) => sink
                    .submit(&batch)
                    .await
                    .map_err(|e| SequenceError::Submit(e.to_string())),
                None => Err(SequenceError::NoCommandService),
            };
            if let Err(e) = result {
                error!("Sequence batch {} failed: {}", number, e);
                self.fail_all(&e.to_string());
                return Err(e);
            }
            if let Some(running) = self.queue.front_mut() {
                running.steps.pop_front();
                running.next_batch += 1;
            }
        }
    }

    /// Stops every axis right away, then drops the active and all queued
    /// sequences.  Aborting is always allowed, with or without a sequence.
    pub async fn abort(
        &mut self,
        sink: Option<&mut dyn CommandSink>,
        axes: usize,
    ) -> Result<(), SequenceError> {
        let stop = CommandBatch::emergency_stop(axes);
        let result = match sink {
            Some(sink) => sink
                .submit(&stop)
                .await
                .map_err(|e| SequenceError::Submit(e.to_string())),
            None => Err(SequenceError::NoCommandService),
        };
        let dropped = self.queue.len();
        while !self.queue.is_empty() {
            self.finish_front(SequenceState::Aborted);
        }
        info!("Aborted {} sequence(s), stopped {} axes", dropped, axes);
        result
    }

    fn finish_front(&mut self, state: SequenceState) {
        if let Some(running) = self.queue.pop_front() {
            running.set(state.clone());
            self.finished.push((running.id, state));
        }
    }

    fn fail_all(&mut self, reason: &str) {
        self.finish_front(SequenceState::Failed(reason.to_string()));
        while !self.queue.is_empty() {
            self.finish_front(SequenceState::Failed(format!(
                "an earlier sequence failed: {}",
                reason
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::tree::AttributeTree;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        writes: Vec<CommandBatch>,
        fail: bool,
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn submit(&mut self, batch: &CommandBatch) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Closed);
            }
            self.writes.push(batch.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Mirror {
        tree: AttributeTree,
    }

    impl StateView for Mirror {
        fn lookup(&self, path: &TopicPath) -> Option<&Value> {
            self.tree.get(path.segments())
        }
    }

    fn exec(code: &str) -> Command {
        Command::TaskExecute {
            code: code.to_string(),
        }
    }

    #[tokio::test]
    async fn batches_without_gates_are_sent_in_order() {
        let mut sequencer = Sequencer::new();
        let mut sink = RecordingSink::default();
        let handle = sequencer.enqueue(
            CommandSequence::new()
                .batch(vec![exec("G0 X1")])
                .batch(vec![exec("G0 X2"), exec("G0 Y2")])
                .batch(vec![exec("G0 X3")]),
        );

        sequencer.pump(Some(&mut sink)).await.unwrap();

        assert_eq!(sink.writes.len(), 3);
        assert_eq!(sink.writes[0].commands(), &[exec("G0 X1")]);
        assert_eq!(sink.writes[1].len(), 2);
        assert_eq!(sink.writes[2].commands(), &[exec("G0 X3")]);
        assert!(sequencer.is_idle());
        assert_eq!(handle.finished().await.unwrap(), SequenceState::Completed);
    }

    #[tokio::test]
    async fn gate_advances_on_the_tick_it_opens() {
        let mut sequencer = Sequencer::new();
        let mut sink = RecordingSink::default();
        let mut mirror = Mirror::default();
        mirror
            .tree
            .replace("motion", json!({"axis": [{"index": 0, "homed": 0}]}));

        let handle = sequencer.enqueue(
            CommandSequence::new()
                .batch(vec![Command::AxisHome { axis: 0, home: true }])
                .wait(WaitGate::axis_homed(0))
                .batch(vec![exec("G10 L20 P0 X0")]),
        );
        sequencer.pump(Some(&mut sink)).await.unwrap();
        assert_eq!(sink.writes.len(), 1);
        assert_eq!(handle.state(), SequenceState::Waiting(1));

        // Closed for three ticks.
        for _ in 0..3 {
            sequencer.evaluate(&mirror);
            sequencer.pump(Some(&mut sink)).await.unwrap();
            assert_eq!(sink.writes.len(), 1);
        }

        mirror
            .tree
            .merge("motion", json!({"axis": [{"index": 0, "homed": 1}]}));
        sequencer.evaluate(&mirror);
        sequencer.pump(Some(&mut sink)).await.unwrap();
        assert_eq!(sink.writes.len(), 2);
        assert_eq!(handle.finished().await.unwrap(), SequenceState::Completed);
    }

    #[tokio::test]
    async fn axis_gates_follow_the_index_field() {
        let mut mirror = Mirror::default();
        mirror.tree.replace(
            "motion",
            json!({"axis": [{"index": 0, "homed": 0}, {"index": 2, "homed": 1}]}),
        );
        mirror
            .tree
            .merge("motion", json!({"axis": [{"index": 1, "homed": 0}]}));

        let mut sequencer = Sequencer::new();
        let mut sink = RecordingSink::default();
        let axis_one = sequencer.enqueue(
            CommandSequence::new()
                .wait(WaitGate::axis_homed(1))
                .batch(vec![exec("G0 X1")]),
        );
        sequencer.evaluate(&mirror);
        sequencer.pump(Some(&mut sink)).await.unwrap();
        assert!(sink.writes.is_empty());
        assert_eq!(axis_one.state(), SequenceState::Waiting(0));

        let mut sequencer = Sequencer::new();
        let axis_two = sequencer.enqueue(
            CommandSequence::new()
                .wait(WaitGate::axis_homed(2))
                .batch(vec![exec("G0 X2")]),
        );
        sequencer.evaluate(&mirror);
        sequencer.pump(Some(&mut sink)).await.unwrap();
        assert_eq!(sink.writes.len(), 1);
        assert_eq!(axis_two.finished().await.unwrap(), SequenceState::Completed);
    }

    #[tokio::test]
    async fn pump_without_evaluate_never_passes_a_gate() {
        let mut sequencer = Sequencer::new();
        let mut sink = RecordingSink::default();
        let mut mirror = Mirror::default();
        mirror.tree.replace("task", json!({"task_mode": 1}));
        let path = TopicPath::status(["task", "task_mode"]);
        sequencer.enqueue(
            CommandSequence::new()
                .wait(WaitGate::new(Condition::Equals(path, json!(1)), "manual mode"))
                .batch(vec![exec("G0 X1")]),
        );
        sequencer.pump(Some(&mut sink)).await.unwrap();
        sequencer.pump(Some(&mut sink)).await.unwrap();
        assert!(sink.writes.is_empty());

        sequencer.evaluate(&mirror);
        sequencer.pump(Some(&mut sink)).await.unwrap();
        assert_eq!(sink.writes.len(), 1);
    }

    #[tokio::test]
    async fn abort_stops_axes_and_drops_remaining_batches() {
        let mut sequencer = Sequencer::new();
        let mut sink = RecordingSink::default();
        let mirror = Mirror::default();
        let first = sequencer.enqueue(
            CommandSequence::new()
                .batch(vec![exec("G0 X1")])
                .wait(WaitGate::axis_homed(0))
                .batch(vec![exec("G0 X2")]),
        );
        let second = sequencer.enqueue(CommandSequence::new().batch(vec![exec("G0 Y9")]));
        sequencer.pump(Some(&mut sink)).await.unwrap();

        sequencer.abort(Some(&mut sink), 3).await.unwrap();
        assert_eq!(sink.writes.last(), Some(&CommandBatch::emergency_stop(3)));

        sequencer.evaluate(&mirror);
        sequencer.pump(Some(&mut sink)).await.unwrap();
        assert_eq!(sink.writes.len(), 2);
        assert_eq!(first.finished().await.unwrap(), SequenceState::Aborted);
        assert_eq!(second.finished().await.unwrap(), SequenceState::Aborted);

        // A fresh sequence runs normally after an abort.
        let third = sequencer.enqueue(CommandSequence::new().batch(vec![exec("G0 Z1")]));
        sequencer.pump(Some(&mut sink)).await.unwrap();
        assert_eq!(third.finished().await.unwrap(), SequenceState::Completed);
    }

    #[tokio::test]
    async fn write_failure_fails_the_sequence_without_retry() {
        let mut sequencer = Sequencer::new();
        let mut sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let handle = sequencer.enqueue(
            CommandSequence::new()
                .batch(vec![exec("G0 X1")])
                .batch(vec![exec("G0 X2")]),
        );
        let queued = sequencer.enqueue(CommandSequence::new().batch(vec![exec("G0 Y1")]));

        assert!(matches!(
            sequencer.pump(Some(&mut sink)).await,
            Err(SequenceError::Submit(_))
        ));
        sink.fail = false;
        sequencer.pump(Some(&mut sink)).await.unwrap();
        assert!(sink.writes.is_empty());
        assert!(matches!(handle.finished().await, Err(SequenceError::Submit(_))));
        assert!(matches!(queued.finished().await, Err(SequenceError::Submit(_))));
        assert_eq!(sequencer.take_finished().len(), 2);
    }

    #[tokio::test]
    async fn missing_sink_fails_the_active_sequence() {
        let mut sequencer = Sequencer::new();
        let handle = sequencer.enqueue(CommandSequence::new().batch(vec![exec("G0 X1")]));
        assert!(matches!(
            sequencer.pump(None).await,
            Err(SequenceError::NoCommandService)
        ));
        assert!(handle.finished().await.is_err());
    }

    #[test]
    fn empty_batches_are_not_recorded() {
        let sequence = CommandSequence::new()
            .batch(Vec::<Command>::new())
            .batch(vec![exec("M2")]);
        assert_eq!(sequence.batch_count(), 1);
        assert_eq!(sequence.steps().len(), 1);
    }
}
