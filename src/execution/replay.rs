//! Log Replay
//!
//! Rebuilds the current state of a process from its step records. Replay
//! only reads recorded outputs and never invokes a step, so it is
//! deterministic: replaying records `0..k` always yields the same result.

use chrono::{DateTime, Utc};

use crate::store::StoreError;
use crate::workflow::process::{OutcomeKind, ProcessId, StepRecord, Wait};
use crate::workflow::schema::InputSchema;
use crate::workflow::state::StateEnvelope;

/// A suspension that has not been resumed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInput {
    /// Step that suspended
    pub step: String,
    pub index: usize,
    pub schema: InputSchema,
    pub wait: Wait,
}

/// Where a process stands after its records were replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// State before the next step
    pub state: StateEnvelope,

    /// Index of the first step that has not completed
    pub next_index: usize,

    /// Consecutive failed attempts of the step at `next_index`
    pub attempts: u32,

    /// Set while the process waits for input
    pub pending: Option<PendingInput>,

    /// Sequence number of the last record
    pub last_seq: u64,

    pub last_kind: OutcomeKind,

    /// Outcome of a record that ended the process (`failed` or `aborted`)
    pub terminal: Option<OutcomeKind>,

    pub last_timestamp: DateTime<Utc>,
}

fn corrupt(process_id: ProcessId, reason: String) -> StoreError {
    StoreError::CorruptLog { process_id, reason }
}

fn recorded_output(record: &StepRecord) -> Result<StateEnvelope, StoreError> {
    record.output.clone().ok_or_else(|| {
        corrupt(
            record.process_id,
            format!("record {} ({:?}) has no output state", record.seq, record.kind),
        )
    })
}

fn step_index(record: &StepRecord) -> Result<usize, StoreError> {
    record.index.ok_or_else(|| {
        corrupt(
            record.process_id,
            format!("record {} ({:?}) has no step index", record.seq, record.kind),
        )
    })
}

impl Replay {
    /// Starts a replay from the `created` marker.
    pub fn start(first: &StepRecord) -> Result<Self, StoreError> {
        if first.kind != OutcomeKind::Created || first.seq != 0 {
            return Err(corrupt(
                first.process_id,
                format!(
                    "log starts with {:?} at {} instead of a created marker",
                    first.kind, first.seq
                ),
            ));
        }

        Ok(Self {
            state: recorded_output(first)?,
            next_index: 0,
            attempts: 0,
            pending: None,
            last_seq: 0,
            last_kind: OutcomeKind::Created,
            terminal: None,
            last_timestamp: first.timestamp,
        })
    }

    /// Sequence number for the next record.
    pub fn next_seq(&self) -> u64 {
        self.last_seq + 1
    }

    /// Advances past one more record.
    pub fn apply(&mut self, record: &StepRecord) -> Result<(), StoreError> {
        let process_id = record.process_id;
        if record.seq != self.next_seq() {
            return Err(corrupt(
                process_id,
                format!("expected sequence {}, found {}", self.next_seq(), record.seq),
            ));
        }
        if self.terminal.is_some() {
            return Err(corrupt(
                process_id,
                format!("record {} follows a terminal record", record.seq),
            ));
        }

        match record.kind {
            OutcomeKind::Created => {
                return Err(corrupt(
                    process_id,
                    format!("duplicate created marker at {}", record.seq),
                ));
            }
            OutcomeKind::Success | OutcomeKind::Skipped => {
                self.state = recorded_output(record)?;
                self.next_index = step_index(record)? + 1;
                self.attempts = 0;
                self.pending = None;
            }
            OutcomeKind::Resumed => {
                let wait = record.wait.unwrap_or_default();
                self.state = recorded_output(record)?;
                self.next_index = wait.continue_at(step_index(record)?);
                self.attempts = 0;
                self.pending = None;
            }
            OutcomeKind::Suspend => {
                let index = step_index(record)?;
                let wait = record.wait.unwrap_or_default();
                self.state = recorded_output(record)?;
                self.next_index = wait.continue_at(index);
                self.attempts = 0;
                self.pending = Some(PendingInput {
                    step: record.step.clone(),
                    index,
                    schema: record.required_input.clone().unwrap_or_default(),
                    wait,
                });
            }
            OutcomeKind::Retry => {
                self.next_index = step_index(record)?;
                self.attempts += 1;
            }
            OutcomeKind::Failed | OutcomeKind::Aborted => {
                self.terminal = Some(record.kind);
                self.pending = None;
            }
        }

        self.last_seq = record.seq;
        self.last_kind = record.kind;
        self.last_timestamp = record.timestamp;
        Ok(())
    }
}

/// Replays the records of `process_id`, which must start with the
/// `created` marker and be numbered contiguously from 0.
pub fn replay(process_id: ProcessId, records: &[StepRecord]) -> Result<Replay, StoreError> {
    let (first, rest) = records
        .split_first()
        .ok_or_else(|| corrupt(process_id, "empty log".to_string()))?;

    let mut replay = Replay::start(first)?;
    for record in rest {
        replay.apply(record)?;
    }
    Ok(replay)
}
