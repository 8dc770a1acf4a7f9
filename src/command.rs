//! Commands accepted by the command sinks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wire::{self, Container, DecodeError, Frames, MessageType};

/// Axis letters in index order.  Upper case jogs forward, lower case backward.
pub const AXES_FORWARD: [char; 9] = ['X', 'Y', 'Z', 'A', 'B', 'C', 'U', 'V', 'W'];
pub const AXES_BACKWARD: [char; 9] = ['x', 'y', 'z', 'a', 'b', 'c', 'u', 'v', 'w'];

/// Number of axes stopped on abort when the machine does not report its own.
pub const DEFAULT_AXIS_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Manual,
    Auto,
    Mdi,
}

impl TaskMode {
    /// Numeric code the status service reports in `task.task_mode`.
    pub fn code(self) -> i64 {
        match self {
            TaskMode::Manual => 1,
            TaskMode::Auto => 2,
            TaskMode::Mdi => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(TaskMode::Manual),
            2 => Some(TaskMode::Auto),
            3 => Some(TaskMode::Mdi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Estop {
        active: bool,
    },
    Power {
        on: bool,
    },
    TaskMode {
        mode: TaskMode,
    },
    /// Execute one line of g-code (MDI).
    TaskExecute {
        code: String,
    },
    TaskAbort,
    AxisHome {
        axis: usize,
        home: bool,
    },
    /// Jog `axis`; without a distance the jog continues until aborted.
    AxisJog {
        axis: usize,
        velocity: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        distance: Option<f64>,
    },
    AxisAbort {
        axis: usize,
    },
    HalSetPin {
        pin: String,
        value: Value,
    },
}

/// Commands issued together as one write.  No ordering is implied between
/// the commands of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandBatch {
    commands: Vec<Command>,
}

impl CommandBatch {
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    pub fn single(command: Command) -> Self {
        Self::new(vec![command])
    }

    /// Stops every axis in `0..axes`.
    pub fn emergency_stop(axes: usize) -> Self {
        (0..axes).map(|axis| Command::AxisAbort { axis }).collect()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// A single payload frame: a command container listing every command.
    pub fn encode(&self) -> Result<Frames, serde_json::Error> {
        Container::new(MessageType::Command)
            .with_body(serde_json::to_value(&self.commands)?)
            .to_frames()
    }

    /// Reads a batch back from the payload frame of `frames`.
    pub fn decode(frames: &[Vec<u8>]) -> Result<Self, DecodeError> {
        let container = wire::decode(frames)?;
        if container.kind != MessageType::Command {
            return Err(DecodeError::Unexpected(container.kind));
        }
        Ok(Self::new(serde_json::from_value(container.body)?))
    }
}

impl From<Vec<Command>> for CommandBatch {
    fn from(commands: Vec<Command>) -> Self {
        Self::new(commands)
    }
}

impl FromIterator<Command> for CommandBatch {
    fn from_iter<T: IntoIterator<Item = Command>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
