//! Builders turning machine operations into command sequences.
//!
//! Every builder reads the mirrored state it needs up front and fails with
//! [`SequenceError::MissingState`] when the machine has not reported it yet.

use serde_json::Value;

use crate::command::{Command, CommandBatch, TaskMode, AXES_BACKWARD, AXES_FORWARD, DEFAULT_AXIS_COUNT};
use crate::sequencer::{CommandSequence, SequenceError, WaitGate};
use crate::tree::{truthy, StateView, TopicPath};

fn value<'a>(state: &'a dyn StateView, segments: &[&str]) -> Option<&'a Value> {
    state.lookup(&TopicPath::status(segments.iter().copied()))
}

fn require<'a>(state: &'a dyn StateView, segments: &[&str]) -> Result<&'a Value, SequenceError> {
    value(state, segments)
        .ok_or_else(|| SequenceError::MissingState(format!("status.{}", segments.join("."))))
}

fn task_mode(state: &dyn StateView) -> Option<TaskMode> {
    value(state, &["task", "task_mode"])
        .and_then(Value::as_i64)
        .and_then(TaskMode::from_code)
}

/// Switches to manual mode unless the machine is already there.
pub fn task_mode_manual(state: &dyn StateView) -> Vec<Command> {
    match task_mode(state) {
        Some(TaskMode::Manual) => Vec::new(),
        _ => vec![Command::TaskMode {
            mode: TaskMode::Manual,
        }],
    }
}

/// Switches to MDI mode, unconditionally when `force` is set.
pub fn task_mode_mdi(state: &dyn StateView, force: bool) -> Vec<Command> {
    if !force && task_mode(state) == Some(TaskMode::Mdi) {
        return Vec::new();
    }
    vec![Command::TaskMode {
        mode: TaskMode::Mdi,
    }]
}

/// Number of axes the machine reports, or the default when it does not.
/// Never more than there are axis letters.
pub fn axis_count(state: &dyn StateView) -> usize {
    value(state, &["config", "axes"])
        .and_then(Value::as_u64)
        .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
        .unwrap_or(DEFAULT_AXIS_COUNT)
        .min(AXES_FORWARD.len())
}

/// Estop released and motion enabled.
pub fn is_powered(state: &dyn StateView) -> bool {
    !truthy(value(state, &["io", "estop"])) && truthy(value(state, &["motion", "enabled"]))
}

/// Powered and every axis homed.
pub fn is_homed(state: &dyn StateView) -> bool {
    if !is_powered(state) {
        return false;
    }
    match value(state, &["motion", "axis"]) {
        Some(Value::Array(axes)) => axes.iter().all(|axis| truthy(axis.get("homed"))),
        _ => false,
    }
}

/// Homes every axis that is not homed yet, grouped by the configured home
/// sequence, then zeroes the work offsets.
pub fn home(state: &dyn StateView) -> Result<CommandSequence, SequenceError> {
    let motion = require(state, &["motion", "axis"])?;
    let unhomed: Vec<usize> = motion
        .as_array()
        .into_iter()
        .flatten()
        .enumerate()
        .filter(|(_, axis)| !truthy(axis.get("homed")))
        .map(|(position, axis)| axis_index(axis).unwrap_or(position))
        .collect();

    let config = require(state, &["config", "axis"])?;
    let mut groups: Vec<(i64, Vec<usize>)> = Vec::new();
    for (position, axis) in config.as_array().into_iter().flatten().enumerate() {
        let index = axis_index(axis).unwrap_or(position);
        if !unhomed.contains(&index) {
            continue;
        }
        let order = axis.get("home_sequence").and_then(Value::as_i64).unwrap_or(0);
        match groups.iter_mut().find(|(o, _)| *o == order) {
            Some((_, axes)) => axes.push(index),
            None => groups.push((order, vec![index])),
        }
    }
    groups.sort_by_key(|(order, _)| *order);

    let mut sequence = CommandSequence::new();
    sequence.push_each(task_mode_manual(state));
    for (_, axes) in groups {
        sequence.push_batch(
            axes.iter()
                .map(|&axis| Command::AxisHome { axis, home: true })
                .collect::<CommandBatch>(),
        );
        for &axis in &axes {
            sequence.push_wait(WaitGate::axis_homed(axis));
        }
    }
    sequence.push_batch(task_mode_mdi(state, true));
    sequence.push_batch(vec![Command::TaskExecute {
        code: "G10 L20 P0 X0 Y0 Z0".to_string(),
    }]);
    Ok(sequence)
}

fn axis_index(axis: &Value) -> Option<usize> {
    axis.get("index").and_then(Value::as_u64).map(|i| i as usize)
}

/// Releases estop if engaged and toggles power.
pub fn power(state: &dyn StateView, powered: bool) -> CommandSequence {
    let mut commands = Vec::new();
    if truthy(value(state, &["io", "estop"])) {
        commands.push(Command::Estop { active: false });
    }
    commands.push(Command::Power { on: !powered });
    CommandSequence::new().batch(commands)
}

/// Runs one line of g-code, switching to MDI mode first when needed.
pub fn mdi(state: &dyn StateView, code: &str) -> CommandSequence {
    let mut commands = task_mode_mdi(state, false);
    commands.push(Command::TaskExecute {
        code: code.to_string(),
    });
    CommandSequence::new().batch(commands)
}

/// Sets the current position of the given axes in the active work offset.
pub fn set_position(state: &dyn StateView, positions: &[(char, f64)]) -> Result<CommandSequence, SequenceError> {
    let mut code = String::from("G10 L20 P0");
    for &(axis, position) in positions {
        if !AXES_FORWARD.contains(&axis.to_ascii_uppercase()) {
            return Err(SequenceError::UnknownAxis(axis));
        }
        code.push_str(&format!(" {}{}", axis.to_ascii_uppercase(), position));
    }
    Ok(mdi(state, &code))
}

/// Axis index and signed jog velocity for an axis letter.
fn jog_axis(axis: char, velocity: f64) -> Result<(usize, f64), SequenceError> {
    if let Some(index) = AXES_FORWARD.iter().position(|&a| a == axis) {
        return Ok((index, velocity));
    }
    if let Some(index) = AXES_BACKWARD.iter().position(|&a| a == axis) {
        return Ok((index, -velocity));
    }
    Err(SequenceError::UnknownAxis(axis))
}

/// Jogs the given axes together, upper case letters forward and lower case
/// backward.  Without a distance the jog runs until [`jog_end`].
pub fn jog(state: &dyn StateView, axes: &str, distance: Option<f64>) -> Result<CommandSequence, SequenceError> {
    let velocity = require(state, &["config", "velocity", "linear", "max"])?
        .as_f64()
        .ok_or_else(|| SequenceError::MissingState("status.config.velocity.linear.max".into()))?;
    let jogs = axes
        .chars()
        .map(|axis| {
            jog_axis(axis, velocity).map(|(axis, velocity)| Command::AxisJog {
                axis,
                velocity,
                distance,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut sequence = CommandSequence::new();
    if jogs.is_empty() {
        return Ok(sequence);
    }
    sequence.push_each(task_mode_manual(state));
    sequence.push_batch(jogs);
    Ok(sequence)
}

/// Stops a continuous jog of the given axes.
pub fn jog_end(state: &dyn StateView, axes: &str) -> Result<CommandSequence, SequenceError> {
    let aborts = axes
        .chars()
        .map(|axis| jog_axis(axis, 0.0).map(|(axis, _)| Command::AxisAbort { axis }))
        .collect::<Result<Vec<_>, _>>()?;

    let mut sequence = CommandSequence::new();
    if aborts.is_empty() {
        return Ok(sequence);
    }
    sequence.push_each(task_mode_manual(state));
    sequence.push_batch(aborts);
    Ok(sequence)
}
