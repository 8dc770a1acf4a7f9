//! Manual tool change handshake.
//!
//! The machine exports a HAL component with three pins: `change` goes high
//! when the program asks for a tool, `number` names the tool and `changed` is
//! written back by us once the operator inserted it.

use log::debug;
use serde_json::{json, Value};

use crate::command::Command;

pub const COMPONENT: &str = "fc_manualtoolchange";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChangeAction {
    /// Ask the operator to insert this tool.
    Prompt(i64),
    /// Tool 0 needs no operator, confirm right away.
    Acknowledge,
    /// The request is gone, clear `changed` again.
    Reset,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolChangePins {
    pub change: bool,
    pub number: i64,
    pub changed: bool,
}

impl ToolChangePins {
    /// Reads the pins from the component's topic value.  Pin names may carry
    /// the component prefix.
    pub fn from_value(value: &Value) -> Self {
        let pin = |name: &str| {
            value
                .get(name)
                .or_else(|| value.get(format!("{}.{}", COMPONENT, name)))
        };
        let flag = |v: Option<&Value>| match v {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            _ => false,
        };
        Self {
            change: flag(pin("change")),
            number: pin("number").and_then(Value::as_i64).unwrap_or(0),
            changed: flag(pin("changed")),
        }
    }
}

/// Tracks the handshake so each request is announced once.
#[derive(Debug, Default)]
pub struct ToolChangeMonitor {
    /// Tool of the request already handled, until `change` drops.
    last: Option<i64>,
    pending: Option<i64>,
}

impl ToolChangeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, pins: ToolChangePins) -> Option<ToolChangeAction> {
        if pins.change {
            if pins.changed || self.last == Some(pins.number) {
                return None;
            }
            self.last = Some(pins.number);
            if pins.number == 0 {
                debug!("tool change cleared");
                self.pending = None;
                return Some(ToolChangeAction::Acknowledge);
            }
            self.pending = Some(pins.number);
            return Some(ToolChangeAction::Prompt(pins.number));
        }
        self.last = None;
        self.pending = None;
        if pins.changed {
            debug!("tool change reset");
            return Some(ToolChangeAction::Reset);
        }
        None
    }

    /// Tool the operator was asked for and has not answered yet.
    pub fn pending(&self) -> Option<i64> {
        self.pending
    }

    /// Clears the outstanding request and returns it.
    pub fn answer(&mut self) -> Option<i64> {
        self.pending.take()
    }
}

/// Command writing the `changed` pin.
pub fn set_changed(changed: bool) -> Command {
    Command::HalSetPin {
        pin: format!("{}.changed", COMPONENT),
        value: json!(changed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pins(change: bool, number: i64, changed: bool) -> ToolChangePins {
        ToolChangePins {
            change,
            number,
            changed,
        }
    }

    #[test]
    fn reads_plain_and_prefixed_pin_names() {
        assert_eq!(
            ToolChangePins::from_value(&json!({"change": true, "number": 4, "changed": 0})),
            pins(true, 4, false)
        );
        assert_eq!(
            ToolChangePins::from_value(&json!({
                "fc_manualtoolchange.change": 1,
                "fc_manualtoolchange.number": 2,
                "fc_manualtoolchange.changed": true
            })),
            pins(true, 2, true)
        );
        assert_eq!(ToolChangePins::from_value(&json!({})), pins(false, 0, false));
    }

    #[test]
    fn prompts_once_per_request() {
        let mut monitor = ToolChangeMonitor::new();
        assert_eq!(monitor.observe(pins(true, 3, false)), Some(ToolChangeAction::Prompt(3)));
        assert_eq!(monitor.observe(pins(true, 3, false)), None);
        assert_eq!(monitor.pending(), Some(3));
        assert_eq!(monitor.answer(), Some(3));
        assert_eq!(monitor.observe(pins(true, 3, true)), None);
        assert_eq!(monitor.observe(pins(false, 3, true)), Some(ToolChangeAction::Reset));
        assert_eq!(monitor.observe(pins(false, 3, false)), None);
        assert_eq!(monitor.observe(pins(true, 5, false)), Some(ToolChangeAction::Prompt(5)));
    }

    #[test]
    fn tool_zero_is_acknowledged() {
        let mut monitor = ToolChangeMonitor::new();
        assert_eq!(monitor.observe(pins(true, 0, false)), Some(ToolChangeAction::Acknowledge));
        assert_eq!(monitor.pending(), None);
    }

    #[test]
    fn tool_zero_is_acknowledged_once() {
        let mut monitor = ToolChangeMonitor::new();
        assert_eq!(monitor.observe(pins(true, 0, false)), Some(ToolChangeAction::Acknowledge));
        // `changed` has not come back yet.
        assert_eq!(monitor.observe(pins(true, 0, false)), None);
        assert_eq!(monitor.observe(pins(true, 0, true)), None);
        assert_eq!(monitor.observe(pins(false, 0, true)), Some(ToolChangeAction::Reset));
        assert_eq!(monitor.observe(pins(true, 0, false)), Some(ToolChangeAction::Acknowledge));
    }

    #[test]
    fn answered_request_is_not_prompted_again() {
        let mut monitor = ToolChangeMonitor::new();
        assert_eq!(monitor.observe(pins(true, 4, false)), Some(ToolChangeAction::Prompt(4)));
        assert_eq!(monitor.answer(), Some(4));
        assert_eq!(monitor.observe(pins(true, 4, false)), None);
        assert_eq!(monitor.pending(), None);
        assert_eq!(monitor.observe(pins(true, 4, true)), None);
        assert_eq!(monitor.observe(pins(false, 4, true)), Some(ToolChangeAction::Reset));
    }

    #[test]
    fn set_changed_targets_the_component_pin() {
        assert_eq!(
            set_changed(true),
            Command::HalSetPin {
                pin: "fc_manualtoolchange.changed".into(),
                value: json!(true)
            }
        );
    }
}
