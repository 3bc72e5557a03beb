//! The step-sequence output contract consumed by the HTTP layer.
//!
//! Each user intent (bid, list, sell, cancel) is answered with exactly one
//! ordered list of steps; `complete` steps convey what the user has
//! already done, `incomplete` steps carry the next wallet payload.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    Transaction,
    Signature,
    Request,
    Confirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub action:      String,
    pub description: String,
    pub status:      StepStatus,
    pub kind:        StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data:        Option<JsonValue>,
}

impl Step {
    #[must_use]
    pub fn complete(action: &str, description: &str, kind: StepKind) -> Self {
        Self {
            action:      action.to_owned(),
            description: description.to_owned(),
            status:      StepStatus::Complete,
            kind,
            data:        None,
        }
    }

    #[must_use]
    pub fn incomplete(action: &str, description: &str, kind: StepKind, data: JsonValue) -> Self {
        Self {
            action:      action.to_owned(),
            description: description.to_owned(),
            status:      StepStatus::Incomplete,
            kind,
            data:        Some(data),
        }
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;
    use serde_json::{json, to_value};

    use super::*;

    #[test]
    fn test_step_wire_shape() {
        let step = Step::incomplete(
            "Approve WETH",
            "Allow the exchange to spend your WETH",
            StepKind::Transaction,
            json!({"to": "0x0"}),
        );
        assert_eq!(
            to_value(&step).unwrap(),
            json!({
                "action": "Approve WETH",
                "description": "Allow the exchange to spend your WETH",
                "status": "incomplete",
                "kind": "transaction",
                "data": {"to": "0x0"}
            })
        );
    }
}
