use serde::{Deserialize, Serialize};

/// Message type tag carried by checkpoints.
pub const CHECKPOINT_TYPE: &str = "checkpoint";

/// Message type tag carried by the ready signal.
pub const READY_TYPE: &str = "ready";

/// A driving instruction consumed from the instruction topic.
///
/// Immutable once decoded; the `id` doubles as the checkpoint step key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub target: String,
    pub km_gain: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl Instruction {
    /// Step key used to correlate this instruction with its checkpoint.
    pub fn step(&self) -> &str {
        &self.id
    }
}

/// Acknowledgment that an instruction's effect happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "type")]
    pub kind: String,
    pub step: String,
    pub id: String,
    pub group_id: String,
    pub km_travelled: f64,
}

impl Checkpoint {
    pub fn new(step: &str, id: &str, group_id: &str, km_travelled: f64) -> Self {
        Self {
            kind: CHECKPOINT_TYPE.to_string(),
            step: step.to_string(),
            id: id.to_string(),
            group_id: group_id.to_string(),
            km_travelled,
        }
    }
}

/// One-shot signal announcing that the pilot is ready to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    #[serde(rename = "type")]
    pub kind: String,
    pub group_id: String,
    pub message: String,
}

impl Ready {
    pub fn new(group_id: &str, message: &str) -> Self {
        Self {
            kind: READY_TYPE.to_string(),
            group_id: group_id.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_uses_type_field() {
        let instruction = Instruction {
            id: "1".to_string(),
            kind: "instruction".to_string(),
            action: "start".to_string(),
            target: "Départ - Place Grenette".to_string(),
            km_gain: 0.0,
            latitude: None,
            longitude: None,
        };

        let json = serde_json::to_value(&instruction).unwrap();
        assert_eq!(json["type"], "instruction");
        assert!(json.get("kind").is_none());
        assert!(json.get("latitude").is_none());
        assert_eq!(instruction.step(), "1");
    }

    #[test]
    fn test_checkpoint_shape() {
        let checkpoint = Checkpoint::new("3", "3", "pilot", 0.35);
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(json["type"], "checkpoint");
        assert_eq!(json["step"], "3");
        assert_eq!(json["group_id"], "pilot");
        assert_eq!(json["km_travelled"], 0.35);
    }

    #[test]
    fn test_ready_shape() {
        let ready = Ready::new("pilot", "Pilot ready to start driving");
        let json = serde_json::to_value(&ready).unwrap();
        assert_eq!(json["type"], "ready");
        assert_eq!(json["message"], "Pilot ready to start driving");
    }
}
