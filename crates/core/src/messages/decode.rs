use thiserror::Error;

use super::types::{Checkpoint, Instruction, CHECKPOINT_TYPE};

/// Why a payload was rejected at the message boundary.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,

    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload does not match schema: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Decode and validate an instruction from a raw broker payload.
pub fn decode_instruction(payload: &[u8]) -> Result<Instruction, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    let text = std::str::from_utf8(payload)?;
    let instruction: Instruction = serde_json::from_str(text)?;
    validate_instruction(&instruction)?;
    Ok(instruction)
}

/// Decode a checkpoint, requiring the `checkpoint` type tag.
pub fn decode_checkpoint(payload: &[u8]) -> Result<Checkpoint, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    let checkpoint: Checkpoint = serde_json::from_slice(payload)?;
    validate_checkpoint(&checkpoint)?;
    Ok(checkpoint)
}

/// Check the type tag and step of an already-parsed checkpoint.
pub fn validate_checkpoint(checkpoint: &Checkpoint) -> Result<(), DecodeError> {
    if checkpoint.kind != CHECKPOINT_TYPE {
        return Err(DecodeError::InvalidField {
            field: "type",
            reason: format!("expected '{}', got '{}'", CHECKPOINT_TYPE, checkpoint.kind),
        });
    }
    if checkpoint.step.trim().is_empty() {
        return Err(DecodeError::InvalidField {
            field: "step",
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn validate_instruction(instruction: &Instruction) -> Result<(), DecodeError> {
    if instruction.id.trim().is_empty() {
        return Err(DecodeError::InvalidField {
            field: "id",
            reason: "must not be empty".to_string(),
        });
    }
    // Mileage only ever grows.
    if !instruction.km_gain.is_finite() || instruction.km_gain < 0.0 {
        return Err(DecodeError::InvalidField {
            field: "km_gain",
            reason: format!("must be a finite non-negative number, got {}", instruction.km_gain),
        });
    }
    if let Some(lat) = instruction.latitude {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(DecodeError::InvalidField {
                field: "latitude",
                reason: format!("{} is outside [-90, 90]", lat),
            });
        }
    }
    if let Some(lon) = instruction.longitude {
        if !(-180.0..=180.0).contains(&lon) {
            return Err(DecodeError::InvalidField {
                field: "longitude",
                reason: format!("{} is outside [-180, 180]", lon),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_valid_instruction() {
        let payload = r#"{"id":"2","type":"instruction","action":"go_forward","target":"Rue de la République","km_gain":0.2,"latitude":45.1895,"longitude":5.7255}"#.as_bytes();
        let instruction = decode_instruction(payload).unwrap();
        assert_eq!(instruction.id, "2");
        assert_eq!(instruction.action, "go_forward");
        assert_eq!(instruction.km_gain, 0.2);
        assert_eq!(instruction.latitude, Some(45.1895));
    }

    #[test]
    fn test_decode_integer_km_gain() {
        let payload = br#"{"id":"1","type":"instruction","action":"start","target":"x","km_gain":1}"#;
        let instruction = decode_instruction(payload).unwrap();
        assert_eq!(instruction.km_gain, 1.0);
        assert!(instruction.longitude.is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_instruction(b"not json"),
            Err(DecodeError::Schema(_))
        ));
        assert!(matches!(decode_instruction(b""), Err(DecodeError::Empty)));
        assert!(matches!(
            decode_instruction(&[0xff, 0xfe, 0x00]),
            Err(DecodeError::Utf8(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        let payload = br#"{"id":"1","type":"instruction","action":"start","km_gain":0.0}"#;
        assert!(matches!(
            decode_instruction(payload),
            Err(DecodeError::Schema(_))
        ));
    }

    #[test]
    fn test_decode_rejects_negative_gain() {
        let payload = br#"{"id":"1","type":"instruction","action":"reverse","target":"x","km_gain":-0.5}"#;
        let err = decode_instruction(payload).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidField {
                field: "km_gain",
                ..
            }
        ));
    }

    #[test]
    fn test_decode_rejects_out_of_range_coordinates() {
        let payload = br#"{"id":"1","type":"instruction","action":"start","target":"x","km_gain":0.0,"latitude":95.0}"#;
        assert!(matches!(
            decode_instruction(payload),
            Err(DecodeError::InvalidField {
                field: "latitude",
                ..
            })
        ));
    }

    #[test]
    fn test_decode_checkpoint_requires_type() {
        let ok = br#"{"type":"checkpoint","step":"4","id":"4","group_id":"g","km_travelled":1.5}"#;
        assert_eq!(decode_checkpoint(ok).unwrap().step, "4");

        let wrong = br#"{"type":"ready","step":"4","id":"4","group_id":"g","km_travelled":1.5}"#;
        assert!(matches!(
            decode_checkpoint(wrong),
            Err(DecodeError::InvalidField { field: "type", .. })
        ));
    }
}
