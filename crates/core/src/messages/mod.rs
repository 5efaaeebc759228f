//! Data contracts exchanged over the broker and the HTTP surface.
//!
//! Instructions are decoded from raw broker payloads with [`decode_instruction`],
//! which validates the record and returns a tagged result instead of panicking.

mod decode;
mod types;

pub use decode::{decode_checkpoint, decode_instruction, validate_checkpoint, DecodeError};
pub use types::*;
