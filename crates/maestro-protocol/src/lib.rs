// ABOUTME: Wire vocabulary for the maestro agent bridge.
// ABOUTME: Closed Command/Event enums, encoded as one JSON object per line with a `type` tag.

mod codec;
mod command;
mod event;

pub use codec::{decode_command, decode_event, encode, encode_line, ProtocolError};
pub use command::Command;
pub use event::{Event, Role, StatusState, ToolCall, ToolStatus};
