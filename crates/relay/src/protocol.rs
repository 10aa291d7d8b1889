// Binary wire codec for the collaboration protocol.
//
// Every logical message starts with a varint tag: `0` for document sync
// traffic, `1` for presence (awareness) traffic. Sync messages carry a
// varint sub-tag (`0` step-1 state vector, `1` step-2 diff, `2` incremental
// update); awareness messages carry a varint-length-prefixed payload that is
// applied verbatim by the receiver. A single transport frame may contain
// several logical messages back to back.

use yrs::encoding::read::Cursor;
use yrs::sync::{AwarenessUpdate, Message, MessageReader, SyncMessage};
use yrs::updates::decoder::DecoderV1;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

use crate::error::EngineError;

/// Top-level tag for document sync messages.
pub const MSG_SYNC: u8 = 0;
/// Top-level tag for presence messages.
pub const MSG_AWARENESS: u8 = 1;

/// Decode every logical message packed into one transport frame.
///
/// Decoding stops at the first malformed message; callers drop the frame and
/// keep the connection open.
pub fn decode_frames(payload: &[u8]) -> Result<Vec<Message>, EngineError> {
    let mut decoder = DecoderV1::new(Cursor::new(payload));
    let mut reader = MessageReader::new(&mut decoder);
    let mut messages = Vec::new();

    while let Some(next_message) = reader.next() {
        messages.push(next_message.map_err(yrs::sync::Error::from)?);
    }

    Ok(messages)
}

/// Encode a sync step-1 request carrying the local state vector.
pub fn sync_step1(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

/// Encode a sync step-2 reply carrying a state diff.
pub fn sync_step2(diff: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1()
}

/// Encode an incremental document update.
pub fn sync_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

/// Encode a presence delta or snapshot.
pub fn awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}
