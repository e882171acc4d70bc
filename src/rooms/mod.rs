mod outgoing;
mod registry;

pub use outgoing::{OutgoingRoom, OutgoingRoomState, RoomPhase, SyncOutcome};
pub use registry::{RoomIdentityRegistry, RoomMeta, MAX_PARTICIPANT_NAME_LEN};
