//! STOMP destinations used by the chat broker.

pub const ADD_USER: &str = "/app/chat.addUser";
pub const SEND_MESSAGE: &str = "/app/chat.sendMessage";
pub const LEAVE_USER: &str = "/app/chat.leaveUser";
pub const INVITE_USER: &str = "/app/chat.inviteUser";
pub const KICK_USER: &str = "/app/chat.kickUser";

/// Per-user queue carrying plain-text server errors.
pub const USER_ERRORS: &str = "/user/queue/errors";
/// Per-user queue carrying plain-text invitation notices.
pub const USER_INVITATIONS: &str = "/user/queue/invitations";

/// Broadcast topic for a room.
#[must_use]
pub fn room_topic(room_id: &str) -> String {
    format!("/topic/chat/{room_id}")
}
