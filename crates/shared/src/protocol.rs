use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{GroupId, MessageId};

/// Text shown in place of the body of a soft-deleted message. Stored rows keep
/// the original text; the substitution happens when payloads are built.
pub const DELETED_PLACEHOLDER: &str = "[deleted]";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientRequest {
    Register {
        username: String,
        password: String,
    },
    Login {
        username: String,
        password: String,
    },
    AutoLogin {
        username: String,
    },
    GetFriends,
    AddFriend {
        username: String,
    },
    GetRequests,
    AcceptRequest {
        username: String,
    },
    RejectRequest {
        username: String,
    },
    RemoveFriend {
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        to: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },
    #[serde(rename_all = "camelCase")]
    GetChatHistory {
        with_user: String,
    },
    #[serde(rename_all = "camelCase")]
    DeleteMessage {
        message_id: MessageId,
    },
    Typing(SignalTarget),
    StopTyping(SignalTarget),
    GetLastSeen {
        username: String,
    },
    CreateGroup {
        name: String,
        members: Vec<String>,
    },
    GetGroups,
    #[serde(rename_all = "camelCase")]
    GetGroupInfo {
        group_id: GroupId,
    },
    #[serde(rename_all = "camelCase")]
    AddGroupMember {
        group_id: GroupId,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    RemoveGroupMember {
        group_id: GroupId,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    LeaveGroup {
        group_id: GroupId,
    },
    #[serde(rename_all = "camelCase")]
    SendGroupMessage {
        group_id: GroupId,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MessageId>,
    },
    #[serde(rename_all = "camelCase")]
    GetGroupChatHistory {
        group_id: GroupId,
    },
    #[serde(rename_all = "camelCase")]
    DeleteGroupMessage {
        group_id: GroupId,
        message_id: MessageId,
    },
}

/// Addressee of an ephemeral typing signal: either a direct counterpart or a
/// group. The two shapes share one wire event, distinguished by field name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalTarget {
    Direct {
        to: String,
    },
    #[serde(rename_all = "camelCase")]
    Group {
        group_id: GroupId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPayload {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendEntry {
    pub username: String,
    pub online: bool,
    pub unread: i64,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageScope {
    Group,
}

/// One chat message as clients see it, shared by direct and group traffic.
/// Group messages carry `group_id` and `scope`; direct messages carry `to`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<MessageScope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPayload {
    #[serde(rename = "_id")]
    pub id: GroupId,
    pub name: String,
    pub members: Vec<String>,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    #[serde(rename = "_id")]
    pub id: GroupId,
    pub name: String,
    pub members: Vec<String>,
    pub unread: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    AuthResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<UserPayload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    FriendsList(Vec<FriendEntry>),
    FriendAdded {
        success: bool,
        message: String,
    },
    NewRequest {
        from: String,
    },
    RequestsList(Vec<String>),
    NewMessage(MessagePayload),
    ChatHistory(Vec<MessagePayload>),
    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        message_id: MessageId,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },
    #[serde(rename_all = "camelCase")]
    StopTyping {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
    },
    #[serde(rename_all = "camelCase")]
    LastSeen {
        username: String,
        last_seen: Option<DateTime<Utc>>,
        online: bool,
    },
    UserOnline {
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    UserOffline {
        username: String,
        last_seen: DateTime<Utc>,
    },
    GroupCreated {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<GroupPayload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    GroupsList(Vec<GroupSummary>),
    GroupInfo {
        group: GroupPayload,
    },
    #[serde(rename_all = "camelCase")]
    GroupMemberAdded {
        success: bool,
        group_id: GroupId,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    GroupMemberRemoved {
        success: bool,
        group_id: GroupId,
        removed_user: String,
    },
    GroupChatHistory {
        messages: Vec<MessagePayload>,
        group: GroupPayload,
    },
    SessionReplaced {
        username: String,
    },
    ActionFailed {
        message: String,
    },
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
