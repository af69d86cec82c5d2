//! Row types for the relay tables.

/// One durable mailbox. `updated` is a unix timestamp in seconds and
/// advances with every write, open, or listener-activity touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxRow {
    pub id: String,
    pub app_id: String,
    pub updated: i64,
    pub for_nameplate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxSideRow {
    pub mailbox_id: String,
    pub opened: bool,
    pub side: String,
    pub added: i64,
    pub mood: Option<String>,
}

/// One phase message. `id` is chosen by the sending peer; `body` is an
/// opaque blob as far as the server is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: String,
    pub app_id: String,
    pub mailbox_id: String,
    pub side: String,
    pub phase: String,
    pub body: String,
    pub server_rx: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameplateRow {
    pub id: i64,
    pub app_id: String,
    pub name: String,
    pub mailbox_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameplateSideRow {
    pub nameplate_id: i64,
    pub claimed: bool,
    pub side: String,
    pub added: i64,
}
