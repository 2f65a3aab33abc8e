//! Persistence collaborator: the record shapes handed to storage and the store interface.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{DeliveryStatus, Message, MessageKind, Sender};

/// One stored message, keyed by `(chat_id, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub status: DeliveryStatus,
}

impl MessageRecord {
    pub fn from_message(chat_id: &str, m: &Message) -> Self {
        Self {
            id: m.id.clone(),
            chat_id: chat_id.to_string(),
            content: m.content.clone(),
            sender: m.sender.clone(),
            timestamp: m.timestamp,
            kind: m.kind,
            status: m.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub chat_id: String,
    pub last_message: String,
    pub last_timestamp: DateTime<Utc>,
    pub unread: u32,
}

pub trait MessageStore {
    fn save_message(&mut self, record: MessageRecord);
    fn update_status(&mut self, chat_id: &str, message_id: &str, status: DeliveryStatus);
    fn load_messages(&self, chat_id: &str) -> Vec<MessageRecord>;
    fn save_summary(&mut self, summary: ChatSummary);
    fn summaries(&self) -> Vec<ChatSummary>;
}

/// In-memory store. Messages keep insertion order per chat.
#[derive(Default)]
pub struct MemoryStore {
    chats: HashMap<String, Vec<MessageRecord>>,
    summaries: HashMap<String, ChatSummary>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    fn save_message(&mut self, record: MessageRecord) {
        let chat = self.chats.entry(record.chat_id.clone()).or_default();
        match chat.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => chat.push(record),
        }
    }

    fn update_status(&mut self, chat_id: &str, message_id: &str, status: DeliveryStatus) {
        if let Some(r) = self
            .chats
            .get_mut(chat_id)
            .and_then(|c| c.iter_mut().find(|r| r.id == message_id))
        {
            r.status = status;
        }
    }

    fn load_messages(&self, chat_id: &str) -> Vec<MessageRecord> {
        self.chats.get(chat_id).cloned().unwrap_or_default()
    }

    fn save_summary(&mut self, summary: ChatSummary) {
        self.summaries.insert(summary.chat_id.clone(), summary);
    }

    fn summaries(&self) -> Vec<ChatSummary> {
        let mut out: Vec<ChatSummary> = self.summaries.values().cloned().collect();
        out.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_is_upsert_by_id() {
        let mut store = MemoryStore::new();
        let m = Message::outgoing("hi", MessageKind::Text);
        store.save_message(MessageRecord::from_message("bob", &m));
        store.save_message(MessageRecord::from_message("bob", &m));
        assert_eq!(store.load_messages("bob").len(), 1);
        store.update_status("bob", &m.id, DeliveryStatus::Read);
        assert_eq!(store.load_messages("bob")[0].status, DeliveryStatus::Read);
        assert!(store.load_messages("carol").is_empty());
    }
}
