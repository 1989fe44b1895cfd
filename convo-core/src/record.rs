use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::ConvoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Open,
    Closed,
    Snoozed,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Open => "open",
            ConversationState::Closed => "closed",
            ConversationState::Snoozed => "snoozed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(ConversationState::Open),
            "closed" => Some(ConversationState::Closed),
            "snoozed" => Some(ConversationState::Snoozed),
            _ => None,
        }
    }
}

/// A conversation flattened from the remote payload.
///
/// `updated_at` is the remote's own modification time and orders every merge
/// into the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub state: ConversationState,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RemoteConversation {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    updated_at: Option<i64>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    admin_assignee_id: Option<Value>,
    #[serde(default)]
    team_assignee_id: Option<Value>,
    #[serde(default)]
    contacts: Option<RemoteContacts>,
    #[serde(default)]
    tags: Option<RemoteTags>,
    #[serde(default)]
    source: Option<RemoteSource>,
}

#[derive(Debug, Deserialize)]
struct RemoteContacts {
    #[serde(default)]
    contacts: Vec<RemoteContact>,
}

#[derive(Debug, Deserialize)]
struct RemoteContact {
    #[serde(default)]
    id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RemoteTags {
    #[serde(default)]
    tags: Vec<RemoteTag>,
}

#[derive(Debug, Deserialize)]
struct RemoteTag {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteSource {
    #[serde(default)]
    subject: Option<String>,
}

impl TryFrom<RemoteConversation> for ConversationRecord {
    type Error = ConvoError;

    fn try_from(value: RemoteConversation) -> Result<Self, ConvoError> {
        let id = value
            .id
            .as_ref()
            .and_then(id_string)
            .ok_or_else(|| ConvoError::InvalidRecord("conversation is missing id".to_string()))?;
        let created_at = value.created_at.ok_or_else(|| {
            ConvoError::InvalidRecord(format!("conversation {id} is missing created_at"))
        })?;
        let updated_at = value.updated_at.ok_or_else(|| {
            ConvoError::InvalidRecord(format!("conversation {id} is missing updated_at"))
        })?;
        let raw_state = value.state.ok_or_else(|| {
            ConvoError::InvalidRecord(format!("conversation {id} is missing state"))
        })?;
        let state = ConversationState::parse(&raw_state).ok_or_else(|| {
            ConvoError::InvalidRecord(format!("conversation {id} has unknown state {raw_state}"))
        })?;

        let title = value
            .title
            .or_else(|| value.source.and_then(|source| source.subject))
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty());
        let customer_id = value
            .contacts
            .and_then(|contacts| contacts.contacts.into_iter().next())
            .and_then(|contact| contact.id.as_ref().and_then(id_string));
        let tags = value
            .tags
            .map(|tags| {
                tags.tags
                    .into_iter()
                    .filter_map(|tag| tag.name)
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id,
            created_at,
            updated_at,
            state,
            title,
            customer_id,
            assignee_id: value.admin_assignee_id.as_ref().and_then(id_string),
            team_id: value.team_assignee_id.as_ref().and_then(id_string),
            tags,
        })
    }
}

// Remote identifiers arrive as strings or bare numbers depending on the field.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<ConversationRecord, ConvoError> {
        let remote: RemoteConversation = serde_json::from_value(value).unwrap();
        ConversationRecord::try_from(remote)
    }

    #[test]
    fn flattens_nested_remote_fields() {
        let record = parse(json!({
            "type": "conversation",
            "id": "215",
            "created_at": 1_704_067_200,
            "updated_at": 1_704_070_800,
            "state": "snoozed",
            "title": null,
            "source": { "subject": "  Refund request " },
            "admin_assignee_id": 991,
            "team_assignee_id": "7",
            "contacts": { "contacts": [{ "id": "c-1" }, { "id": "c-2" }] },
            "tags": { "tags": [{ "id": "1", "name": "billing" }, { "id": "2", "name": "" }] }
        }))
        .unwrap();

        assert_eq!(record.id, "215");
        assert_eq!(record.state, ConversationState::Snoozed);
        assert_eq!(record.title.as_deref(), Some("Refund request"));
        assert_eq!(record.assignee_id.as_deref(), Some("991"));
        assert_eq!(record.team_id.as_deref(), Some("7"));
        assert_eq!(record.customer_id.as_deref(), Some("c-1"));
        assert_eq!(record.tags, vec!["billing".to_string()]);
    }

    #[test]
    fn missing_updated_at_is_rejected() {
        let err = parse(json!({
            "id": "1",
            "created_at": 1,
            "state": "open"
        }))
        .unwrap_err();
        assert!(matches!(err, ConvoError::InvalidRecord(msg) if msg.contains("updated_at")));
    }

    #[test]
    fn unknown_state_is_rejected() {
        let err = parse(json!({
            "id": 5,
            "created_at": 1,
            "updated_at": 2,
            "state": "archived"
        }))
        .unwrap_err();
        assert!(matches!(err, ConvoError::InvalidRecord(msg) if msg.contains("archived")));
    }

    #[test]
    fn null_assignee_is_absent() {
        let record = parse(json!({
            "id": "9",
            "created_at": 1,
            "updated_at": 2,
            "state": "open",
            "admin_assignee_id": null
        }))
        .unwrap();
        assert_eq!(record.assignee_id, None);
        assert!(record.tags.is_empty());
    }
}
