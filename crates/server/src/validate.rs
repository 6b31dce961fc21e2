//! Post-sanitize structural validation (spec §4.4 step 6): content length,
//! `session_id` format, and metadata size. Hand-written predicate functions
//! returning `Result`, in the style of this codebase's other manual
//! validators rather than a schema-validation crate.

use gatehouse_protocol::Message;

const MAX_SESSION_ID_LEN: usize = 128;
const MAX_METADATA_ENTRIES: usize = 32;
const MAX_METADATA_KEY_LEN: usize = 64;
const MAX_METADATA_VALUE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("content exceeds maximum length")]
    ContentTooLong,
    #[error("session_id has an invalid format")]
    InvalidSessionId,
    #[error("metadata has too many entries")]
    TooManyMetadataEntries,
    #[error("metadata key or value is too long")]
    MetadataEntryTooLong,
}

/// `session_id` is either empty (not yet assigned) or a bounded string of
/// ASCII alphanumerics, `-`, and `_` — the conservative superset covering
/// both UUIDs and short opaque ids.
fn is_valid_session_id(session_id: &str) -> bool {
    session_id.is_empty()
        || (session_id.len() <= MAX_SESSION_ID_LEN
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
}

/// Validate one ingress message against the configured limits. `type` is not
/// re-checked here: an unrecognized `type` never reaches this point because
/// JSON parsing (spec §4.4 step 3) already rejects it.
pub fn validate_message(message: &Message, max_content_len: usize) -> Result<(), ValidationError> {
    if message.content.len() > max_content_len {
        return Err(ValidationError::ContentTooLong);
    }
    if !is_valid_session_id(&message.session_id) {
        return Err(ValidationError::InvalidSessionId);
    }
    if message.metadata.len() > MAX_METADATA_ENTRIES {
        return Err(ValidationError::TooManyMetadataEntries);
    }
    for (k, v) in &message.metadata {
        if k.len() > MAX_METADATA_KEY_LEN || v.len() > MAX_METADATA_VALUE_LEN {
            return Err(ValidationError::MetadataEntryTooLong);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_protocol::{MessageType, Sender};
    use std::collections::HashMap;

    fn base_message() -> Message {
        Message {
            kind: MessageType::UserMessage,
            session_id: "abc-123".to_string(),
            sender: Sender::User,
            content: "hello".to_string(),
            file_id: None,
            file_url: None,
            timestamp: None,
            metadata: HashMap::new(),
            error: None,
        }
    }

    #[test]
    fn accepts_well_formed_message() {
        assert!(validate_message(&base_message(), 1024).is_ok());
    }

    #[test]
    fn rejects_content_over_limit() {
        let mut msg = base_message();
        msg.content = "x".repeat(10);
        assert_eq!(
            validate_message(&msg, 5),
            Err(ValidationError::ContentTooLong)
        );
    }

    #[test]
    fn accepts_empty_session_id() {
        let mut msg = base_message();
        msg.session_id = String::new();
        assert!(validate_message(&msg, 1024).is_ok());
    }

    #[test]
    fn rejects_session_id_with_bad_characters() {
        let mut msg = base_message();
        msg.session_id = "not valid!".to_string();
        assert_eq!(
            validate_message(&msg, 1024),
            Err(ValidationError::InvalidSessionId)
        );
    }

    #[test]
    fn rejects_too_many_metadata_entries() {
        let mut msg = base_message();
        for i in 0..64 {
            msg.metadata.insert(format!("k{i}"), "v".to_string());
        }
        assert_eq!(
            validate_message(&msg, 1024),
            Err(ValidationError::TooManyMetadataEntries)
        );
    }

    #[test]
    fn rejects_oversized_metadata_value() {
        let mut msg = base_message();
        msg.metadata
            .insert("k".to_string(), "v".repeat(MAX_METADATA_VALUE_LEN + 1));
        assert_eq!(
            validate_message(&msg, 1024),
            Err(ValidationError::MetadataEntryTooLong)
        );
    }
}
