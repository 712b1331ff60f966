use crate::types::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty field {0}")]
    Empty(&'static str),
    #[error("too long {0}")]
    TooLong(&'static str),
    #[error("message has neither body nor attachment")]
    MissingContent,
}

pub fn validate_conversation_id(id: &ConversationId) -> Result<(), ValidationError> {
    if id.value.trim().is_empty() {
        return Err(ValidationError::Empty("conversation_id"));
    }
    Ok(())
}

/// Checks a draft before it reaches the delivery queue. A whitespace-only
/// body counts as empty.
pub fn validate_draft(draft: &MessageDraft, limits: &ValidationLimits) -> Result<(), ValidationError> {
    validate_conversation_id(&draft.conversation_id)?;
    if let Some(attachment) = draft.attachment_ref.as_ref() {
        if attachment.value.trim().is_empty() {
            return Err(ValidationError::Empty("attachment_ref"));
        }
    }
    if draft.body.len() > limits.max_body_bytes {
        return Err(ValidationError::TooLong("body"));
    }
    if draft.body.trim().is_empty() && draft.attachment_ref.is_none() {
        return Err(ValidationError::MissingContent);
    }
    Ok(())
}
