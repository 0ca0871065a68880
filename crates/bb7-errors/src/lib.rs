//! Error taxonomy for the BB-7 backend.
//!
//! The frontend switches on message substrings rather than a structured
//! code, so `Display` text is part of this crate's contract: once a
//! message prefix ships, changing it is a breaking change for the
//! frontend.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub type Result<T> = std::result::Result<T, BbError>;

/// The closed error taxonomy from the backend's error handling design.
#[derive(Debug, thiserror::Error)]
pub enum BbError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not initialised: {0}")]
    NotInitialised(String),

    #[error("no active chat: {0}")]
    NoActiveChat(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("edit error: {0}")]
    Edit(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BbError {
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config(detail.into())
    }

    pub fn not_initialised(detail: impl Into<String>) -> Self {
        Self::NotInitialised(detail.into())
    }

    pub fn no_active_chat() -> Self {
        Self::NoActiveChat("no chat is currently selected".into())
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::Conflict(detail.into())
    }

    pub fn busy(detail: impl Into<String>) -> Self {
        Self::Busy(detail.into())
    }

    pub fn parse(detail: impl Into<String>) -> Self {
        Self::Parse(detail.into())
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport(detail.into())
    }

    pub fn edit(detail: impl Into<String>) -> Self {
        Self::Edit(detail.into())
    }

    /// Category label used only for internal logging — never sent over
    /// the wire, where the frontend relies on substring matching instead.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::NotInitialised(_) => "not_initialised",
            Self::NoActiveChat(_) => "no_active_chat",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Busy(_) => "busy",
            Self::Parse(_) => "parse",
            Self::Transport(_) => "transport",
            Self::Edit(_) => "edit",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Is this a sandbox violation? Those never reach this enum — they
    /// bypass the normal error path entirely (see `bb7_sandbox::fatal_violation`)
    /// — but call sites that wrap an untrusted path check can use this to
    /// decide whether a `Conflict`/`NotFound` they just built should instead
    /// be treated as fatal.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Shape this error as the stdio `error` reply frame's body.
    pub fn as_frame_body(&self) -> Value {
        json!({ "message": self.to_string() })
    }
}

/// One structured failure from the file-edit engine, distinct from
/// `BbError::Edit` because the coordinator needs the indices/positions to
/// build a `@retry_context` block, not just a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditFailure {
    pub change_index: usize,
    pub reason: String,
    pub start: Option<usize>,
    pub end: Option<usize>,
}

impl EditFailure {
    pub fn new(change_index: usize, reason: impl Into<String>) -> Self {
        Self {
            change_index,
            reason: reason.into(),
            start: None,
            end: None,
        }
    }

    pub fn at(mut self, start: usize, end: usize) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_prefix_the_frontend_matches_on() {
        let err = BbError::edit("anchor not unique (lines 1, 2)");
        assert!(err.to_string().contains("anchor not unique"));
        let err = BbError::busy("Cannot modify context while a request is active");
        assert!(
            err.to_string()
                .contains("Cannot modify context while a request is active")
        );
    }

    #[test]
    fn frame_body_has_message_field_only() {
        let err = BbError::not_found("chat abc123");
        let body = err.as_frame_body();
        assert_eq!(body.as_object().unwrap().len(), 1);
        assert!(body["message"].as_str().unwrap().contains("chat abc123"));
    }
}
