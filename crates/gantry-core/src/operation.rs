//! Results of manually requested operations.
//!
//! Callers of manual triggers, reruns, and cancels receive a status category
//! and a message. The boundary layer maps categories to HTTP codes; that
//! mapping lives outside this core, the codes here are advisory.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Ok,
    ValidationFailed,
    Forbidden,
    NotFound,
}

impl OperationStatus {
    pub fn http_code(&self) -> u16 {
        match self {
            OperationStatus::Ok => 200,
            OperationStatus::ValidationFailed => 422,
            OperationStatus::Forbidden => 403,
            OperationStatus::NotFound => 404,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub status: OperationStatus,
    pub message: String,
    pub value: Option<T>,
}

impl<T> OperationResult<T> {
    pub fn ok(message: impl Into<String>, value: T) -> Self {
        Self {
            status: OperationStatus::Ok,
            message: message.into(),
            value: Some(value),
        }
    }

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::ValidationFailed,
            message: message.into(),
            value: None,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::Forbidden,
            message: message.into(),
            value: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: OperationStatus::NotFound,
            message: message.into(),
            value: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OperationStatus::Ok
    }
}
