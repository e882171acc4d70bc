use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// A discrete message for the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
        }
    }

    pub fn call_answered(target: &str) -> Self {
        Self::new("Call Answered", format!("{} answered", target), Severity::Success)
    }

    pub fn call_ended(room_name: &str) -> Self {
        Self::new(
            "Call Ended",
            format!("The call in {} has ended", room_name),
            Severity::Info,
        )
    }

    pub fn call_failed(message: impl Into<String>) -> Self {
        Self::new("Call Failed", message, Severity::Error)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(title, message, Severity::Error)
    }
}

/// Type alias for the notification sender
pub type NotificationSender = tokio::sync::broadcast::Sender<Notification>;

/// Type alias for the notification receiver
pub type NotificationReceiver = tokio::sync::broadcast::Receiver<Notification>;
