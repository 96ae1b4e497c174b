use serde::{Deserialize, Serialize};

/// A notification as accepted over HTTP and published to the broker.
///
/// Field order is part of the wire format: consumers and fixtures rely on
/// `userId`, `application`, `message` appearing in that order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    pub application: String,
    pub message: String,
}

impl Notification {
    pub fn new(
        user_id: impl Into<String>,
        application: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            application: application.into(),
            message: message.into(),
        }
    }

    /// `<application>.user.<user_id>`, both lowercased.
    ///
    /// The same string names the destination queue and its binding key, so
    /// every (application, user) pair owns exactly one queue. Empty segments
    /// are kept as-is.
    ///
    /// Inputs are not escaped. A `.` adds a segment. A `*` or `#` is a topic
    /// wildcard once the queue is bound with this key. A user id of `#`
    /// therefore gets a queue that also receives every other user's
    /// notifications for the same application.
    pub fn routing_key(&self) -> String {
        format!(
            "{}.user.{}",
            self.application.to_lowercase(),
            self.user_id.to_lowercase()
        )
    }
}
