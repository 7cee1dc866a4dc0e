use serde::{Deserialize, Serialize};

/// Result of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Registered,
    /// The launcher already knew about the app. Counts as success.
    AlreadyRegistered,
}
