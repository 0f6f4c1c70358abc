//! Session Roles
//!
//! Every live session sits in exactly one role bucket. New sessions start as
//! [`Role::Pending`] and are promoted once, during the handshake, to the role
//! the peer declares.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Connected but not yet identified through the handshake
    Pending,
    /// Browser UI
    Web,
    /// Video-producing device
    Video,
    /// Motion-control device
    Control,
    /// Telemetry source (GPS, sensors)
    Telemetry,
}

impl Role {
    /// Every role, in stats order
    pub const ALL: [Role; 5] = [
        Role::Web,
        Role::Video,
        Role::Control,
        Role::Telemetry,
        Role::Pending,
    ];

    /// Roles a peer may declare in a handshake
    pub const ASSIGNABLE: [Role; 4] = [Role::Web, Role::Video, Role::Control, Role::Telemetry];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pending => "pending",
            Role::Web => "web",
            Role::Video => "video",
            Role::Control => "control",
            Role::Telemetry => "telemetry",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client type as declared by a peer in `handshake_response`
///
/// Anything outside the known set deserializes to [`DeclaredRole::Unknown`]
/// and is rejected during handshake validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclaredRole {
    Web,
    Video,
    Control,
    Telemetry,
    #[serde(other)]
    Unknown,
}

impl DeclaredRole {
    /// The role this declaration promotes to, if it is valid
    pub fn assignable(self) -> Option<Role> {
        match self {
            DeclaredRole::Web => Some(Role::Web),
            DeclaredRole::Video => Some(Role::Video),
            DeclaredRole::Control => Some(Role::Control),
            DeclaredRole::Telemetry => Some(Role::Telemetry),
            DeclaredRole::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_strings() {
        assert_eq!(Role::Web.as_str(), "web");
        assert_eq!(Role::Video.as_str(), "video");
        assert_eq!(Role::Control.as_str(), "control");
        assert_eq!(Role::Telemetry.as_str(), "telemetry");
        assert_eq!(Role::Pending.to_string(), "pending");
    }

    #[test]
    fn test_role_serializes_snake_case() {
        let json = serde_json::to_string(&Role::Telemetry).unwrap();
        assert_eq!(json, "\"telemetry\"");
    }

    #[test]
    fn test_declared_role_known() {
        let role: DeclaredRole = serde_json::from_str("\"control\"").unwrap();
        assert_eq!(role, DeclaredRole::Control);
        assert_eq!(role.assignable(), Some(Role::Control));
    }

    #[test]
    fn test_declared_role_unknown() {
        let role: DeclaredRole = serde_json::from_str("\"toaster\"").unwrap();
        assert_eq!(role, DeclaredRole::Unknown);
        assert_eq!(role.assignable(), None);

        // Pending is never declarable
        let role: DeclaredRole = serde_json::from_str("\"pending\"").unwrap();
        assert_eq!(role.assignable(), None);
    }

    #[test]
    fn test_assignable_excludes_pending() {
        assert!(!Role::ASSIGNABLE.contains(&Role::Pending));
        assert_eq!(Role::ALL.len(), Role::ASSIGNABLE.len() + 1);
    }
}
