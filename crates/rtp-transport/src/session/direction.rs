use std::fmt;

use serde::{Deserialize, Serialize};

/// Direction of a media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MediaDirection {
    #[default]
    Inactive,
    RecvOnly,
    SendOnly,
    SendRecv,
}

impl MediaDirection {
    fn from_axes(send: bool, receive: bool) -> Self {
        match (send, receive) {
            (true, true) => MediaDirection::SendRecv,
            (true, false) => MediaDirection::SendOnly,
            (false, true) => MediaDirection::RecvOnly,
            (false, false) => MediaDirection::Inactive,
        }
    }

    pub fn allows_sending(self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::SendRecv)
    }

    pub fn allows_receiving(self) -> bool {
        matches!(self, MediaDirection::RecvOnly | MediaDirection::SendRecv)
    }

    /// Union of both directions
    pub fn or(self, other: MediaDirection) -> MediaDirection {
        Self::from_axes(
            self.allows_sending() || other.allows_sending(),
            self.allows_receiving() || other.allows_receiving(),
        )
    }

    /// Intersection of both directions
    pub fn and(self, other: MediaDirection) -> MediaDirection {
        Self::from_axes(
            self.allows_sending() && other.allows_sending(),
            self.allows_receiving() && other.allows_receiving(),
        )
    }

    /// `self` with the axes of `other` removed
    pub fn and_not(self, other: MediaDirection) -> MediaDirection {
        Self::from_axes(
            self.allows_sending() && !other.allows_sending(),
            self.allows_receiving() && !other.allows_receiving(),
        )
    }

    /// Whether every axis of `other` is also in `self`
    pub fn contains(self, other: MediaDirection) -> bool {
        other.and_not(self) == MediaDirection::Inactive
    }

    /// SDP attribute name
    pub fn as_str(self) -> &'static str {
        match self {
            MediaDirection::Inactive => "inactive",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::SendRecv => "sendrecv",
        }
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
