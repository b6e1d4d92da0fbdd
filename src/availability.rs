// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Server availability as announced on the last-will topic.

use std::fmt;

/// Payload the server publishes on its last-will topic while running.
pub const ONLINE_PAYLOAD: &str = "online";

/// Whether the Open3e server is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    /// No availability message has been seen yet.
    #[default]
    Unknown,
    /// The server announced itself online.
    Online,
    /// The server announced anything other than online.
    Offline,
}

impl Availability {
    /// Interprets a last-will payload.
    ///
    /// # Examples
    ///
    /// ```
    /// use open3e_lib::Availability;
    ///
    /// assert_eq!(Availability::from_payload("online"), Availability::Online);
    /// assert_eq!(Availability::from_payload("offline"), Availability::Offline);
    /// ```
    #[must_use]
    pub fn from_payload(payload: &str) -> Self {
        if payload.trim() == ONLINE_PAYLOAD {
            Self::Online
        } else {
            Self::Offline
        }
    }

    /// Returns true if the server is known to be online.
    #[must_use]
    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}
