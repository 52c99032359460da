//! Branded identifier newtypes.
//!
//! `OperationId` is generated locally (`op_` + UUIDv7, so ids sort by
//! creation time). The other ids are assigned elsewhere (by the caller's
//! agent directory or by the remote agent) and are only ever wrapped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier string.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

branded_id!(
    /// Caller-generated token for one logical unit of work, shared by every
    /// agent the work is sent to.
    OperationId
);
branded_id!(
    /// Caller-assigned identifier of one remote agent.
    AgentId
);
branded_id!(
    /// Conversation (`contextId`) assigned by the agent on its first response.
    ConversationId
);
branded_id!(
    /// Deferred-work (`taskId`) identifier assigned by the agent.
    WorkId
);

impl OperationId {
    /// Generate a fresh, time-ordered operation id.
    pub fn new() -> Self {
        Self(format!("op_{}", Uuid::now_v7()))
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}
