//! Broker channel naming.

/// Default prefix for all Tool Meister channels.
pub const DEFAULT_CHANNEL_PREFIX: &str = "tool-meister";

/// Suffix of the command channel (client -> participants).
const COMMAND_SUFFIX: &str = "chan";

/// Suffix of the client-status channel (participants -> client).
const STATUS_SUFFIX: &str = "client";

/// The pair of channels used by one control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    /// Channel every participant listens on for commands
    pub command: String,

    /// Channel the client listens on for status reports
    pub status: String,
}

impl ChannelNames {
    /// Derives both channel names from a prefix.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            command: format!("{prefix}-{COMMAND_SUFFIX}"),
            status: format!("{prefix}-{STATUS_SUFFIX}"),
        }
    }
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_CHANNEL_PREFIX)
    }
}
