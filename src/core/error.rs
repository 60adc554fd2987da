use thiserror::Error;

/// Error types for the collaborator adapters and the CLI.
///
/// The ruleset model itself never fails: its inputs are validated when they
/// are constructed, so everything here comes from talking to the host.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An external command (iptables, ip, the VPN client) failed
    #[error("command failed: {message}")]
    Command {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Input could not be parsed into a model value
    #[error("Invalid {field}: {message}")]
    Parse { field: String, message: String },

    /// `ip route show default` listed no interface
    #[error("no default route found")]
    NoDefaultRoute,

    /// Snapshot operation failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn parse(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<crate::elevation::ElevationError> for Error {
    fn from(e: crate::elevation::ElevationError) -> Self {
        Self::Elevation(e.to_string())
    }
}

/// Snapshot-specific errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("State directory not available")]
    StateDirUnavailable,
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Known iptables/ip failure messages and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to read firewall rules")
                .with_suggestion("Run as root or configure sudo for iptables")
                .with_suggestion("Force a method with FWEXPECT_ELEVATION_METHOD=sudo")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Or point FWEXPECT_IPTABLES_COMMAND at the binary");
        }

        if lower.contains("table") && lower.contains("does not exist") {
            return ErrorTranslation::new("Netfilter table does not exist")
                .with_suggestion("Load the table module: sudo modprobe iptable_mangle")
                .with_suggestion("Only the mangle and filter tables are compared");
        }

        if lower.contains("chain") && (lower.contains("does not exist") || lower.contains("no chain")) {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Check the chain name: iptables -S lists the existing chains");
        }

        if lower.contains("resource temporarily unavailable") || lower.contains("xtables lock") {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("The VPN daemon may be rewriting its rules right now")
                .with_suggestion("Wait a moment and take the snapshot again");
        }

        if lower.contains("no default route") {
            return ErrorTranslation::new("No default route, cannot discover interfaces")
                .with_suggestion("Check routing: ip route show default")
                .with_suggestion("Pass interfaces explicitly with --interface");
        }

        if lower.contains("daemon") && (lower.contains("not running") || lower.contains("unreachable")) {
            return ErrorTranslation::new("The VPN daemon is not reachable")
                .with_suggestion("Start the daemon: sudo systemctl start nordvpnd")
                .with_suggestion("Or declare the state manually with --connected/--kill-switch");
        }

        ErrorTranslation::new(format!("Firewall probe error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -S")
            .with_help("https://man7.org/linux/man-pages/man8/iptables.8.html")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
