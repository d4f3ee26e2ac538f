//! Error classification.
//!
//! Maps a raw transport error (message text plus optional errno-style code) onto
//! an [`ErrorKind`] with canned troubleshooting guidance. Classification is a
//! pure, total function: anything unrecognised becomes [`ErrorKind::Unknown`].

use crate::transport::RawError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTimeout,
    ConnectionRefused,
    HostUnreachable,
    DnsResolutionFailed,
    AuthenticationFailed,
    PermissionDenied,
    KeyRejected,
    PasswordRejected,
    ProtocolError,
    VersionMismatch,
    FileNotFound,
    FilePermissionDenied,
    SftpError,
    ConfigurationError,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 15] = [
        ErrorKind::NetworkTimeout,
        ErrorKind::ConnectionRefused,
        ErrorKind::HostUnreachable,
        ErrorKind::DnsResolutionFailed,
        ErrorKind::AuthenticationFailed,
        ErrorKind::PermissionDenied,
        ErrorKind::KeyRejected,
        ErrorKind::PasswordRejected,
        ErrorKind::ProtocolError,
        ErrorKind::VersionMismatch,
        ErrorKind::FileNotFound,
        ErrorKind::FilePermissionDenied,
        ErrorKind::SftpError,
        ErrorKind::ConfigurationError,
        ErrorKind::Unknown,
    ];

    /// Transient network conditions that reconnection and replay can recover from.
    pub fn is_network(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTimeout
                | ErrorKind::ConnectionRefused
                | ErrorKind::HostUnreachable
                | ErrorKind::DnsResolutionFailed
        )
    }

    /// Credential or policy failures that no retry can fix.
    pub fn is_credential(self) -> bool {
        matches!(
            self,
            ErrorKind::AuthenticationFailed
                | ErrorKind::PermissionDenied
                | ErrorKind::KeyRejected
                | ErrorKind::PasswordRejected
                | ErrorKind::ConfigurationError
        )
    }

    pub fn is_file_system(self) -> bool {
        matches!(
            self,
            ErrorKind::FileNotFound | ErrorKind::FilePermissionDenied | ErrorKind::SftpError
        )
    }

    pub fn summary(self) -> &'static str {
        match self {
            ErrorKind::NetworkTimeout => "Connection timed out while trying to reach the server",
            ErrorKind::ConnectionRefused => "Connection refused by the server",
            ErrorKind::HostUnreachable => "Host is unreachable",
            ErrorKind::DnsResolutionFailed => "Could not resolve the host name",
            ErrorKind::AuthenticationFailed => "Authentication failed",
            ErrorKind::PermissionDenied => "Permission denied by the server",
            ErrorKind::KeyRejected => "The server rejected the SSH key",
            ErrorKind::PasswordRejected => "The server rejected the password",
            ErrorKind::ProtocolError => "SSH protocol error during the handshake",
            ErrorKind::VersionMismatch => "Incompatible SSH protocol version",
            ErrorKind::FileNotFound => "The remote file or directory does not exist",
            ErrorKind::FilePermissionDenied => "Not allowed to modify the remote file or directory",
            ErrorKind::SftpError => "The remote file operation failed",
            ErrorKind::ConfigurationError => "The connection configuration is invalid",
            ErrorKind::Unknown => "Unexpected error",
        }
    }

    pub fn troubleshooting_steps(self) -> &'static [&'static str] {
        match self {
            ErrorKind::NetworkTimeout => &[
                "Check that the remote host is online and reachable",
                "Verify your network connection is stable",
                "Increase the connection timeout if the network is slow",
                "Check whether a firewall or VPN is dropping the connection",
            ],
            ErrorKind::ConnectionRefused => &[
                "Verify the SSH server is running on the remote host",
                "Check that the port number is correct",
                "Make sure a firewall is not blocking the SSH port",
            ],
            ErrorKind::HostUnreachable => &[
                "Verify the host name or IP address is correct",
                "Check your network routing and VPN settings",
                "Try reaching the host with ping or traceroute",
            ],
            ErrorKind::DnsResolutionFailed => &[
                "Check the host name for typos",
                "Verify your DNS server settings",
                "Try connecting with the IP address instead",
            ],
            ErrorKind::AuthenticationFailed => &[
                "Verify the username is correct",
                "Check that the selected authentication method is allowed by the server",
                "Confirm your credentials have not expired",
                "Review the server's auth log for details",
            ],
            ErrorKind::PermissionDenied => &[
                "Verify the account is allowed to log in over SSH",
                "Check AllowUsers and DenyUsers in the server's sshd_config",
                "Confirm the remote account is not locked",
            ],
            ErrorKind::KeyRejected => &[
                "Make sure the public key is in the remote authorized_keys file",
                "Check permissions on ~/.ssh (700) and authorized_keys (600)",
                "Verify the key type is accepted by the server",
                "Check that the passphrase for the key is correct",
            ],
            ErrorKind::PasswordRejected => &[
                "Re-enter the password and check for typos",
                "Check whether the password has expired",
                "Verify password authentication is enabled on the server",
            ],
            ErrorKind::ProtocolError => &[
                "Check that the server speaks SSH on the configured port",
                "Update the SSH server to a current release",
                "Look for proxies or middleboxes interfering with the connection",
            ],
            ErrorKind::VersionMismatch => &[
                "Update the SSH server to a version that supports SSH-2",
                "Check the server's allowed ciphers and key exchange algorithms",
                "Contact the server administrator about supported protocol versions",
            ],
            ErrorKind::FileNotFound => &[
                "Check the remote path for typos",
                "Verify the file was not moved or deleted",
                "Refresh the directory listing",
            ],
            ErrorKind::FilePermissionDenied => &[
                "Check ownership and permissions of the remote file",
                "Verify the filesystem is not mounted read-only",
                "Make sure directories are empty before removing them",
            ],
            ErrorKind::SftpError => &[
                "Check free disk space and quota on the remote host",
                "Verify the SFTP subsystem is enabled on the server",
                "Check the remote open-file limit",
                "Retry the operation",
            ],
            ErrorKind::ConfigurationError => &[
                "Check host, port and username in the connection settings",
                "Verify the private key path or agent socket exists",
                "Make sure the required password or key is configured",
            ],
            ErrorKind::Unknown => &[
                "Retry the operation",
                "Check the log output for details",
                "Reconnect to the remote host",
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::HostUnreachable => "host_unreachable",
            ErrorKind::DnsResolutionFailed => "dns_resolution_failed",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::KeyRejected => "key_rejected",
            ErrorKind::PasswordRejected => "password_rejected",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::VersionMismatch => "version_mismatch",
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::FilePermissionDenied => "file_permission_denied",
            ErrorKind::SftpError => "sftp_error",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Rule {
    kind: ErrorKind,
    phrases: &'static [&'static str],
    codes: &'static [&'static str],
}

// First match wins.
const RULES: &[Rule] = &[
    Rule {
        kind: ErrorKind::NetworkTimeout,
        phrases: &["timed out", "timeout", "etimedout"],
        codes: &["ETIMEDOUT"],
    },
    Rule {
        kind: ErrorKind::ConnectionRefused,
        phrases: &["connection refused", "econnrefused"],
        codes: &["ECONNREFUSED"],
    },
    Rule {
        kind: ErrorKind::HostUnreachable,
        phrases: &["host unreachable", "no route to host", "ehostunreach"],
        codes: &["EHOSTUNREACH"],
    },
    Rule {
        kind: ErrorKind::DnsResolutionFailed,
        phrases: &[
            "getaddrinfo",
            "enotfound",
            "name or service not known",
            "could not resolve",
            "dns",
        ],
        codes: &["ENOTFOUND", "EAI_AGAIN"],
    },
    Rule {
        kind: ErrorKind::NetworkTimeout,
        phrases: &[
            "network",
            "connection reset",
            "econnreset",
            "broken pipe",
            "epipe",
            "socket hang up",
            "connection aborted",
        ],
        codes: &["ENETUNREACH", "ECONNRESET", "EPIPE", "ECONNABORTED"],
    },
    Rule {
        kind: ErrorKind::AuthenticationFailed,
        phrases: &[
            "authentication failed",
            "auth failed",
            "all configured authentication methods failed",
        ],
        codes: &[],
    },
    Rule {
        kind: ErrorKind::PermissionDenied,
        phrases: &["permission denied", "operation not permitted"],
        codes: &["EACCES", "EPERM"],
    },
    Rule {
        kind: ErrorKind::KeyRejected,
        phrases: &["key rejected", "key was rejected", "invalid key", "publickey rejected"],
        codes: &[],
    },
    Rule {
        kind: ErrorKind::PasswordRejected,
        phrases: &["password rejected", "incorrect password", "wrong password"],
        codes: &[],
    },
    Rule {
        kind: ErrorKind::ProtocolError,
        phrases: &["protocol error", "handshake"],
        codes: &[],
    },
    Rule {
        kind: ErrorKind::VersionMismatch,
        phrases: &["version mismatch", "incompatible version", "unsupported protocol version"],
        codes: &[],
    },
    Rule {
        kind: ErrorKind::FileNotFound,
        phrases: &["no such file", "enoent"],
        codes: &["ENOENT"],
    },
    Rule {
        kind: ErrorKind::FilePermissionDenied,
        phrases: &["read-only file system", "directory not empty", "erofs", "enotempty"],
        codes: &["EROFS", "ENOTEMPTY"],
    },
    Rule {
        kind: ErrorKind::SftpError,
        phrases: &[
            "file exists",
            "disk quota",
            "no space left",
            "disk full",
            "too many open files",
            "file too large",
            "invalid argument",
            "sftp",
        ],
        codes: &["EEXIST", "EDQUOT", "ENOSPC", "EMFILE", "ENFILE", "EFBIG", "EINVAL"],
    },
];

/// Classifies a raw error by message text and optional machine code.
pub fn classify(message: &str, code: Option<&str>) -> ErrorKind {
    let message = message.to_lowercase();
    let code = code.map(|c| c.trim().to_uppercase());

    RULES
        .iter()
        .find(|rule| {
            rule.phrases.iter().any(|phrase| message.contains(phrase))
                || code
                    .as_deref()
                    .map_or(false, |c| rule.codes.iter().any(|known| *known == c))
        })
        .map_or(ErrorKind::Unknown, |rule| rule.kind)
}

pub fn classify_raw(raw: &RawError) -> ErrorKind {
    classify(&raw.message, raw.code.as_deref())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A classified error as surfaced to callers and persisted with connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub troubleshooting: Vec<String>,
    pub timestamp_ms: u64,
    pub connection_id: Option<String>,
    /// Text of the underlying error, kept for diagnostics only.
    pub source: Option<String>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, source: impl Into<String>, connection_id: Option<&str>) -> Self {
        let source = source.into();
        let message = match kind {
            ErrorKind::Unknown if !source.is_empty() => {
                format!("{}: {}", kind.summary(), source)
            }
            _ => kind.summary().to_string(),
        };
        Self {
            kind,
            message,
            troubleshooting: kind
                .troubleshooting_steps()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timestamp_ms: now_ms(),
            connection_id: connection_id.map(str::to_string),
            source: if source.is_empty() { None } else { Some(source) },
        }
    }

    pub fn classify(raw: &RawError, connection_id: Option<&str>) -> Self {
        Self::new(classify_raw(raw), raw.to_string(), connection_id)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_network()
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Markdown troubleshooting report for a "Show Details" action.
pub fn render_troubleshooting(record: &ErrorRecord) -> String {
    let mut out = format!("## {}\n\n", record.message);
    if let Some(id) = &record.connection_id {
        out.push_str(&format!("Connection: `{}`\n\n", id));
    }
    out.push_str("### Troubleshooting steps\n\n");
    for (i, step) in record.troubleshooting.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, step));
    }
    if let Some(source) = &record.source {
        out.push_str(&format!("\n### Details\n\n```\n{}\n```\n", source));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        assert_eq!(classify("Timed out while waiting for handshake", None), ErrorKind::NetworkTimeout);
    }

    #[test]
    fn test_codes_without_message() {
        assert_eq!(classify("", Some("ECONNREFUSED")), ErrorKind::ConnectionRefused);
        assert_eq!(classify("", Some("EHOSTUNREACH")), ErrorKind::HostUnreachable);
        assert_eq!(classify("", Some("ENOTFOUND")), ErrorKind::DnsResolutionFailed);
        assert_eq!(classify("", Some("ECONNRESET")), ErrorKind::NetworkTimeout);
        assert_eq!(classify("", Some("ENOENT")), ErrorKind::FileNotFound);
        assert_eq!(classify("", Some("ENOSPC")), ErrorKind::SftpError);
        assert_eq!(classify("", Some("erofs")), ErrorKind::FilePermissionDenied);
    }

    #[test]
    fn test_dns_failure() {
        assert_eq!(
            classify("getaddrinfo ENOTFOUND example.invalid", None),
            ErrorKind::DnsResolutionFailed
        );
    }

    #[test]
    fn test_broken_pipe_is_network() {
        let kind = classify("write EPIPE: broken pipe", None);
        assert_eq!(kind, ErrorKind::NetworkTimeout);
        assert!(kind.is_network());
    }

    #[test]
    fn test_authentication_failure() {
        assert_eq!(
            classify("All configured authentication methods failed", None),
            ErrorKind::AuthenticationFailed
        );
    }

    #[test]
    fn test_precedence_timeout_before_auth() {
        assert_eq!(
            classify("authentication failed: timed out", None),
            ErrorKind::NetworkTimeout
        );
    }

    #[test]
    fn test_key_and_password_rejections() {
        assert_eq!(classify("Key rejected by server", None), ErrorKind::KeyRejected);
        assert_eq!(classify("Password rejected", None), ErrorKind::PasswordRejected);
    }

    #[test]
    fn test_protocol_and_version() {
        assert_eq!(classify("Protocol error: bad packet", None), ErrorKind::ProtocolError);
        assert_eq!(classify("Version mismatch: SSH-1.5", None), ErrorKind::VersionMismatch);
    }

    #[test]
    fn test_file_errors() {
        assert_eq!(classify("No such file", None), ErrorKind::FileNotFound);
        assert_eq!(classify("Directory not empty", None), ErrorKind::FilePermissionDenied);
        assert_eq!(classify("Disk quota exceeded", None), ErrorKind::SftpError);
        assert_eq!(classify("SFTP failure", None), ErrorKind::SftpError);
    }

    #[test]
    fn test_eacces_is_permission_denied() {
        assert_eq!(classify("open failed", Some("EACCES")), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_unrecognized_is_unknown() {
        assert_eq!(classify("the flux capacitor overheated", None), ErrorKind::Unknown);
        assert_eq!(classify("", None), ErrorKind::Unknown);
        assert_eq!(classify("", Some("E_WHATEVER")), ErrorKind::Unknown);
    }

    #[test]
    fn test_every_kind_has_three_or_four_steps() {
        for kind in ErrorKind::ALL {
            let n = kind.troubleshooting_steps().len();
            assert!((3..=4).contains(&n), "{} has {} steps", kind, n);
        }
    }

    #[test]
    fn test_kind_classes_are_disjoint() {
        for kind in ErrorKind::ALL {
            let classes = [kind.is_network(), kind.is_credential(), kind.is_file_system()];
            assert!(classes.iter().filter(|c| **c).count() <= 1, "{}", kind);
        }
    }

    #[test]
    fn test_record_uses_summary_not_raw_text() {
        let raw = RawError::with_code("connect ECONNREFUSED 10.0.0.1:22", "ECONNREFUSED");
        let record = ErrorRecord::classify(&raw, Some("c1"));
        assert_eq!(record.kind, ErrorKind::ConnectionRefused);
        assert_eq!(record.message, "Connection refused by the server");
        assert_eq!(record.source.as_deref(), Some("connect ECONNREFUSED 10.0.0.1:22"));
        assert_eq!(record.connection_id.as_deref(), Some("c1"));
        assert_eq!(record.troubleshooting.len(), 3);
        assert!(record.is_retryable());
    }

    #[test]
    fn test_unknown_record_keeps_raw_text() {
        let record = ErrorRecord::new(ErrorKind::Unknown, "weird", None);
        assert_eq!(record.message, "Unexpected error: weird");
        assert!(!record.is_retryable());
    }

    #[test]
    fn test_render_troubleshooting_lists_steps() {
        let record = ErrorRecord::new(ErrorKind::KeyRejected, "key rejected", Some("c9"));
        let report = render_troubleshooting(&record);
        assert!(report.starts_with("## The server rejected the SSH key"));
        assert!(report.contains("Connection: `c9`"));
        assert!(report.contains("1. Make sure the public key"));
        assert!(report.contains("4. Check that the passphrase"));
        assert!(report.contains("key rejected"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DnsResolutionFailed).unwrap();
        assert_eq!(json, "\"dns_resolution_failed\"");
    }
}
