//! Property-based tests for backoff, classification and cache bounds.

use proptest::prelude::*;
use tether_session::ErrorKind;

/// Messages the classifier is known to recognise, paired with the kind they map to.
pub const KNOWN_MESSAGES: &[(&str, ErrorKind)] = &[
    ("connect ETIMEDOUT 10.0.0.1:22", ErrorKind::NetworkTimeout),
    ("connect ECONNREFUSED 10.0.0.1:22", ErrorKind::ConnectionRefused),
    ("No route to host", ErrorKind::HostUnreachable),
    ("getaddrinfo ENOTFOUND example.invalid", ErrorKind::DnsResolutionFailed),
    ("read ECONNRESET", ErrorKind::NetworkTimeout),
    ("All configured authentication methods failed", ErrorKind::AuthenticationFailed),
    ("Permission denied (publickey)", ErrorKind::PermissionDenied),
    ("No such file", ErrorKind::FileNotFound),
    ("Read-only file system", ErrorKind::FilePermissionDenied),
    ("Disk quota exceeded", ErrorKind::SftpError),
];

/// Strategy for arbitrary error codes, mixing known errno names with noise.
pub fn error_code() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some("ECONNRESET".to_string())),
        Just(Some("EACCES".to_string())),
        Just(Some("ENOENT".to_string())),
        "[A-Z]{1,8}".prop_map(Some),
    ]
}
