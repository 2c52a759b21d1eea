//! Status values returned by every synchronous API surface.
//!
//! The runtime reports failures as *kinds*, not nested error types: a single
//! `Copy` enum travels through return values and is handed to callbacks as
//! their first argument. Richer module-local errors (certificate parsing,
//! key-store I/O) convert into a `Status` at the crate boundary.
//!
//! Wire-visible error names are derived from the kind via
//! [`Status::error_name`] and recovered from inbound error messages via
//! [`Status::from_error_name`].

use thiserror::Error;

/// Result alias for APIs that produce a value or a [`Status`].
pub type StatusResult<T> = Result<T, Status>;

/// Failure kinds for the whole bus API surface.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Status {
    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------
    /// The attachment has not been started.
    #[error("bus attachment is not started")]
    NotStarted,
    /// The attachment is already started.
    #[error("bus attachment is already started")]
    AlreadyStarted,
    /// The attachment is stopping; no new work is accepted.
    #[error("bus attachment is stopping")]
    Stopping,
    /// The attachment is not connected to a router.
    #[error("bus attachment is not connected")]
    NotConnected,
    /// The attachment is already connected to a router.
    #[error("bus attachment is already connected")]
    AlreadyConnected,
    /// The local endpoint is closing and refuses new work.
    #[error("endpoint is closing")]
    EndpointClosing,

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------
    /// No interface with the requested name exists.
    #[error("no such interface")]
    NoSuchInterface,
    /// No object is registered at the requested path.
    #[error("no such object")]
    NoSuchObject,
    /// The object implements the interface but not the requested member.
    #[error("no such member")]
    NoSuchMember,
    /// The interface declares no property with the requested name.
    #[error("no such property")]
    NoSuchProperty,
    /// An activated interface with the same name already exists.
    #[error("interface already exists")]
    InterfaceAlreadyExists,
    /// An object is already registered at the requested path.
    #[error("object already exists at this path")]
    ObjectAlreadyExists,
    /// A reply arrived whose serial matches no outstanding method call.
    #[error("unmatched reply serial")]
    UnmatchedReplySerial,

    // ------------------------------------------------------------------
    // Arguments
    // ------------------------------------------------------------------
    /// Argument N (1-based) is invalid.
    #[error("invalid argument {0}")]
    BadArg(u8),
    /// The bus name is not legal.
    #[error("invalid bus name")]
    BadBusName,
    /// The object path is not legal.
    #[error("invalid object path")]
    BadObjectPath,
    /// The string is not a well-formed GUID.
    #[error("invalid GUID")]
    InvalidGuid,
    /// Malformed or unparseable data.
    #[error("invalid data")]
    InvalidData,

    // ------------------------------------------------------------------
    // Security
    // ------------------------------------------------------------------
    /// A message that was required to be encrypted arrived in the clear.
    #[error("message was not encrypted")]
    NotEncrypted,
    /// Message decryption failed.
    #[error("message decryption failed")]
    DecryptionFailed,
    /// The sender is not authorized for this operation.
    #[error("not authorized")]
    NotAuthorized,
    /// The installed policy denies this message.
    #[error("permission denied")]
    PermissionDenied,
    /// No key material is available for the peer.
    #[error("key unavailable")]
    KeyUnavailable,
    /// The requested application-state transition is not allowed.
    #[error("invalid application state")]
    InvalidApplicationState,
    /// The operation requires an application-state listener.
    #[error("application state listener is not registered")]
    ApplicationStateListenerMissing,
    /// Peer security has not been enabled on this attachment.
    #[error("peer security is not enabled")]
    SecurityNotEnabled,
    /// The authentication mechanism name is not registered.
    #[error("invalid authentication mechanism")]
    InvalidAuthMechanism,

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------
    /// JoinSession: no session is bound at the requested port.
    #[error("join failed: no such session")]
    JoinNoSession,
    /// JoinSession: the session host is unreachable.
    #[error("join failed: unreachable host")]
    JoinUnreachable,
    /// JoinSession: connecting to the host failed.
    #[error("join failed: connect failed")]
    JoinConnectFailed,
    /// JoinSession: the host rejected the joiner.
    #[error("join failed: rejected")]
    JoinRejected,
    /// JoinSession: the session is already joined.
    #[error("join failed: already joined")]
    JoinAlreadyJoined,
    /// JoinSession: incompatible session options.
    #[error("join failed: bad session options")]
    JoinBadOpts,
    /// JoinSession: unspecified failure.
    #[error("join failed")]
    JoinFailed,
    /// LeaveSession: no session with the given id on the requested side.
    #[error("leave failed: no such session")]
    LeaveNoSession,
    /// LeaveSession: unspecified failure.
    #[error("leave failed")]
    LeaveFailed,
    /// RemoveSessionMember: caller is not the session binder.
    #[error("remove member failed: not the binder")]
    RemoveMemberNotBinder,
    /// RemoveSessionMember: the session is not multipoint.
    #[error("remove member failed: session is not multipoint")]
    RemoveMemberNotMultipoint,
    /// RemoveSessionMember: no such member in the session.
    #[error("remove member failed: member not found")]
    RemoveMemberNotFound,
    /// RemoveSessionMember: unspecified failure.
    #[error("remove member failed")]
    RemoveMemberFailed,

    // ------------------------------------------------------------------
    // Discovery and names
    // ------------------------------------------------------------------
    /// A discovery operation for the prefix is already in progress.
    #[error("already discovering this prefix")]
    AlreadyDiscovering,
    /// No transport matches the requested connect spec or mask.
    #[error("transport unavailable")]
    TransportUnavailable,
    /// RequestName: the name is owned; the request was queued.
    #[error("name request queued")]
    NameInQueue,
    /// RequestName: the name is owned and queueing was not requested.
    #[error("name exists")]
    NameExists,
    /// RequestName: the caller already owns the name.
    #[error("name already owned by caller")]
    NameAlreadyOwner,
    /// ReleaseName: the caller does not own the name.
    #[error("name not owned by caller")]
    NameNotOwner,
    /// ReleaseName/GetNameOwner: the name has no owner.
    #[error("name has no owner")]
    NameNotFound,
    /// No GUID is known for the peer.
    #[error("no GUID known for peer")]
    NoPeerGuid,

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------
    /// A method call did not receive a reply before its deadline.
    #[error("method call timed out")]
    Timeout,
    /// The reply to a method call was an error message.
    #[error("reply is an error message")]
    ReplyIsError,
    /// A control-plane reply carried an unknown disposition code.
    #[error("unexpected disposition in reply")]
    UnexpectedDisposition,
    /// The remote daemon announced an older protocol version.
    #[error("incompatible remote daemon")]
    IncompatibleDaemon,
    /// A blocking call was attempted from inside a dispatcher callback.
    #[error("blocking call not allowed from a dispatcher callback")]
    BlockingCallNotAllowed,
    /// A timer fired its remaining alarms because it is exiting.
    #[error("timer is exiting")]
    TimerExiting,
    /// A blocked thread was alerted before its wait completed.
    #[error("thread was alerted")]
    AlertedThread,
    /// The operation would deadlock the calling thread.
    #[error("operation would deadlock")]
    Deadlock,

    /// Unspecified failure.
    #[error("operation failed")]
    Fail,
}

/// Wire error name for timed-out method calls.
pub const ERROR_TIMEOUT: &str = "org.alljoyn.Bus.Timeout";
/// Wire error name for calls aborted by attachment shutdown.
pub const ERROR_EXITING: &str = "org.alljoyn.Bus.Exiting";
/// Wire error name for security violations (unencrypted/unauthenticated).
pub const ERROR_SECURITY_VIOLATION: &str = "org.alljoyn.Bus.SecurityViolation";
/// Wire error name for policy-denied calls.
pub const ERROR_PERMISSION_DENIED: &str = "org.alljoyn.Bus.Security.Error.PermissionDenied";
/// Wire error name for calls to unknown object paths.
pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";

impl Status {
    /// Returns true for the kinds reported to the peer security sub-object.
    #[must_use]
    pub const fn is_security_violation(self) -> bool {
        matches!(
            self,
            Self::NotEncrypted | Self::DecryptionFailed | Self::NotAuthorized
        )
    }

    /// Maps this kind to the error name used on the wire when the local
    /// endpoint rejects a method call.
    #[must_use]
    pub fn error_name(self) -> String {
        match self {
            Self::Timeout => ERROR_TIMEOUT.to_string(),
            Self::TimerExiting | Self::Stopping => ERROR_EXITING.to_string(),
            Self::NotEncrypted | Self::DecryptionFailed | Self::NotAuthorized => {
                ERROR_SECURITY_VIOLATION.to_string()
            }
            Self::PermissionDenied => ERROR_PERMISSION_DENIED.to_string(),
            Self::NoSuchObject => ERROR_SERVICE_UNKNOWN.to_string(),
            other => format!("org.alljoyn.Bus.{}", other.kind_name()),
        }
    }

    /// Recovers a kind from a wire error name, if the name is one this
    /// runtime emits. Unknown names map to [`Status::ReplyIsError`].
    #[must_use]
    pub fn from_error_name(name: &str) -> Self {
        match name {
            ERROR_TIMEOUT => Self::Timeout,
            ERROR_EXITING => Self::Stopping,
            ERROR_SECURITY_VIOLATION => Self::NotEncrypted,
            ERROR_PERMISSION_DENIED => Self::PermissionDenied,
            ERROR_SERVICE_UNKNOWN => Self::NoSuchObject,
            "org.alljoyn.Bus.NoSuchInterface" => Self::NoSuchInterface,
            "org.alljoyn.Bus.NoSuchMember" => Self::NoSuchMember,
            "org.alljoyn.Bus.InvalidData" => Self::InvalidData,
            _ => Self::ReplyIsError,
        }
    }

    /// Short PascalCase name of the kind, used in generated error names.
    #[must_use]
    pub const fn kind_name(self) -> &'static str {
        match self {
            Self::NotStarted => "NotStarted",
            Self::AlreadyStarted => "AlreadyStarted",
            Self::Stopping => "Stopping",
            Self::NotConnected => "NotConnected",
            Self::AlreadyConnected => "AlreadyConnected",
            Self::EndpointClosing => "EndpointClosing",
            Self::NoSuchInterface => "NoSuchInterface",
            Self::NoSuchObject => "NoSuchObject",
            Self::NoSuchMember => "NoSuchMember",
            Self::NoSuchProperty => "NoSuchProperty",
            Self::InterfaceAlreadyExists => "InterfaceAlreadyExists",
            Self::ObjectAlreadyExists => "ObjectAlreadyExists",
            Self::UnmatchedReplySerial => "UnmatchedReplySerial",
            Self::BadArg(_) => "BadArg",
            Self::BadBusName => "BadBusName",
            Self::BadObjectPath => "BadObjectPath",
            Self::InvalidGuid => "InvalidGuid",
            Self::InvalidData => "InvalidData",
            Self::NotEncrypted => "NotEncrypted",
            Self::DecryptionFailed => "DecryptionFailed",
            Self::NotAuthorized => "NotAuthorized",
            Self::PermissionDenied => "PermissionDenied",
            Self::KeyUnavailable => "KeyUnavailable",
            Self::InvalidApplicationState => "InvalidApplicationState",
            Self::ApplicationStateListenerMissing => "ApplicationStateListenerMissing",
            Self::SecurityNotEnabled => "SecurityNotEnabled",
            Self::InvalidAuthMechanism => "InvalidAuthMechanism",
            Self::JoinNoSession => "JoinNoSession",
            Self::JoinUnreachable => "JoinUnreachable",
            Self::JoinConnectFailed => "JoinConnectFailed",
            Self::JoinRejected => "JoinRejected",
            Self::JoinAlreadyJoined => "JoinAlreadyJoined",
            Self::JoinBadOpts => "JoinBadOpts",
            Self::JoinFailed => "JoinFailed",
            Self::LeaveNoSession => "LeaveNoSession",
            Self::LeaveFailed => "LeaveFailed",
            Self::RemoveMemberNotBinder => "RemoveMemberNotBinder",
            Self::RemoveMemberNotMultipoint => "RemoveMemberNotMultipoint",
            Self::RemoveMemberNotFound => "RemoveMemberNotFound",
            Self::RemoveMemberFailed => "RemoveMemberFailed",
            Self::AlreadyDiscovering => "AlreadyDiscovering",
            Self::TransportUnavailable => "TransportUnavailable",
            Self::NameInQueue => "NameInQueue",
            Self::NameExists => "NameExists",
            Self::NameAlreadyOwner => "NameAlreadyOwner",
            Self::NameNotOwner => "NameNotOwner",
            Self::NameNotFound => "NameNotFound",
            Self::NoPeerGuid => "NoPeerGuid",
            Self::Timeout => "Timeout",
            Self::ReplyIsError => "ReplyIsError",
            Self::UnexpectedDisposition => "UnexpectedDisposition",
            Self::IncompatibleDaemon => "IncompatibleDaemon",
            Self::BlockingCallNotAllowed => "BlockingCallNotAllowed",
            Self::TimerExiting => "TimerExiting",
            Self::AlertedThread => "AlertedThread",
            Self::Deadlock => "Deadlock",
            Self::Fail => "Fail",
        }
    }
}
