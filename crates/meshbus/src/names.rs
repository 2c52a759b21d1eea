//! Well-known names, object paths, flags, and disposition codes of the
//! control plane.
//!
//! These are wire-visible contracts: the bus controller's names, the fixed
//! signal set registered at connect time, and the disposition tables that
//! control-plane replies carry.

/// Protocol version this runtime announces and requires of remote daemons.
pub const PROTOCOL_VERSION: u32 = 12;

/// Bus name and interface of the DBus controller.
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
/// Well-known name of the DBus controller.
pub const DBUS_WELL_KNOWN_NAME: &str = "org.freedesktop.DBus";
/// Object path of the DBus controller.
pub const DBUS_OBJECT_PATH: &str = "/org/freedesktop/DBus";

/// Interface of the bus controller.
pub const BUS_INTERFACE: &str = "org.alljoyn.Bus";
/// Well-known name of the bus controller.
pub const BUS_WELL_KNOWN_NAME: &str = "org.alljoyn.Bus";
/// Object path of the bus controller.
pub const BUS_OBJECT_PATH: &str = "/org/alljoyn/Bus";

/// The peer interface answered locally by every endpoint.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
/// The properties interface answered by bus objects.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
/// The about interface carrying announcements.
pub const ABOUT_INTERFACE: &str = "org.alljoyn.About";
/// The application interface carrying claim-state signals.
pub const APPLICATION_INTERFACE: &str = "org.alljoyn.Bus.Application";

/// Standing match rule for DBus control signals, added at connect time.
pub const DBUS_MATCH_RULE: &str = "type='signal',interface='org.freedesktop.DBus'";
/// Standing match rule for bus control signals, added at connect time.
pub const BUS_MATCH_RULE: &str = "type='signal',interface='org.alljoyn.Bus'";
/// Match rule added by application-state listener registration.
pub const STATE_MATCH_RULE: &str =
    "type='signal',interface='org.alljoyn.Bus.Application',member='State',sessionless='t'";
/// Base match rule `WhoImplements` extends with `implements` predicates.
pub const ANNOUNCE_MATCH_RULE: &str =
    "type='signal',interface='org.alljoyn.About',member='Announce',sessionless='t'";

/// Default deadline for synchronous control-plane method calls.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 25_000;
/// Default deadline for `JoinSession`.
pub const JOIN_SESSION_TIMEOUT_MS: u64 = 90_000;

// ----------------------------------------------------------------------
// RequestName / ReleaseName
// ----------------------------------------------------------------------

/// RequestName flag: allow another request to replace this ownership.
pub const NAME_FLAG_ALLOW_REPLACEMENT: u32 = 0x01;
/// RequestName flag: replace the existing owner if it allows replacement.
pub const NAME_FLAG_REPLACE_EXISTING: u32 = 0x02;
/// RequestName flag: fail instead of queueing when the name is owned.
pub const NAME_FLAG_DO_NOT_QUEUE: u32 = 0x04;

/// RequestName: the caller is now the primary owner.
pub const REQUEST_NAME_REPLY_PRIMARY_OWNER: u32 = 1;
/// RequestName: the request was queued behind the current owner.
pub const REQUEST_NAME_REPLY_IN_QUEUE: u32 = 2;
/// RequestName: the name is owned and queueing was not requested.
pub const REQUEST_NAME_REPLY_EXISTS: u32 = 3;
/// RequestName: the caller already owns the name.
pub const REQUEST_NAME_REPLY_ALREADY_OWNER: u32 = 4;

/// ReleaseName: the name was released.
pub const RELEASE_NAME_REPLY_RELEASED: u32 = 1;
/// ReleaseName: the name has no owner.
pub const RELEASE_NAME_REPLY_NON_EXISTENT: u32 = 2;
/// ReleaseName: the caller does not own the name.
pub const RELEASE_NAME_REPLY_NOT_OWNER: u32 = 3;

// ----------------------------------------------------------------------
// Sessions
// ----------------------------------------------------------------------

/// BindSessionPort: the port is bound.
pub const BIND_REPLY_SUCCESS: u32 = 1;
/// BindSessionPort: the port is already bound.
pub const BIND_REPLY_ALREADY_EXISTS: u32 = 2;
/// BindSessionPort: invalid session options.
pub const BIND_REPLY_INVALID_OPTS: u32 = 3;
/// BindSessionPort: unspecified failure.
pub const BIND_REPLY_FAILED: u32 = 4;

/// UnbindSessionPort: the port was unbound.
pub const UNBIND_REPLY_SUCCESS: u32 = 1;
/// UnbindSessionPort: the port was not bound by the caller.
pub const UNBIND_REPLY_BAD_PORT: u32 = 2;

/// JoinSession: joined.
pub const JOIN_REPLY_SUCCESS: u32 = 1;
/// JoinSession: no session bound at the port.
pub const JOIN_REPLY_NO_SESSION: u32 = 2;
/// JoinSession: host unreachable.
pub const JOIN_REPLY_UNREACHABLE: u32 = 3;
/// JoinSession: connecting to the host failed.
pub const JOIN_REPLY_CONNECT_FAILED: u32 = 4;
/// JoinSession: the host rejected the joiner.
pub const JOIN_REPLY_REJECTED: u32 = 5;
/// JoinSession: incompatible session options.
pub const JOIN_REPLY_BAD_SESSION_OPTS: u32 = 6;
/// JoinSession: already joined.
pub const JOIN_REPLY_ALREADY_JOINED: u32 = 7;
/// JoinSession: unspecified failure.
pub const JOIN_REPLY_FAILED: u32 = 10;

/// LeaveSession: left.
pub const LEAVE_REPLY_SUCCESS: u32 = 1;
/// LeaveSession: no such session.
pub const LEAVE_REPLY_NO_SESSION: u32 = 2;
/// LeaveSession: unspecified failure.
pub const LEAVE_REPLY_FAILED: u32 = 3;

/// RemoveSessionMember: removed.
pub const REMOVE_MEMBER_REPLY_SUCCESS: u32 = 1;
/// RemoveSessionMember: no such session.
pub const REMOVE_MEMBER_REPLY_NO_SESSION: u32 = 2;
/// RemoveSessionMember: the caller is not the binder.
pub const REMOVE_MEMBER_REPLY_NOT_BINDER: u32 = 3;
/// RemoveSessionMember: the session is not multipoint.
pub const REMOVE_MEMBER_REPLY_NOT_MULTIPOINT: u32 = 4;
/// RemoveSessionMember: no such member.
pub const REMOVE_MEMBER_REPLY_NOT_FOUND: u32 = 5;
/// RemoveSessionMember: unspecified failure.
pub const REMOVE_MEMBER_REPLY_FAILED: u32 = 6;

/// SetLinkTimeout: accepted.
pub const SET_LINK_TIMEOUT_REPLY_SUCCESS: u32 = 1;
/// SetLinkTimeout: the destination does not support link timeouts.
pub const SET_LINK_TIMEOUT_REPLY_NO_DEST_SUPPORT: u32 = 2;
/// SetLinkTimeout: no such session.
pub const SET_LINK_TIMEOUT_REPLY_NO_SESSION: u32 = 3;
/// SetLinkTimeout: unspecified failure.
pub const SET_LINK_TIMEOUT_REPLY_FAILED: u32 = 4;

// ----------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------

/// AdvertiseName: advertising.
pub const ADVERTISE_REPLY_SUCCESS: u32 = 1;
/// AdvertiseName: the name is already being advertised.
pub const ADVERTISE_REPLY_ALREADY_ADVERTISING: u32 = 2;
/// AdvertiseName: no transport matched the requested mask.
pub const ADVERTISE_REPLY_TRANSPORT_NOT_AVAILABLE: u32 = 3;
/// AdvertiseName: unspecified failure.
pub const ADVERTISE_REPLY_FAILED: u32 = 4;

/// CancelAdvertiseName: cancelled.
pub const CANCEL_ADVERTISE_REPLY_SUCCESS: u32 = 1;
/// CancelAdvertiseName: unspecified failure.
pub const CANCEL_ADVERTISE_REPLY_FAILED: u32 = 2;

/// FindAdvertisedName: discovering.
pub const FIND_NAME_REPLY_SUCCESS: u32 = 1;
/// FindAdvertisedName: the prefix is already being discovered.
pub const FIND_NAME_REPLY_ALREADY_DISCOVERING: u32 = 2;
/// FindAdvertisedName: unspecified failure.
pub const FIND_NAME_REPLY_FAILED: u32 = 3;

/// CancelFindAdvertisedName: cancelled.
pub const CANCEL_FIND_NAME_REPLY_SUCCESS: u32 = 1;
/// CancelFindAdvertisedName: unspecified failure.
pub const CANCEL_FIND_NAME_REPLY_FAILED: u32 = 2;

// ----------------------------------------------------------------------
// Miscellaneous controller methods
// ----------------------------------------------------------------------

/// Ping: the peer answered.
pub const PING_REPLY_SUCCESS: u32 = 1;
/// Ping: unspecified failure.
pub const PING_REPLY_FAILED: u32 = 2;
/// Ping: the deadline elapsed.
pub const PING_REPLY_TIMEOUT: u32 = 3;
/// Ping: no such name on the bus.
pub const PING_REPLY_UNKNOWN_NAME: u32 = 4;

/// OnAppSuspend/OnAppResume: acknowledged.
pub const APP_STATE_REPLY_SUCCESS: u32 = 1;
/// OnAppSuspend/OnAppResume: unspecified failure.
pub const APP_STATE_REPLY_FAILED: u32 = 2;
/// OnAppSuspend/OnAppResume: the router does not track app state.
pub const APP_STATE_REPLY_NO_SUPPORT: u32 = 3;

/// Checks bus-name legality: either a unique name (`:` prefixed) or a
/// well-known name of two or more dot-separated elements.
#[must_use]
pub fn is_legal_bus_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    let body = name.strip_prefix(':').unwrap_or(name);
    let unique = name.starts_with(':');
    let elements: Vec<&str> = body.split('.').collect();
    if elements.len() < 2 {
        return false;
    }
    elements.iter().all(|e| {
        !e.is_empty()
            && e.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            && (unique || !e.starts_with(|c: char| c.is_ascii_digit()))
    })
}

/// Checks object-path legality: `/`, or `/`-separated non-empty elements of
/// `[A-Za-z0-9_]` with no trailing slash.
#[must_use]
pub fn is_legal_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    path[1..]
        .split('/')
        .all(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// Checks interface-name legality: two or more dot-separated elements that
/// do not start with a digit.
#[must_use]
pub fn is_legal_interface_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    let elements: Vec<&str> = name.split('.').collect();
    if elements.len() < 2 {
        return false;
    }
    elements.iter().all(|e| {
        !e.is_empty()
            && !e.starts_with(|c: char| c.is_ascii_digit())
            && e.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// Checks member-name legality.
#[must_use]
pub fn is_legal_member_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
