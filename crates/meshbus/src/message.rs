//! The DBus-derived message model.
//!
//! A [`Message`] is an immutable header-plus-arguments record; clones share
//! the underlying storage so messages travel through the dispatcher cheaply.
//! Wire marshalling is a transport concern and lives outside this crate.

use std::fmt;
use std::sync::Arc;

use meshbus_core::status::Status;

use crate::args::MsgArg;

/// Message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A method call.
    MethodCall,
    /// A successful method reply.
    MethodReturn,
    /// An error reply.
    Error,
    /// A signal.
    Signal,
}

impl MessageType {
    /// The match-rule token for this type.
    #[must_use]
    pub const fn rule_token(self) -> &'static str {
        match self {
            Self::MethodCall => "method_call",
            Self::MethodReturn => "method_return",
            Self::Error => "error",
            Self::Signal => "signal",
        }
    }
}

/// Header flag bits.
pub mod flags {
    /// The caller does not expect a reply.
    pub const NO_REPLY_EXPECTED: u8 = 0x01;
    /// Auto-start the destination service.
    pub const AUTO_START: u8 = 0x02;
    /// Deliver regardless of session (sessionless signal).
    pub const SESSIONLESS: u8 = 0x10;
    /// Broadcast globally rather than per session.
    pub const GLOBAL_BROADCAST: u8 = 0x20;
    /// The body is (or must be) encrypted.
    pub const ENCRYPTED: u8 = 0x80;
}

#[derive(Debug)]
struct MessageBody {
    msg_type: MessageType,
    flags: u8,
    serial: u32,
    sender: String,
    destination: String,
    path: String,
    interface: String,
    member: String,
    error_name: String,
    reply_serial: u32,
    session_id: u32,
    args: Vec<MsgArg>,
}

/// An immutable bus message.
#[derive(Debug, Clone)]
pub struct Message {
    body: Arc<MessageBody>,
}

impl Message {
    /// Builds a method call.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn method_call(
        serial: u32,
        sender: &str,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
        args: Vec<MsgArg>,
        flags: u8,
        session_id: u32,
    ) -> Self {
        Self {
            body: Arc::new(MessageBody {
                msg_type: MessageType::MethodCall,
                flags,
                serial,
                sender: sender.to_string(),
                destination: destination.to_string(),
                path: path.to_string(),
                interface: interface.to_string(),
                member: member.to_string(),
                error_name: String::new(),
                reply_serial: 0,
                session_id,
                args,
            }),
        }
    }

    /// Builds a method return answering `call`.
    #[must_use]
    pub fn method_return(call: &Message, serial: u32, args: Vec<MsgArg>) -> Self {
        Self {
            body: Arc::new(MessageBody {
                msg_type: MessageType::MethodReturn,
                flags: 0,
                serial,
                sender: call.destination().to_string(),
                destination: call.sender().to_string(),
                path: String::new(),
                interface: String::new(),
                member: String::new(),
                error_name: String::new(),
                reply_serial: call.serial(),
                session_id: call.session_id(),
                args,
            }),
        }
    }

    /// Builds an error reply answering `call`.
    #[must_use]
    pub fn error_reply(call: &Message, serial: u32, error_name: &str, description: &str) -> Self {
        Self::error_raw(
            serial,
            call.destination(),
            call.sender(),
            call.serial(),
            call.session_id(),
            error_name,
            description,
        )
    }

    /// Builds an error reply answering `call` from a status kind.
    #[must_use]
    pub fn error_reply_status(call: &Message, serial: u32, status: Status) -> Self {
        Self::error_reply(call, serial, &status.error_name(), &status.to_string())
    }

    /// Builds a free-standing error message keyed to a reply serial. Used
    /// for internally synthesized timeout and shutdown replies.
    #[must_use]
    pub fn error_for_serial(sender: &str, reply_serial: u32, error_name: &str) -> Self {
        Self::error_raw(0, sender, sender, reply_serial, 0, error_name, "")
    }

    fn error_raw(
        serial: u32,
        sender: &str,
        destination: &str,
        reply_serial: u32,
        session_id: u32,
        error_name: &str,
        description: &str,
    ) -> Self {
        let args = if description.is_empty() {
            vec![]
        } else {
            vec![MsgArg::String(description.to_string())]
        };
        Self {
            body: Arc::new(MessageBody {
                msg_type: MessageType::Error,
                flags: 0,
                serial,
                sender: sender.to_string(),
                destination: destination.to_string(),
                path: String::new(),
                interface: String::new(),
                member: String::new(),
                error_name: error_name.to_string(),
                reply_serial,
                session_id,
                args,
            }),
        }
    }

    /// Builds a signal. An empty destination broadcasts.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn signal(
        serial: u32,
        sender: &str,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
        args: Vec<MsgArg>,
        flags: u8,
        session_id: u32,
    ) -> Self {
        Self {
            body: Arc::new(MessageBody {
                msg_type: MessageType::Signal,
                flags,
                serial,
                sender: sender.to_string(),
                destination: destination.to_string(),
                path: path.to_string(),
                interface: interface.to_string(),
                member: member.to_string(),
                error_name: String::new(),
                reply_serial: 0,
                session_id,
                args,
            }),
        }
    }

    /// Message kind.
    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        self.body.msg_type
    }

    /// Header flags.
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.body.flags
    }

    /// Serial number.
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.body.serial
    }

    /// Sender bus name.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.body.sender
    }

    /// Destination bus name; empty for broadcast.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.body.destination
    }

    /// Object path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.body.path
    }

    /// Interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.body.interface
    }

    /// Member name.
    #[must_use]
    pub fn member(&self) -> &str {
        &self.body.member
    }

    /// Error name (error messages only).
    #[must_use]
    pub fn error_name(&self) -> &str {
        &self.body.error_name
    }

    /// Serial of the call this message answers.
    #[must_use]
    pub fn reply_serial(&self) -> u32 {
        self.body.reply_serial
    }

    /// Session the message belongs to; zero when none.
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.body.session_id
    }

    /// Argument list.
    #[must_use]
    pub fn args(&self) -> &[MsgArg] {
        &self.body.args
    }

    /// Signature derived from the arguments.
    #[must_use]
    pub fn signature(&self) -> String {
        crate::args::args_signature(&self.body.args)
    }

    /// True when the encrypted flag is set.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.body.flags & flags::ENCRYPTED != 0
    }

    /// True when the caller does not expect a reply.
    #[must_use]
    pub fn no_reply_expected(&self) -> bool {
        self.body.flags & flags::NO_REPLY_EXPECTED != 0
    }

    /// True when the sessionless flag is set.
    #[must_use]
    pub fn is_sessionless(&self) -> bool {
        self.body.flags & flags::SESSIONLESS != 0
    }

    /// Human-readable error description (first string argument), for error
    /// messages.
    #[must_use]
    pub fn error_description(&self) -> &str {
        self.body
            .args
            .first()
            .and_then(MsgArg::as_str)
            .unwrap_or_default()
    }

    /// Status kind carried by an error message; `Ok(())`-adjacent types
    /// report no status.
    #[must_use]
    pub fn status(&self) -> Option<Status> {
        match self.body.msg_type {
            MessageType::Error => Some(Status::from_error_name(&self.body.error_name)),
            _ => None,
        }
    }

    /// Re-serializes the message under a new serial, leaving all other
    /// header fields and arguments shared.
    #[must_use]
    pub fn with_serial(&self, serial: u32) -> Self {
        let body = &self.body;
        Self {
            body: Arc::new(MessageBody {
                msg_type: body.msg_type,
                flags: body.flags,
                serial,
                sender: body.sender.clone(),
                destination: body.destination.clone(),
                path: body.path.clone(),
                interface: body.interface.clone(),
                member: body.member.clone(),
                error_name: body.error_name.clone(),
                reply_serial: body.reply_serial,
                session_id: body.session_id,
                args: body.args.clone(),
            }),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.body.msg_type {
            MessageType::MethodCall => write!(
                f,
                "METHOD_CALL[{}] {}.{} @{} -> {}",
                self.body.serial, self.body.interface, self.body.member, self.body.path,
                self.body.destination
            ),
            MessageType::MethodReturn => {
                write!(f, "METHOD_RET[{}] reply-to {}", self.body.serial, self.body.reply_serial)
            }
            MessageType::Error => write!(
                f,
                "ERROR[{}] {} reply-to {}",
                self.body.serial, self.body.error_name, self.body.reply_serial
            ),
            MessageType::Signal => write!(
                f,
                "SIGNAL[{}] {}.{} @{}",
                self.body.serial, self.body.interface, self.body.member, self.body.path
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_call() -> Message {
        Message::method_call(
            7,
            ":1.1",
            ":1.2",
            "/door",
            "sample.secure.Door",
            "Open",
            vec![],
            0,
            0,
        )
    }

    #[test]
    fn test_method_return_addresses_caller() {
        let call = sample_call();
        let reply = Message::method_return(&call, 9, vec![MsgArg::Boolean(true)]);
        assert_eq!(reply.msg_type(), MessageType::MethodReturn);
        assert_eq!(reply.destination(), ":1.1");
        assert_eq!(reply.sender(), ":1.2");
        assert_eq!(reply.reply_serial(), 7);
        assert_eq!(reply.signature(), "b");
    }

    #[test]
    fn test_error_reply_status_carries_wire_name() {
        let call = sample_call();
        let err = Message::error_reply_status(&call, 9, Status::NotEncrypted);
        assert_eq!(err.error_name(), "org.alljoyn.Bus.SecurityViolation");
        assert_eq!(err.status(), Some(Status::NotEncrypted));
        assert!(!err.error_description().is_empty());
    }

    #[test]
    fn test_timeout_error_for_serial() {
        let err = Message::error_for_serial(":1.1", 7, "org.alljoyn.Bus.Timeout");
        assert_eq!(err.msg_type(), MessageType::Error);
        assert_eq!(err.reply_serial(), 7);
        assert_eq!(err.status(), Some(Status::Timeout));
    }

    #[test]
    fn test_flags() {
        let call = Message::method_call(
            1,
            ":1.1",
            ":1.2",
            "/door",
            "i.f",
            "M",
            vec![],
            flags::NO_REPLY_EXPECTED | flags::ENCRYPTED,
            4,
        );
        assert!(call.no_reply_expected());
        assert!(call.is_encrypted());
        assert_eq!(call.session_id(), 4);
    }

    #[test]
    fn test_with_serial_shares_everything_else() {
        let call = sample_call();
        let rekeyed = call.with_serial(100);
        assert_eq!(rekeyed.serial(), 100);
        assert_eq!(rekeyed.member(), call.member());
        assert_eq!(rekeyed.sender(), call.sender());
        assert_eq!(rekeyed.msg_type(), MessageType::MethodCall);
    }
}
