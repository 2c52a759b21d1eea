//! Signal match rules.
//!
//! A rule is a conjunction of literal equalities over header fields, e.g.
//! `type='signal',interface='org.alljoyn.Bus',member='SessionLost'`. The
//! `implements` predicate may appear multiple times and is evaluated against
//! an announcement's interface list rather than a header field.

use meshbus_core::status::Status;

use crate::args::MsgArg;
use crate::message::{Message, MessageType};

/// A parsed match rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    /// Required message type, if constrained.
    pub msg_type: Option<MessageType>,
    /// Required sender.
    pub sender: Option<String>,
    /// Required interface.
    pub interface: Option<String>,
    /// Required member.
    pub member: Option<String>,
    /// Required object path.
    pub path: Option<String>,
    /// Required destination.
    pub destination: Option<String>,
    /// Required sessionless flag.
    pub sessionless: Option<bool>,
    /// Required announced interfaces (`implements` predicates).
    pub implements: Vec<String>,
}

impl MatchRule {
    /// Parses a rule string.
    ///
    /// # Errors
    ///
    /// Returns [`Status::BadArg`]\(1\) on malformed input or an unknown key.
    pub fn parse(rule: &str) -> Result<Self, Status> {
        let mut parsed = Self::default();
        for clause in split_clauses(rule) {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let (key, raw_value) = clause.split_once('=').ok_or(Status::BadArg(1))?;
            let value = raw_value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .ok_or(Status::BadArg(1))?;
            match key.trim() {
                "type" => {
                    parsed.msg_type = Some(match value {
                        "signal" => MessageType::Signal,
                        "method_call" => MessageType::MethodCall,
                        "method_return" => MessageType::MethodReturn,
                        "error" => MessageType::Error,
                        _ => return Err(Status::BadArg(1)),
                    });
                }
                "sender" => parsed.sender = Some(value.to_string()),
                "interface" => parsed.interface = Some(value.to_string()),
                "member" => parsed.member = Some(value.to_string()),
                "path" => parsed.path = Some(value.to_string()),
                "destination" => parsed.destination = Some(value.to_string()),
                "sessionless" => {
                    parsed.sessionless = Some(match value {
                        "t" | "true" => true,
                        "f" | "false" => false,
                        _ => return Err(Status::BadArg(1)),
                    });
                }
                "implements" => parsed.implements.push(value.to_string()),
                _ => return Err(Status::BadArg(1)),
            }
        }
        Ok(parsed)
    }

    /// Evaluates the rule against a message.
    #[must_use]
    pub fn is_match(&self, msg: &Message) -> bool {
        if self.msg_type.is_some_and(|t| t != msg.msg_type()) {
            return false;
        }
        if self.sender.as_deref().is_some_and(|s| s != msg.sender()) {
            return false;
        }
        if self
            .interface
            .as_deref()
            .is_some_and(|i| i != msg.interface())
        {
            return false;
        }
        if self.member.as_deref().is_some_and(|m| m != msg.member()) {
            return false;
        }
        if self.path.as_deref().is_some_and(|p| p != msg.path()) {
            return false;
        }
        if self
            .destination
            .as_deref()
            .is_some_and(|d| d != msg.destination())
        {
            return false;
        }
        if self
            .sessionless
            .is_some_and(|required| required != msg.is_sessionless())
        {
            return false;
        }
        if !self.implements.is_empty() && !self.implements_match(msg) {
            return false;
        }
        true
    }

    /// Checks the `implements` predicates against an announcement's object
    /// description (`a(oas)`, the third announce argument).
    fn implements_match(&self, msg: &Message) -> bool {
        let Some(description) = msg.args().get(2).and_then(MsgArg::as_array) else {
            return false;
        };
        self.implements.iter().all(|required| {
            description.iter().any(|entry| match entry {
                MsgArg::Struct(fields) => fields
                    .get(1)
                    .and_then(MsgArg::as_array)
                    .is_some_and(|ifaces| {
                        ifaces.iter().any(|i| i.as_str() == Some(required))
                    }),
                _ => false,
            })
        })
    }

    /// Canonical string form, suitable for `AddMatch`.
    #[must_use]
    pub fn to_rule_string(&self) -> String {
        let mut clauses: Vec<String> = Vec::new();
        if let Some(t) = self.msg_type {
            clauses.push(format!("type='{}'", t.rule_token()));
        }
        if let Some(s) = &self.sender {
            clauses.push(format!("sender='{s}'"));
        }
        if let Some(i) = &self.interface {
            clauses.push(format!("interface='{i}'"));
        }
        if let Some(m) = &self.member {
            clauses.push(format!("member='{m}'"));
        }
        if let Some(p) = &self.path {
            clauses.push(format!("path='{p}'"));
        }
        if let Some(d) = &self.destination {
            clauses.push(format!("destination='{d}'"));
        }
        if let Some(sl) = self.sessionless {
            clauses.push(format!("sessionless='{}'", if sl { "t" } else { "f" }));
        }
        for i in &self.implements {
            clauses.push(format!("implements='{i}'"));
        }
        clauses.join(",")
    }
}

/// Splits on commas that sit outside quoted values.
fn split_clauses(rule: &str) -> Vec<&str> {
    let mut clauses = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    for (idx, c) in rule.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            ',' if !in_quote => {
                clauses.push(&rule[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    clauses.push(&rule[start..]);
    clauses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::flags;

    fn signal(interface: &str, member: &str, sessionless: bool) -> Message {
        Message::signal(
            1,
            ":1.1",
            "",
            "/obj",
            interface,
            member,
            vec![],
            if sessionless { flags::SESSIONLESS } else { 0 },
            0,
        )
    }

    #[test]
    fn test_parse_standing_rule() {
        let rule = MatchRule::parse("type='signal',interface='org.freedesktop.DBus'").unwrap();
        assert_eq!(rule.msg_type, Some(MessageType::Signal));
        assert_eq!(rule.interface.as_deref(), Some("org.freedesktop.DBus"));
        assert!(rule.member.is_none());
    }

    #[test]
    fn test_type_and_member_exactness() {
        let rule = MatchRule::parse("type='signal',interface='a.b',member='M'").unwrap();
        assert!(rule.is_match(&signal("a.b", "M", false)));
        assert!(!rule.is_match(&signal("a.b", "N", false)));
        assert!(!rule.is_match(&signal("a.c", "M", false)));

        // Argument contents are irrelevant.
        let with_args = Message::signal(
            2,
            ":1.9",
            "",
            "/other",
            "a.b",
            "M",
            vec![MsgArg::Uint32(5), MsgArg::String("x".into())],
            0,
            0,
        );
        assert!(rule.is_match(&with_args));
    }

    #[test]
    fn test_sessionless_flag() {
        let rule =
            MatchRule::parse("type='signal',interface='a.b',member='M',sessionless='t'").unwrap();
        assert!(rule.is_match(&signal("a.b", "M", true)));
        assert!(!rule.is_match(&signal("a.b", "M", false)));
    }

    #[test]
    fn test_implements_predicate() {
        let rule = MatchRule::parse(
            "type='signal',interface='org.alljoyn.About',member='Announce',sessionless='t',implements='sample.secure.Door'",
        )
        .unwrap();

        let description = MsgArg::Array(
            "(oas)".to_string(),
            vec![MsgArg::Struct(vec![
                MsgArg::ObjectPath("/door".to_string()),
                MsgArg::Array(
                    "s".to_string(),
                    vec![MsgArg::String("sample.secure.Door".to_string())],
                ),
            ])],
        );
        let announce = Message::signal(
            3,
            ":1.4",
            "",
            "/About",
            "org.alljoyn.About",
            "Announce",
            vec![
                MsgArg::Uint16(1),
                MsgArg::Uint16(42),
                description,
                crate::args::dict_sv(vec![]),
            ],
            flags::SESSIONLESS,
            0,
        );
        assert!(rule.is_match(&announce));

        let other_rule = MatchRule::parse(
            "type='signal',interface='org.alljoyn.About',member='Announce',sessionless='t',implements='other.Iface'",
        )
        .unwrap();
        assert!(!other_rule.is_match(&announce));
    }

    #[test]
    fn test_round_trip_string() {
        let text = "type='signal',interface='org.alljoyn.Bus',member='SessionLost'";
        let rule = MatchRule::parse(text).unwrap();
        assert_eq!(rule.to_rule_string(), text);
    }

    #[test]
    fn test_malformed_rules() {
        assert!(MatchRule::parse("type=signal").is_err());
        assert!(MatchRule::parse("bogus='x'").is_err());
        assert!(MatchRule::parse("type='telegram'").is_err());
    }
}
