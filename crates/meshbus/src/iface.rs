//! Interface descriptions.
//!
//! An interface is a named collection of methods, signals, and properties
//! plus a security policy. It is mutable while being built and becomes
//! immutable once activated; the attachment's registry refuses duplicate
//! activated registrations.

use std::collections::BTreeMap;

use meshbus_core::status::Status;

use crate::names::{is_legal_interface_name, is_legal_member_name};

/// Per-interface message security policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityPolicy {
    /// Follow the object's security (the default).
    #[default]
    Inherit,
    /// Messages on this interface must be encrypted.
    Required,
    /// Security does not apply to this interface, even on secure objects.
    Off,
}

/// Kind of a callable/emittable member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// A method with input and output signatures.
    Method,
    /// A signal with one signature.
    Signal,
}

/// A method or signal member.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    /// Method or signal.
    pub kind: MemberKind,
    /// Member name.
    pub name: String,
    /// Input signature (signal payload signature for signals).
    pub signature: String,
    /// Output signature; empty for signals.
    pub return_signature: String,
    /// Comma-separated argument names, in declaration order.
    pub arg_names: String,
}

/// Property access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropAccess {
    /// Readable only.
    Read,
    /// Writable only.
    Write,
    /// Readable and writable.
    ReadWrite,
}

/// A property member.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// Property name.
    pub name: String,
    /// Value signature.
    pub signature: String,
    /// Access mode.
    pub access: PropAccess,
}

/// A named collection of members with a security policy.
#[derive(Debug, Clone)]
pub struct InterfaceDescription {
    name: String,
    security: SecurityPolicy,
    members: BTreeMap<String, Member>,
    properties: BTreeMap<String, Property>,
    annotations: BTreeMap<String, String>,
    activated: bool,
}

impl InterfaceDescription {
    /// Creates a mutable interface description.
    ///
    /// # Errors
    ///
    /// Returns [`Status::BadArg`]\(1\) if the name is not of the legal
    /// `x.y` form.
    pub fn new(name: &str, security: SecurityPolicy) -> Result<Self, Status> {
        if !is_legal_interface_name(name) {
            return Err(Status::BadArg(1));
        }
        Ok(Self {
            name: name.to_string(),
            security,
            members: BTreeMap::new(),
            properties: BTreeMap::new(),
            annotations: BTreeMap::new(),
            activated: false,
        })
    }

    /// Interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Security policy.
    #[must_use]
    pub const fn security_policy(&self) -> SecurityPolicy {
        self.security
    }

    /// True once activated (immutable).
    #[must_use]
    pub const fn is_activated(&self) -> bool {
        self.activated
    }

    /// Freezes the interface. Idempotent.
    pub fn activate(&mut self) {
        self.activated = true;
    }

    fn check_mutable(&self) -> Result<(), Status> {
        if self.activated {
            // An activated interface is never mutated.
            return Err(Status::InterfaceAlreadyExists);
        }
        Ok(())
    }

    /// Adds a method member.
    ///
    /// # Errors
    ///
    /// Fails when activated, on an illegal member name, or on a duplicate.
    pub fn add_method(
        &mut self,
        name: &str,
        signature: &str,
        return_signature: &str,
        arg_names: &str,
    ) -> Result<(), Status> {
        self.add_member(MemberKind::Method, name, signature, return_signature, arg_names)
    }

    /// Adds a signal member.
    ///
    /// # Errors
    ///
    /// Fails when activated, on an illegal member name, or on a duplicate.
    pub fn add_signal(&mut self, name: &str, signature: &str, arg_names: &str) -> Result<(), Status> {
        self.add_member(MemberKind::Signal, name, signature, "", arg_names)
    }

    fn add_member(
        &mut self,
        kind: MemberKind,
        name: &str,
        signature: &str,
        return_signature: &str,
        arg_names: &str,
    ) -> Result<(), Status> {
        self.check_mutable()?;
        if !is_legal_member_name(name) {
            return Err(Status::BadArg(2));
        }
        if !crate::args::is_valid_signature(signature)
            || !crate::args::is_valid_signature(return_signature)
        {
            return Err(Status::BadArg(3));
        }
        if self.members.contains_key(name) || self.properties.contains_key(name) {
            return Err(Status::InterfaceAlreadyExists);
        }
        self.members.insert(
            name.to_string(),
            Member {
                kind,
                name: name.to_string(),
                signature: signature.to_string(),
                return_signature: return_signature.to_string(),
                arg_names: arg_names.to_string(),
            },
        );
        Ok(())
    }

    /// Adds a property member.
    ///
    /// # Errors
    ///
    /// Fails when activated, on an illegal name, or on a duplicate.
    pub fn add_property(
        &mut self,
        name: &str,
        signature: &str,
        access: PropAccess,
    ) -> Result<(), Status> {
        self.check_mutable()?;
        if !is_legal_member_name(name) {
            return Err(Status::BadArg(2));
        }
        if !crate::args::is_valid_signature(signature) || signature.is_empty() {
            return Err(Status::BadArg(3));
        }
        if self.members.contains_key(name) || self.properties.contains_key(name) {
            return Err(Status::InterfaceAlreadyExists);
        }
        self.properties.insert(
            name.to_string(),
            Property {
                name: name.to_string(),
                signature: signature.to_string(),
                access,
            },
        );
        Ok(())
    }

    /// Adds an interface annotation.
    ///
    /// # Errors
    ///
    /// Fails when activated.
    pub fn add_annotation(&mut self, name: &str, value: &str) -> Result<(), Status> {
        self.check_mutable()?;
        self.annotations.insert(name.to_string(), value.to_string());
        Ok(())
    }

    /// Looks up a method or signal member.
    #[must_use]
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    /// Looks up a property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Looks up an annotation.
    #[must_use]
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotations.get(name).map(String::as_str)
    }

    /// All method and signal members, in name order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// All properties, in name order.
    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    /// True if encryption is required on a secure object: the policy is
    /// required outright, or the object is secure and the policy is not
    /// explicitly off.
    #[must_use]
    pub const fn requires_encryption(&self, object_secure: bool) -> bool {
        match self.security {
            SecurityPolicy::Required => true,
            SecurityPolicy::Inherit => object_secure,
            SecurityPolicy::Off => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_illegal_names_rejected() {
        assert_eq!(
            InterfaceDescription::new("", SecurityPolicy::Inherit).unwrap_err(),
            Status::BadArg(1)
        );
        assert_eq!(
            InterfaceDescription::new("nodots", SecurityPolicy::Inherit).unwrap_err(),
            Status::BadArg(1)
        );
        assert!(InterfaceDescription::new("x.y", SecurityPolicy::Inherit).is_ok());
    }

    #[test]
    fn test_build_and_activate() {
        let mut iface =
            InterfaceDescription::new("sample.secure.Door", SecurityPolicy::Required).unwrap();
        iface.add_method("Open", "", "b", "success").unwrap();
        iface.add_signal("StateChanged", "b", "open").unwrap();
        iface
            .add_property("IsOpen", "b", PropAccess::Read)
            .unwrap();
        iface.activate();

        assert!(iface.is_activated());
        assert_eq!(iface.member("Open").unwrap().return_signature, "b");
        assert_eq!(iface.member("StateChanged").unwrap().kind, MemberKind::Signal);
        assert_eq!(iface.property("IsOpen").unwrap().access, PropAccess::Read);

        // Frozen: further mutation fails.
        assert!(iface.add_method("Close", "", "b", "").is_err());
        assert!(iface.add_property("X", "u", PropAccess::ReadWrite).is_err());
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let mut iface = InterfaceDescription::new("a.b", SecurityPolicy::Inherit).unwrap();
        iface.add_method("M", "u", "", "").unwrap();
        assert_eq!(
            iface.add_method("M", "s", "", "").unwrap_err(),
            Status::InterfaceAlreadyExists
        );
        assert_eq!(
            iface.add_property("M", "u", PropAccess::Read).unwrap_err(),
            Status::InterfaceAlreadyExists
        );
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut iface = InterfaceDescription::new("a.b", SecurityPolicy::Inherit).unwrap();
        assert_eq!(iface.add_method("M", "z", "", "").unwrap_err(), Status::BadArg(3));
    }

    #[test]
    fn test_requires_encryption_matrix() {
        let required =
            InterfaceDescription::new("a.required", SecurityPolicy::Required).unwrap();
        let inherit = InterfaceDescription::new("a.inherit", SecurityPolicy::Inherit).unwrap();
        let off = InterfaceDescription::new("a.off", SecurityPolicy::Off).unwrap();

        assert!(required.requires_encryption(false));
        assert!(required.requires_encryption(true));
        assert!(!inherit.requires_encryption(false));
        assert!(inherit.requires_encryption(true));
        assert!(!off.requires_encryption(false));
        assert!(!off.requires_encryption(true));
    }
}
