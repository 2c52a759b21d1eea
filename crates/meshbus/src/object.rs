//! Bus objects: an object path plus the interfaces it implements.
//!
//! A `BusObject` is built by the application, then registered with an
//! attachment. Objects form a tree keyed by path; ancestors missing at
//! registration time are filled in with *placeholder* objects, and a later
//! real registration at a placeholder path replaces the placeholder. A
//! secure object transitively marks its descendants secure.

use std::collections::HashMap;
use std::sync::Arc;

use meshbus_core::status::Status;

use crate::args::MsgArg;
use crate::handlers::{next_receiver_id, MethodHandler, ReceiverId};
use crate::iface::InterfaceDescription;
use crate::names::is_legal_object_path;

/// Property read handler: `(interface, property) -> value`.
pub type PropertyGetHandler =
    Arc<dyn Fn(&str, &str) -> Result<MsgArg, Status> + Send + Sync>;
/// Property write handler: `(interface, property, value)`.
pub type PropertySetHandler =
    Arc<dyn Fn(&str, &str, &MsgArg) -> Result<(), Status> + Send + Sync>;
/// Registration-lifecycle callback (`true` on register, `false` on
/// unregister).
pub type RegistrationCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// An application bus object.
pub struct BusObject {
    path: String,
    receiver: ReceiverId,
    interfaces: Vec<(Arc<InterfaceDescription>, bool)>,
    method_handlers: HashMap<(String, String), MethodHandler>,
    property_get: Option<PropertyGetHandler>,
    property_set: Option<PropertySetHandler>,
    registration_cb: Option<RegistrationCallback>,
}

impl std::fmt::Debug for BusObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusObject")
            .field("path", &self.path)
            .field("receiver", &self.receiver)
            .finish_non_exhaustive()
    }
}

impl BusObject {
    /// Creates an object at `path`.
    ///
    /// # Errors
    ///
    /// [`Status::BadObjectPath`] on an illegal path.
    pub fn new(path: &str) -> Result<Self, Status> {
        if !is_legal_object_path(path) {
            return Err(Status::BadObjectPath);
        }
        Ok(Self {
            path: path.to_string(),
            receiver: next_receiver_id(),
            interfaces: Vec::new(),
            method_handlers: HashMap::new(),
            property_get: None,
            property_set: None,
            registration_cb: None,
        })
    }

    /// Object path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Receiver id used for handler bookkeeping.
    #[must_use]
    pub const fn receiver(&self) -> ReceiverId {
        self.receiver
    }

    /// Adds an implemented interface, optionally marked announced.
    ///
    /// # Errors
    ///
    /// [`Status::BadArg`]\(1\) if the interface is not activated,
    /// [`Status::InterfaceAlreadyExists`] if already implemented.
    pub fn add_interface(
        &mut self,
        iface: Arc<InterfaceDescription>,
        announced: bool,
    ) -> Result<(), Status> {
        if !iface.is_activated() {
            return Err(Status::BadArg(1));
        }
        if self.interfaces.iter().any(|(i, _)| i.name() == iface.name()) {
            return Err(Status::InterfaceAlreadyExists);
        }
        self.interfaces.push((iface, announced));
        Ok(())
    }

    /// Attaches a handler for a method member of an implemented interface.
    ///
    /// # Errors
    ///
    /// [`Status::NoSuchInterface`] / [`Status::NoSuchMember`] when the
    /// member is not declared.
    pub fn set_method_handler(
        &mut self,
        iface_name: &str,
        member_name: &str,
        handler: MethodHandler,
    ) -> Result<(), Status> {
        let iface = self
            .interfaces
            .iter()
            .map(|(i, _)| i)
            .find(|i| i.name() == iface_name)
            .ok_or(Status::NoSuchInterface)?;
        if iface.member(member_name).is_none() {
            return Err(Status::NoSuchMember);
        }
        self.method_handlers
            .insert((iface_name.to_string(), member_name.to_string()), handler);
        Ok(())
    }

    /// Attaches the property read handler.
    pub fn set_property_get_handler(&mut self, handler: PropertyGetHandler) {
        self.property_get = Some(handler);
    }

    /// Attaches the property write handler.
    pub fn set_property_set_handler(&mut self, handler: PropertySetHandler) {
        self.property_set = Some(handler);
    }

    /// Attaches the registration-lifecycle callback.
    pub fn set_registration_callback(&mut self, callback: RegistrationCallback) {
        self.registration_cb = Some(callback);
    }

    /// Implemented interfaces with their announced flags.
    #[must_use]
    pub fn interfaces(&self) -> &[(Arc<InterfaceDescription>, bool)] {
        &self.interfaces
    }

    /// True if the object implements the named interface.
    #[must_use]
    pub fn implements_interface(&self, name: &str) -> bool {
        self.interfaces.iter().any(|(i, _)| i.name() == name)
    }

    /// Names of interfaces marked announced.
    #[must_use]
    pub fn announced_interface_names(&self) -> Vec<String> {
        self.interfaces
            .iter()
            .filter(|(_, announced)| *announced)
            .map(|(i, _)| i.name().to_string())
            .collect()
    }

    /// The handler for a method member, if attached.
    #[must_use]
    pub fn method_handler(&self, iface_name: &str, member_name: &str) -> Option<MethodHandler> {
        self.method_handlers
            .get(&(iface_name.to_string(), member_name.to_string()))
            .cloned()
    }

    /// The property read handler.
    #[must_use]
    pub fn property_get_handler(&self) -> Option<PropertyGetHandler> {
        self.property_get.clone()
    }

    /// The property write handler.
    #[must_use]
    pub fn property_set_handler(&self) -> Option<PropertySetHandler> {
        self.property_set.clone()
    }

    /// The registration-lifecycle callback.
    #[must_use]
    pub fn registration_callback(&self) -> Option<RegistrationCallback> {
        self.registration_cb.clone()
    }
}

/// Strict path prefixes of `path`, shortest first: `/a/b/c` yields `/`,
/// `/a`, `/a/b`.
#[must_use]
pub fn parent_paths(path: &str) -> Vec<String> {
    let mut parents = Vec::new();
    if path == "/" {
        return parents;
    }
    parents.push("/".to_string());
    let bytes = path.as_bytes();
    for (idx, byte) in bytes.iter().enumerate().skip(1) {
        if *byte == b'/' {
            parents.push(path[..idx].to_string());
        }
    }
    parents
}

/// The parent path of `path`, or `None` at the root.
#[must_use]
pub fn parent_path(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}
