//! # meshbus
//!
//! A peer-to-peer secure messaging runtime. Applications attach to a
//! message bus, export interfaces on object paths, discover peers, form
//! point-to-point or multipoint sessions, and exchange authenticated
//! method calls, signals, and property operations over a DBus-derived
//! protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                BusAttachment                   │  lifecycle, names,
//! │   listeners · sessions · peer security         │  sessions, security
//! ├────────────────────────────────────────────────┤
//! │                LocalEndpoint                   │  routing, tables,
//! │   dispatcher · reply registry · object tree    │  encryption policy
//! ├────────────────────────────────────────────────┤
//! │                   Router                       │  control plane,
//! │        (bundled in-process, or remote)         │  delivery
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Inbound bytes flow transport → router → local endpoint dispatcher →
//! handler-table lookup → application callback; outbound flows
//! application → attachment → router → transport. Control-plane
//! operations are method calls to the well-known bus controller.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use meshbus::attachment::BusAttachment;
//! use meshbus::handlers::MethodResult;
//! use meshbus::iface::SecurityPolicy;
//! use meshbus::object::BusObject;
//!
//! meshbus::runtime::init();
//! let bus = BusAttachment::new("door-provider", 4);
//! bus.start()?;
//! bus.connect("null:")?;
//!
//! let mut iface = bus.create_interface("sample.secure.Door", SecurityPolicy::Required)?;
//! iface.add_method("Open", "", "b", "success")?;
//! iface.activate();
//! let iface = bus.register_interface(iface)?;
//!
//! let mut door = BusObject::new("/door")?;
//! door.add_interface(iface, true)?;
//! door.set_method_handler(
//!     "sample.secure.Door",
//!     "Open",
//!     Arc::new(|_member, _msg| MethodResult::Reply(vec![meshbus::args::MsgArg::Boolean(true)])),
//! )?;
//! bus.register_bus_object(Arc::new(door), true)?;
//! # Ok::<(), meshbus_core::Status>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod args;
pub mod attachment;
pub mod auth;
pub mod dispatch;
pub mod endpoint;
pub mod handlers;
pub mod iface;
pub mod listener;
pub mod match_rule;
pub mod message;
pub mod names;
pub mod object;
pub mod peer;
pub mod router;
pub mod runtime;
pub mod session;

pub use meshbus_core as core;
pub use meshbus_core::Status;

pub use attachment::BusAttachment;
pub use iface::{InterfaceDescription, SecurityPolicy};
pub use message::{Message, MessageType};
pub use object::BusObject;
pub use router::{BundledRouter, Router};
pub use session::{SessionId, SessionOpts, SessionPort};
