//! # meshbus-core
//!
//! Core primitives for the meshbus peer-to-peer secure messaging runtime.
//!
//! This crate provides the leaf building blocks consumed by the `meshbus`
//! runtime crate, with no dependency back onto the runtime:
//!
//! - **Status taxonomy**: one [`Status`] value covers the whole API surface;
//!   synchronous calls return it and callbacks receive it as their first
//!   argument.
//! - **Identity**: 128-bit attachment [`Guid128`]s and their short string
//!   form used in peer exchanges.
//! - **Crypto**: ECDSA P-256 over SHA-256 ([`crypto`]), the only signature
//!   suite the certificate profile admits.
//! - **Certificates**: DER/PEM codec for the X.509 identity certificate
//!   profile ([`cert`]).
//! - **Key store**: negotiated master secrets keyed by (scope, GUID) with
//!   optional expiration and an advisory-locked backing file ([`keystore`]).
//! - **Permission machine**: application claim states, manifest templates,
//!   and the permission configurator ([`permission`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cert;
pub mod crypto;
pub mod guid;
pub mod keystore;
pub mod permission;
pub mod status;

pub use guid::Guid128;
pub use status::Status;
