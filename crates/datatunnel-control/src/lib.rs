//! Bidirectional RPC over a control stream
//!
//! Either side of a control stream can both serve and issue calls:
//!
//! - [`ControlBaseBuilder::register_rpc`] registers a handler by method name,
//!   version and kind (REQUEST or NOTIFY)
//! - [`ControlBaseBuilder::register_client_method`] declares a remote method
//!   this side calls, and [`ControlBase::new_remote_caller`] turns it into a
//!   typed [`RemoteCaller`]
//! - [`ControlBase::serve`] runs the read loop for one [`ControlConnection`],
//!   dispatching inbound calls and correlating responses by message id

pub mod base;
pub mod caller;
pub mod connection;
pub mod error;
pub mod pending;
pub mod registry;

pub use base::{ControlBase, ControlBaseBuilder};
pub use caller::RemoteCaller;
pub use connection::{CallContext, ControlConnection};
pub use error::{ProtocolError, RegisterError, RpcError};
pub use pending::PendingCalls;
pub use registry::CallKind;
