//! kernel-require - Kernel-side manager for frontend-linked JavaScript
//! library requirements.
//!
//! A kernel process declares named library paths and shims, and dispatches
//! script fragments to a long-lived browser frontend over three fixed
//! logical channels (`config`, `execute`, `safe_execute`). The frontend can
//! disappear and reappear (page reload) without restarting the kernel: the
//! requirement store survives, only the channels are rebuilt.
//!
//! The pieces, leaf-first:
//!
//! - [`template`]: `$$`-delimited parameter substitution that never renders
//!   syntactically broken script on null/missing values
//! - [`comm`]: the narrow channel-transport abstraction and the in-process
//!   [`comm::LocalTransport`]
//! - [`connection`] + [`socket`]: length-prefixed JSON framing and the
//!   [`socket::SocketTransport`] binding over any bidirectional stream
//! - [`store`]: the mutable requirement state (paths + shims)
//! - [`require`]: the [`require::RequireService`] dispatch API and its
//!   initialization state machine
//! - [`events`]: the router acknowledging frontend-initiated events
//!
//! This crate deliberately is not an RPC framework: three channels, fixed
//! message shapes, fire-and-forget sends, acknowledgements logged rather
//! than awaited.

pub mod comm;
pub mod connection;
pub mod events;
pub mod protocol;
pub mod require;
pub mod socket;
pub mod store;
pub mod template;

pub use comm::{Comm, CommHandle, CommTransport, LocalTransport, TransportError};
pub use require::{ExecuteOptions, InitState, RequireError, RequireService, Requirements};
pub use store::RequireStore;
pub use template::{JsTemplate, TemplateError, TemplateParams};
