//! isorpc - Transparent RPC between a controller and an isolated worker process.
//!
//! A controller invokes functions, constructs objects and drives generators
//! that live in a worker process, through a small message protocol over a
//! negotiated transport. Objects stay in the worker and are addressed by
//! handle; generators are advanced one value per round trip; long calls can
//! be interrupted through a side channel.
//!
//! # Architecture
//!
//! - `protocol` - wire messages, handles, locators and framing
//! - `transport` - stream and shared-memory transports plus negotiation
//! - `worker` - registry, call executor and serving loop (worker side)
//! - `backend` - [`Backend`], connections and proxies (controller side)
//! - `remote` - launching and supervising worker processes
//! - `cancel` - cooperative cancellation tokens
//!
//! # Example
//!
//! ```rust,ignore
//! use isorpc::{CallArgs, RemoteProcessBackend, RemoteProcessOptions};
//!
//! #[tokio::main]
//! async fn main() -> isorpc::Result<()> {
//!     let options = RemoteProcessOptions::command("/path/to/isorpc-worker");
//!     RemoteProcessBackend::scope(options, |backend| async move {
//!         let sum: i64 = backend
//!             .static_call("demo.math:add", CallArgs::positional([1, 2]))
//!             .await?
//!             .deserialize()?;
//!         assert_eq!(sum, 3);
//!
//!         let counter = backend
//!             .static_call("demo.objects:Counter", CallArgs::new())
//!             .await?
//!             .into_instance()?;
//!         counter.call("increment", CallArgs::positional([1])).await?;
//!         Ok(())
//!     })
//!     .await
//! }
//! ```

pub mod backend;
pub mod cancel;
pub mod config;
pub mod error;
pub mod platform;
pub mod protocol;
pub mod remote;
pub mod transport;
pub mod worker;

// Re-export commonly used types
pub use backend::{
    Advance, Backend, Dispatch, GeneratorProxy, InProcess, InstanceProxy, RemoteValue,
    RpcConnection,
};
pub use cancel::{CancellationToken, CancelledError, TokenState};
pub use config::{active_backend, safe_environment, TransportKind};
pub use error::{ErrorClass, RemoteError, Result, RpcError};
pub use protocol::{CallArgs, CallId, Handle, Locator, Message};
pub use remote::{CommandLauncher, RemoteProcessBackend, RemoteProcessOptions, WorkerLauncher};
pub use transport::{Link, Transport};
pub use worker::{
    CallContext, Outcome, Registry, RemoteGenerator, RemoteObject, Worker, WorkerSettings,
};
