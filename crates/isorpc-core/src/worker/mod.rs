//! Worker side of the RPC layer.
//!
//! # Architecture
//!
//! - **registry**: callables addressable by locator
//! - **object**: the [`RemoteObject`] and [`RemoteGenerator`] capabilities
//!   and the per-call [`CallContext`]
//! - **dispatcher**: [`Worker`], the synchronous call executor and instance table
//! - **server**: the async serving loop and the worker process entry point
//!
//! # Example
//!
//! ```no_run
//! use isorpc::worker::{self, Registry};
//!
//! # async fn example() -> isorpc::Result<()> {
//! let mut registry = Registry::new();
//! registry.function("demo.math:add", |args, _ctx| {
//!     Ok(args.get::<i64>(0)? + args.get::<i64>(1)?)
//! })?;
//! worker::run_from_env(registry).await?;
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod object;
pub mod registry;
pub mod server;

pub use dispatcher::{Handled, Worker, WorkerState};
pub use object::{CallContext, IterGenerator, Outcome, RemoteGenerator, RemoteObject};
pub use registry::{Callable, Registry};
pub use server::{connect, run, run_from_env, serve, WorkerSettings};
