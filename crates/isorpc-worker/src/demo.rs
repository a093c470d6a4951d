//! Callables served by the reference worker.
//!
//! Controllers and the integration tests exercise every protocol feature
//! against these: plain functions, a stateful class with attributes,
//! generators, cancellable work and the failure modes.

use isorpc::worker::{CallContext, IterGenerator, Outcome, Registry, RemoteObject};
use isorpc::{CallArgs, RemoteError};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// A counter with the quirky arithmetic the protocol tests rely on.
struct Counter {
    a: i64,
}

impl Counter {
    fn wait(&self, args: &CallArgs, ctx: &CallContext) -> Result<i64, RemoteError> {
        let iterations: u64 = args.get_or(0, 1000)?;
        let step = Duration::from_millis(args.get_or(1, 1)?);
        for _ in 0..iterations {
            ctx.sleep(step)?;
        }
        Ok(self.a)
    }
}

impl RemoteObject for Counter {
    fn call_method(
        &mut self,
        name: &str,
        args: CallArgs,
        ctx: &CallContext,
    ) -> Result<Outcome, RemoteError> {
        match name {
            "increment" => {
                let b: i64 = args.get(0)?;
                let c: i64 = args.kwarg_value("c")?;
                self.a += 2;
                Outcome::value(&(self.a - b + c))
            }
            "count_to" => {
                let end: i64 = args.get_or(0, 5)?;
                Ok(Outcome::iter((0..end).map(Value::from)))
            }
            "iter_then_fail" => {
                let values = (0..5)
                    .map(|i| Ok(json!(i)))
                    .chain(std::iter::once(Err(RemoteError::new(
                        "RuntimeError",
                        "Not interrupted",
                    ))));
                Ok(Outcome::generator(IterGenerator::new(values)))
            }
            "slow_iter" => {
                let step = Duration::from_millis(args.get_or(0, 1)?);
                Ok(Outcome::generator(SlowCount { next: 0, step }))
            }
            "raise_error" => Err(RemoteError::value_error("Test error")),
            "wait" => Outcome::value(&self.wait(&args, ctx)?),
            "make_child" => Ok(Outcome::instance(Counter { a: self.a * 10 })),
            _ => Err(RemoteError::attribute_error(name)),
        }
    }

    fn get_attribute(&self, name: &str) -> Result<Value, RemoteError> {
        match name {
            "a" => Ok(json!(self.a)),
            "attr" => Ok(json!(self.a + 1)),
            "attr2" => Ok(json!(self.a + 2)),
            "static_property" => Ok(json!(8)),
            _ => Err(RemoteError::attribute_error(name)),
        }
    }
}

/// Counts up forever, pausing between values.
struct SlowCount {
    next: u64,
    step: Duration,
}

impl isorpc::worker::RemoteGenerator for SlowCount {
    fn advance(&mut self, ctx: &CallContext) -> Result<Option<Value>, RemoteError> {
        ctx.sleep(self.step)?;
        self.next += 1;
        Ok(Some(json!(self.next - 1)))
    }

    fn close(&mut self) {
        debug!("Slow counter closed after {} values", self.next);
    }
}

/// The reference worker's registry.
pub fn registry() -> Result<Registry, isorpc::RpcError> {
    let mut registry = Registry::new();
    registry
        .function("demo.math:add", |args, _ctx| {
            Ok(args.get::<i64>(0)? + args.get::<i64>(1)?)
        })?
        .class("demo.objects:Counter", |args, _ctx| {
            Ok(Counter {
                a: args.get_or(0, 0)?,
            })
        })?
        .function("demo.objects:Counter.static_method", |args, _ctx| {
            Ok(args.get::<i64>(0)? + args.get::<i64>(1)?)
        })?
        .function("demo.tasks:wait", |args, ctx| {
            let iterations: u64 = args.get_or(0, 1000)?;
            let step = Duration::from_millis(args.get_or(1, 10)?);
            for _ in 0..iterations {
                ctx.sleep(step)?;
            }
            Ok(iterations)
        })?
        .function("demo.faults:raise", |args, _ctx| -> Result<(), RemoteError> {
            let message: String = args.get_or(0, "Test error b1".to_string())?;
            Err(RemoteError::new("Exception", message))
        })?
        .function("demo.faults:fatal", |_args, _ctx| -> Result<(), RemoteError> {
            Err(RemoteError::fatal("SystemExit", "worker asked to stop"))
        })?
        .function("demo.faults:panic", |_args, _ctx| -> Result<(), RemoteError> {
            panic!("Test error b2")
        })?
        .function("demo.faults:exit", |args, _ctx| -> Result<(), RemoteError> {
            let code: i32 = args.get_or(0, 3)?;
            warn!("Exiting with code {} on request", code);
            std::process::exit(code)
        })?
        .function("demo.data:echo", |args, _ctx| args.get::<Value>(0))?
        .function("demo.env:get", |args, _ctx| {
            let name: String = args.get(0)?;
            Ok(std::env::var(name).ok())
        })?
        .function("demo.env:pid", |_args, _ctx| Ok(std::process::id()))?;
    Ok(registry)
}
