//! Controller and worker wired together in one process.
//!
//! The same scenarios run over a plain stream link, a negotiated
//! shared-memory link and the in-process backend.

use isorpc::config::{ProtocolConfig, TransportKind};
use isorpc::transport::negotiated_memory_link;
use isorpc::worker::{serve, CallContext, Outcome, Registry, RemoteGenerator, RemoteObject};
use isorpc::{Advance, Backend, CallArgs, CancellationToken, InProcess, RemoteError, RpcError, Worker};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Accumulator {
    total: i64,
}

impl RemoteObject for Accumulator {
    fn call_method(
        &mut self,
        name: &str,
        args: CallArgs,
        ctx: &CallContext,
    ) -> Result<Outcome, RemoteError> {
        match name {
            "add" => {
                self.total += args.get::<i64>(0)?;
                Outcome::value(&self.total)
            }
            "spin" => loop {
                ctx.sleep(Duration::from_millis(5))?;
            },
            "fail" => Err(RemoteError::value_error("bad input").with_context("in fail")),
            _ => Err(RemoteError::attribute_error(name)),
        }
    }

    fn get_attribute(&self, name: &str) -> Result<Value, RemoteError> {
        match name {
            "total" => Ok(json!(self.total)),
            _ => Err(RemoteError::attribute_error(name)),
        }
    }
}

/// Counts from zero, optionally failing at `fail_at`, recording closes.
struct Tracked {
    next: i64,
    end: Option<i64>,
    fail_at: Option<i64>,
    step: Duration,
    closes: Arc<AtomicUsize>,
}

impl RemoteGenerator for Tracked {
    fn advance(&mut self, ctx: &CallContext) -> Result<Option<Value>, RemoteError> {
        if !self.step.is_zero() {
            ctx.sleep(self.step)?;
        }
        if Some(self.next) == self.fail_at {
            return Err(RemoteError::new("RuntimeError", "generator failed"));
        }
        if Some(self.next) == self.end {
            return Ok(None);
        }
        self.next += 1;
        Ok(Some(json!(self.next - 1)))
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn registry(closes: Arc<AtomicUsize>) -> Registry {
    let mut registry = Registry::new();
    registry
        .function("calc:add", |args, _ctx| {
            Ok(args.get::<i64>(0)? + args.kwarg_or("b", 0i64)?)
        })
        .unwrap()
        .class("calc:Accumulator", |args, _ctx| {
            Ok(Accumulator {
                total: args.get_or(0, 0)?,
            })
        })
        .unwrap()
        .class("calc:SlowAccumulator", |_args, ctx| {
            ctx.sleep(Duration::from_millis(300))?;
            Ok(Accumulator { total: 0 })
        })
        .unwrap()
        .function("calc:echo", |args, _ctx| args.get::<Value>(0))
        .unwrap()
        .function("calc:fill", |args, _ctx| Ok("x".repeat(args.get(0)?)))
        .unwrap()
        // Tuple keys have no JSON form
        .function("calc:pairs", |_args, _ctx| Ok(BTreeMap::from([((1, 2), 3)])))
        .unwrap()
        .generator("calc:count", move |args, _ctx| {
            Ok(Tracked {
                next: 0,
                end: args.kwarg_or("end", None)?,
                fail_at: args.kwarg_or("fail_at", None)?,
                step: Duration::from_millis(args.kwarg_or("step_ms", 0)?),
                closes: closes.clone(),
            })
        })
        .unwrap();
    registry
}

struct Harness {
    backend: Backend,
    worker: Arc<Worker>,
    closes: Arc<AtomicUsize>,
}

async fn over_link(offered: &[TransportKind]) -> Harness {
    let closes = Arc::new(AtomicUsize::new(0));
    let worker = Arc::new(Worker::new(registry(closes.clone())));
    let (controller, worker_link) = negotiated_memory_link(offered, &TransportKind::ALL)
        .await
        .unwrap();
    tokio::spawn(serve(worker.clone(), worker_link));
    Harness {
        backend: Backend::over_link("test", controller),
        worker,
        closes,
    }
}

fn in_process() -> Harness {
    let closes = Arc::new(AtomicUsize::new(0));
    let worker = Arc::new(Worker::new(registry(closes.clone())));
    Harness {
        backend: Backend::new(InProcess::new("local", worker.clone())),
        worker,
        closes,
    }
}

async fn link_harnesses() -> Vec<Harness> {
    vec![
        over_link(&[TransportKind::TcpJson]).await,
        over_link(&[TransportKind::ShmJson]).await,
    ]
}

async fn harnesses() -> Vec<Harness> {
    vec![
        over_link(&[TransportKind::TcpJson]).await,
        over_link(&[TransportKind::ShmJson]).await,
        in_process(),
    ]
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn test_static_calls_and_call_counter() {
    for h in harnesses().await {
        let sum: i64 = h
            .backend
            .static_call("calc:add", CallArgs::positional([2]).kwarg("b", 40))
            .await
            .unwrap()
            .deserialize()
            .unwrap();
        assert_eq!(sum, 42);

        h.backend.ping().await.unwrap();
        assert_eq!(h.worker.call_count(), 1, "{}", h.backend.name());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_instances_have_unique_handles_and_state() {
    for h in harnesses().await {
        let first = h
            .backend
            .static_call("calc:Accumulator", CallArgs::positional([10]))
            .await
            .unwrap()
            .into_instance()
            .unwrap();
        let second = h
            .backend
            .static_call("calc:Accumulator", CallArgs::new())
            .await
            .unwrap()
            .into_instance()
            .unwrap();
        assert_ne!(first.handle(), second.handle());

        first.call("add", CallArgs::positional([5])).await.unwrap();
        second.call("add", CallArgs::positional([1])).await.unwrap();
        assert_eq!(first.get("total").await.unwrap(), json!(15));
        assert_eq!(first.get("total").await.unwrap(), json!(15));
        assert_eq!(second.get("total").await.unwrap(), json!(1));
        assert_eq!(h.worker.instance_count(), 2);

        let handle = first.handle();
        first.release().await.unwrap();
        assert!(!h.worker.is_live(handle));
        match h.backend.instance_get(handle, "total").await {
            Err(RpcError::UnknownInstance { handle: unknown }) => assert_eq!(unknown, handle),
            other => panic!("Expected UnknownInstance, got: {:?}", other),
        }

        drop(second);
        assert!(eventually(|| h.worker.instance_count() == 0).await);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reserved_names_are_not_forwarded() {
    for h in harnesses().await {
        let instance = h
            .backend
            .static_call("calc:Accumulator", CallArgs::new())
            .await
            .unwrap()
            .into_instance()
            .unwrap();
        let calls = h.worker.call_count();

        let err = instance.get("__dict__").await.unwrap_err();
        assert!(matches!(err, RpcError::ReservedName { .. }));
        assert_eq!(h.worker.call_count(), calls);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exception_fidelity() {
    for h in harnesses().await {
        let instance = h
            .backend
            .static_call("calc:Accumulator", CallArgs::new())
            .await
            .unwrap()
            .into_instance()
            .unwrap();

        let err = instance.call("fail", CallArgs::new()).await.unwrap_err();
        let remote = err.remote().unwrap();
        assert_eq!(remote.kind, "ValueError");
        assert_eq!(remote.message, "bad input");
        assert_eq!(remote.traceback, vec!["in fail".to_string()]);
        assert!(!err.is_connection_error());

        let err = instance.get("missing").await.unwrap_err();
        assert!(err.remote().unwrap().is_kind("AttributeError"));

        let err = h
            .backend
            .static_call("calc:nothing", CallArgs::new())
            .await
            .unwrap_err();
        assert!(err.remote().unwrap().is_kind("LookupError"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_generator_runs_to_exhaustion() {
    for h in harnesses().await {
        let mut generator = h
            .backend
            .static_call("calc:count", CallArgs::new().kwarg("end", 3))
            .await
            .unwrap()
            .into_generator()
            .unwrap();

        let mut values = Vec::new();
        while let Advance::Value(value) = generator.advance().await.unwrap() {
            values.push(value);
        }
        assert_eq!(values, vec![json!(0), json!(1), json!(2)]);
        assert!(generator.is_finished());
        assert_eq!(generator.advance().await.unwrap(), Advance::End);

        drop(generator);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.worker.instance_count(), 0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_generator_closed_once_on_early_drop() {
    for h in harnesses().await {
        let mut generator = h
            .backend
            .static_call("calc:count", CallArgs::new())
            .await
            .unwrap()
            .into_generator()
            .unwrap();
        assert_eq!(generator.next().await.unwrap(), Some(json!(0)));
        assert_eq!(generator.next().await.unwrap(), Some(json!(1)));
        drop(generator);

        let closes = h.closes.clone();
        assert!(eventually(|| closes.load(Ordering::SeqCst) == 1).await);
        assert!(eventually(|| h.worker.instance_count() == 0).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_generator_error_surfaces_and_closes() {
    for h in harnesses().await {
        let mut generator = h
            .backend
            .static_call("calc:count", CallArgs::new().kwarg("fail_at", 2))
            .await
            .unwrap()
            .into_generator()
            .unwrap();
        assert_eq!(generator.next().await.unwrap(), Some(json!(0)));
        assert_eq!(generator.next().await.unwrap(), Some(json!(1)));

        let err = generator.next().await.unwrap_err();
        assert_eq!(err.remote().unwrap().message, "generator failed");
        assert_eq!(generator.next().await.unwrap(), None);
        generator.close().await.unwrap();

        assert_eq!(h.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.worker.instance_count(), 0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_method_leaves_instance_usable() {
    for h in harnesses().await {
        let instance = h
            .backend
            .static_call("calc:Accumulator", CallArgs::positional([3]))
            .await
            .unwrap()
            .into_instance()
            .unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            token.run(instance.call("spin", CallArgs::new())),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(result, Err(RpcError::Cancelled)), "{:?}", result);

        assert_eq!(instance.get("total").await.unwrap(), json!(3));
        let total: i64 = instance
            .call("add", CallArgs::positional([1]))
            .await
            .unwrap()
            .deserialize()
            .unwrap();
        assert_eq!(total, 4);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_generator_advance_ends_session() {
    for h in harnesses().await {
        let mut generator = h
            .backend
            .static_call("calc:count", CallArgs::new().kwarg("step_ms", 2000))
            .await
            .unwrap()
            .into_generator()
            .unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = token.run(generator.advance()).await.unwrap();
        assert!(matches!(result, Err(RpcError::Cancelled)), "{:?}", result);
        assert!(generator.is_finished());
        drop(generator);

        let closes = h.closes.clone();
        assert!(eventually(|| closes.load(Ordering::SeqCst) == 1).await);
        assert!(eventually(|| h.worker.instance_count() == 0).await);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_ends_session() {
    for h in harnesses().await {
        let _instance = h
            .backend
            .static_call("calc:Accumulator", CallArgs::new())
            .await
            .unwrap()
            .into_instance()
            .unwrap();

        h.backend.request_shutdown().await.unwrap();
        assert!(eventually(|| h.worker.instance_count() == 0).await);

        let err = h
            .backend
            .static_call("calc:add", CallArgs::positional([1]))
            .await
            .unwrap_err();
        assert!(err.is_connection_error(), "{:?}", err);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unserializable_argument_fails_before_sending() {
    for h in harnesses().await {
        let err = CallArgs::new()
            .try_arg(&BTreeMap::from([((1, 2), 3)]))
            .unwrap_err();
        assert!(matches!(err, RpcError::Serialization { .. }), "{:?}", err);
        assert_eq!(h.worker.call_count(), 0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unserializable_result_is_serialization_error() {
    for h in harnesses().await {
        let err = h
            .backend
            .static_call("calc:pairs", CallArgs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Serialization { .. }), "{:?}", err);
        assert!(!err.is_connection_error());

        let sum: i64 = h
            .backend
            .static_call("calc:add", CallArgs::positional([1]).kwarg("b", 1))
            .await
            .unwrap()
            .deserialize()
            .unwrap();
        assert_eq!(sum, 2);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_frames_fail_only_their_call() {
    let limit = Duration::from_secs(20);
    for h in link_harnesses().await {
        let huge = "x".repeat(ProtocolConfig::MAX_FRAME_SIZE);
        let err = tokio::time::timeout(
            limit,
            h.backend
                .static_call("calc:echo", CallArgs::positional([huge])),
        )
        .await
        .expect("oversized argument must not hang the call")
        .unwrap_err();
        assert!(matches!(err, RpcError::Serialization { .. }), "{:?}", err);
        assert_eq!(h.worker.call_count(), 0);

        let err = tokio::time::timeout(
            limit,
            h.backend.static_call(
                "calc:fill",
                CallArgs::positional([ProtocolConfig::MAX_FRAME_SIZE]),
            ),
        )
        .await
        .expect("oversized result must not hang the call")
        .unwrap_err();
        assert!(matches!(err, RpcError::Serialization { .. }), "{:?}", err);

        let echoed = h
            .backend
            .static_call("calc:echo", CallArgs::positional(["small"]))
            .await
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(echoed, json!("small"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abandoned_constructor_is_released() {
    for h in harnesses().await {
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            h.backend.static_call("calc:SlowAccumulator", CallArgs::new()),
        )
        .await;
        assert!(abandoned.is_err(), "{}", h.backend.name());

        h.backend.ping().await.unwrap();
        assert!(
            eventually(|| h.worker.instance_count() == 0).await,
            "{} kept the abandoned instance",
            h.backend.name()
        );
    }
}
