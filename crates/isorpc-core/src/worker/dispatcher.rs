//! Call execution.
//!
//! [`Worker`] is the synchronous core of the worker side. It owns the
//! registry, the instance table and the record of the executing call.
//! [`Worker::handle`] runs one call to completion on the calling thread;
//! [`Worker::handle_interrupt`] may be called concurrently from another
//! thread to cancel it.
//!
//! # Thread Safety
//!
//! The instance table lock is only held to insert, look up or remove
//! entries, never while user code runs. Each entry has its own lock, held
//! for the duration of a call on that instance.

use super::object::{CallContext, Outcome, RemoteGenerator, RemoteObject};
use super::registry::Registry;
use crate::cancel::CancellationToken;
use crate::config::ProtocolConfig;
use crate::error::RemoteError;
use crate::protocol::{CallArgs, CallId, Handle, Message, Request, WireValue};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, trace, warn};

/// Per-connection execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Executing,
    Returning,
    Yielding,
    Erroring,
    /// Stopped serving after shutdown or a fatal error.
    Terminated,
}

/// Reply to send for a handled message, and whether to stop serving.
#[derive(Debug)]
pub struct Handled {
    pub reply: Option<Message>,
    pub terminate: bool,
}

impl Handled {
    fn silent() -> Self {
        Self {
            reply: None,
            terminate: false,
        }
    }
}

enum Slot {
    Object(Box<dyn RemoteObject>),
    Generator(Box<dyn RemoteGenerator>),
}

impl Slot {
    fn kind_name(&self) -> &'static str {
        match self {
            Slot::Object(_) => "instance",
            Slot::Generator(_) => "generator",
        }
    }

    /// Run generator cleanup. Only called on a slot just removed from the table.
    fn retire(&mut self) {
        if let Slot::Generator(generator) = self {
            generator.close();
        }
    }
}

type SlotRef = Arc<Mutex<Slot>>;

#[derive(Default)]
struct InstanceTable {
    last_handle: u64,
    entries: HashMap<Handle, SlotRef>,
}

#[derive(Default)]
struct Execution {
    current: Option<(CallId, CancellationToken)>,
    last_started: CallId,
    /// Interrupts that overtook their call.
    early: HashSet<CallId>,
}

/// What a successful call produced.
enum Executed {
    Return(WireValue),
    Yield(Value),
    Stop,
    Ack,
    Shutdown,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Executes calls against a registry and an instance table.
pub struct Worker {
    registry: Registry,
    instances: Mutex<InstanceTable>,
    execution: Mutex<Execution>,
    state: Mutex<WorkerState>,
    calls: AtomicU64,
}

impl Worker {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            instances: Mutex::new(InstanceTable::default()),
            execution: Mutex::new(Execution::default()),
            state: Mutex::new(WorkerState::Idle),
            calls: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of calls executed that expected a reply, excluding ping and shutdown.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of live instances and generator sessions.
    pub fn instance_count(&self) -> usize {
        lock(&self.instances).entries.len()
    }

    /// Whether `handle` is currently live.
    pub fn is_live(&self, handle: Handle) -> bool {
        lock(&self.instances).entries.contains_key(&handle)
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    fn transition(&self, next: WorkerState) {
        let mut state = lock(&self.state);
        if *state != next {
            trace!("Worker state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Handle one message from the main channel.
    ///
    /// Blocks while user code runs. Calls with id 0 never produce a reply.
    pub fn handle(&self, message: Message) -> Handled {
        match message {
            Message::Call {
                id,
                request,
                arguments,
                cancellable,
            } => self.handle_call(id, request, arguments, cancellable),
            Message::Interrupt { call_id } => {
                self.handle_interrupt(call_id);
                Handled::silent()
            }
            other => {
                warn!("Worker ignoring unexpected {} message", other.kind_name());
                Handled::silent()
            }
        }
    }

    /// Cancel the call with `call_id` if it is executing or has not started yet.
    ///
    /// Interrupts for calls that already finished are silent no-ops.
    pub fn handle_interrupt(&self, call_id: CallId) {
        let mut execution = lock(&self.execution);
        match &execution.current {
            Some((id, token)) if *id == call_id => {
                debug!("Interrupting call {}", call_id);
                token.cancel();
            }
            _ if call_id > execution.last_started => {
                debug!("Interrupt for call {} arrived before the call", call_id);
                execution.early.insert(call_id);
            }
            _ => trace!("Ignoring interrupt for finished call {}", call_id),
        }
    }

    fn begin(&self, id: CallId, cancellable: bool) -> CancellationToken {
        let token = CancellationToken::new();
        if id == ProtocolConfig::FIRE_AND_FORGET_ID {
            return token;
        }

        let mut execution = lock(&self.execution);
        execution.last_started = execution.last_started.max(id);
        let interrupted = execution.early.remove(&id);
        execution.early.retain(|pending| *pending > id);
        if cancellable {
            if interrupted {
                token.cancel();
            }
            execution.current = Some((id, token.clone()));
        }
        token
    }

    fn finish(&self, id: CallId) {
        let mut execution = lock(&self.execution);
        if matches!(&execution.current, Some((current, _)) if *current == id) {
            execution.current = None;
        }
    }

    fn handle_call(
        &self,
        id: CallId,
        request: Request,
        arguments: CallArgs,
        cancellable: bool,
    ) -> Handled {
        let counts = id != ProtocolConfig::FIRE_AND_FORGET_ID
            && !matches!(request, Request::Ping | Request::Shutdown);
        if counts {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }

        let op = request.op_name();
        debug!("Executing call {} ({})", id, op);
        self.transition(WorkerState::Executing);

        let token = self.begin(id, cancellable);
        let ctx = CallContext::new(id, token.clone());
        let result = catch_unwind(AssertUnwindSafe(|| self.execute(request, arguments, &ctx)));
        self.finish(id);

        let (reply, terminate) = match result {
            Ok(Ok(Executed::Return(value))) => {
                self.transition(WorkerState::Returning);
                (Message::Return { id, value }, false)
            }
            Ok(Ok(Executed::Yield(value))) => {
                self.transition(WorkerState::Yielding);
                (Message::Yield { id, value }, false)
            }
            Ok(Ok(Executed::Stop)) => {
                self.transition(WorkerState::Yielding);
                (Message::Stop { id }, false)
            }
            Ok(Ok(Executed::Ack)) => (Message::Ack { id }, false),
            Ok(Ok(Executed::Shutdown)) => {
                debug!("Shutdown requested by controller");
                self.transition(WorkerState::Terminated);
                return Handled {
                    reply: (id != ProtocolConfig::FIRE_AND_FORGET_ID)
                        .then_some(Message::Ack { id }),
                    terminate: true,
                };
            }
            Ok(Err(err)) => {
                self.transition(WorkerState::Erroring);
                let err = if token.is_cancelled() && !err.is_fatal() {
                    token.mark_observed();
                    RemoteError::cancelled()
                } else {
                    err
                };
                if err.is_fatal() {
                    error!("Call {} ({}) failed fatally: {}", id, op, err);
                } else {
                    debug!("Call {} ({}) raised {}", id, op, err);
                }
                let terminate = err.is_fatal();
                (Message::Exception { id, error: err }, terminate)
            }
            Err(payload) => {
                self.transition(WorkerState::Erroring);
                let message = panic_message(payload.as_ref());
                error!("Call {} ({}) panicked: {}", id, op, message);
                (
                    Message::Exception {
                        id,
                        error: RemoteError::fatal("Panic", message),
                    },
                    true,
                )
            }
        };

        self.transition(if terminate {
            WorkerState::Terminated
        } else {
            WorkerState::Idle
        });

        Handled {
            reply: (id != ProtocolConfig::FIRE_AND_FORGET_ID).then_some(reply),
            terminate,
        }
    }

    fn execute(
        &self,
        request: Request,
        arguments: CallArgs,
        ctx: &CallContext,
    ) -> Result<Executed, RemoteError> {
        match request {
            Request::Static { locator } => {
                let callable = self.registry.resolve(&locator)?;
                let outcome = callable(arguments, ctx)?;
                Ok(Executed::Return(self.track(outcome)))
            }
            Request::Method { handle, name } => {
                let slot = self.lookup(handle)?;
                let outcome = match &mut *lock(&slot) {
                    Slot::Object(object) => object.call_method(&name, arguments, ctx)?,
                    Slot::Generator(_) => {
                        return Err(RemoteError::type_error(format!(
                            "generator {} has no method '{}'",
                            handle, name
                        )))
                    }
                };
                Ok(Executed::Return(self.track(outcome)))
            }
            Request::GetAttr { handle, name } => {
                let slot = self.lookup(handle)?;
                let guard = lock(&slot);
                match &*guard {
                    Slot::Object(object) => {
                        Ok(Executed::Return(WireValue::value(object.get_attribute(&name)?)))
                    }
                    Slot::Generator(_) => Err(RemoteError::attribute_error(&name)),
                }
            }
            Request::Next { handle } => self.advance(handle, ctx),
            Request::Close { handle } | Request::Del { handle } => {
                self.release(handle)?;
                Ok(Executed::Ack)
            }
            Request::Ping => Ok(Executed::Ack),
            Request::Shutdown => Ok(Executed::Shutdown),
        }
    }

    fn advance(&self, handle: Handle, ctx: &CallContext) -> Result<Executed, RemoteError> {
        let slot = self.lookup(handle)?;
        let mut guard = lock(&slot);
        let result = match &mut *guard {
            Slot::Generator(generator) => generator.advance(ctx),
            Slot::Object(_) => {
                return Err(RemoteError::type_error(format!(
                    "instance {} is not a generator",
                    handle
                )))
            }
        };

        match result {
            Ok(Some(value)) => Ok(Executed::Yield(value)),
            Ok(None) => {
                self.remove(handle);
                guard.retire();
                debug!("Generator {} exhausted", handle);
                Ok(Executed::Stop)
            }
            Err(err) => {
                self.remove(handle);
                guard.retire();
                debug!("Generator {} closed after error", handle);
                Err(err)
            }
        }
    }

    fn release(&self, handle: Handle) -> Result<(), RemoteError> {
        let slot = self
            .remove(handle)
            .ok_or_else(|| RemoteError::unknown_instance(handle))?;
        let mut guard = lock(&slot);
        debug!("Releasing {} {}", guard.kind_name(), handle);
        guard.retire();
        Ok(())
    }

    fn track(&self, outcome: Outcome) -> WireValue {
        match outcome {
            Outcome::Value(value) => WireValue::Value { value },
            Outcome::Instance(object) => WireValue::Instance {
                handle: self.insert(Slot::Object(object)),
            },
            Outcome::Generator(generator) => WireValue::Generator {
                handle: self.insert(Slot::Generator(generator)),
            },
        }
    }

    fn insert(&self, slot: Slot) -> Handle {
        let mut table = lock(&self.instances);
        table.last_handle += 1;
        let handle = Handle::new(table.last_handle);
        trace!("Tracking {} {}", slot.kind_name(), handle);
        table.entries.insert(handle, Arc::new(Mutex::new(slot)));
        handle
    }

    fn lookup(&self, handle: Handle) -> Result<SlotRef, RemoteError> {
        lock(&self.instances)
            .entries
            .get(&handle)
            .cloned()
            .ok_or_else(|| RemoteError::unknown_instance(handle))
    }

    fn remove(&self, handle: Handle) -> Option<SlotRef> {
        lock(&self.instances).entries.remove(&handle)
    }

    /// Release every live instance and close every generator session.
    ///
    /// Returns how many entries were released.
    pub fn shutdown(&self) -> usize {
        let entries: Vec<(Handle, SlotRef)> = lock(&self.instances).entries.drain().collect();
        let released = entries.len();
        for (handle, slot) in entries {
            let mut guard = lock(&slot);
            trace!("Releasing {} {} on shutdown", guard.kind_name(), handle);
            guard.retire();
        }
        if released > 0 {
            debug!("Released {} live entries on shutdown", released);
        }
        self.transition(WorkerState::Terminated);
        released
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("state", &self.state())
            .field("instances", &self.instance_count())
            .field("calls", &self.call_count())
            .finish()
    }
}
