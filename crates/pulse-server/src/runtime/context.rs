//! Boa-backed execution context.
//!
//! One `ScriptContext` is one isolated instance of the embedded JavaScript
//! runtime, holding its own global state. The engine's heap and interner
//! live in thread-local storage, so the runtime must be built, driven, and
//! dropped on a single thread. Each context therefore owns a dedicated
//! worker thread; the `ScriptContext` handle only passes messages to it,
//! which makes the handle freely shareable across the pool's threads.

use crate::runtime::bindings::{self, Host};
use crate::runtime::pool::ExecutionContext;
use crate::runtime::ContextId;
use boa_engine::property::PropertyKey;
use boa_engine::{js_string, value::JsValue, Context, Source};
use pulse_common::error::{PulseError, Result};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

enum Command {
    Routes(mpsc::Sender<Result<Vec<String>>>),
    Invoke(String, mpsc::Sender<Result<String>>),
}

/// Handle to one script runtime with the Pulse host bindings installed.
pub struct ScriptContext {
    id: ContextId,
    // None once the context has been closed.
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ScriptContext {
    /// Spawn the context's worker thread, which creates a fresh runtime,
    /// installs the host function table, and evaluates the user script.
    /// Returns once the script has run, or with the script's error.
    pub fn initialize(host: Host, script_source: &str) -> Result<Self> {
        let id = host.context_id();
        let source = script_source.to_owned();
        let (commands, inbox) = mpsc::channel();
        let (ready, readiness) = mpsc::channel();

        let worker = thread::Builder::new()
            .name(id.to_string())
            .spawn(move || worker_loop(host, source, ready, inbox))?;

        match readiness.recv() {
            Ok(Ok(())) => Ok(Self {
                id,
                commands: Mutex::new(Some(commands)),
                worker: Mutex::new(Some(worker)),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(PulseError::Script("context worker exited during startup".into()))
            }
        }
    }

    /// Enumerate the route keys the script registered, e.g. `"GET /hello"`.
    pub fn routes(&self) -> Result<Vec<String>> {
        self.roundtrip(Command::Routes)
    }

    /// Send one command to the worker and wait for its reply. A closed or
    /// crashed worker is an error, never a hang: its end of the channel is
    /// gone, so both `send` and `recv` fail fast.
    fn roundtrip<T>(&self, command: impl FnOnce(mpsc::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, response) = mpsc::channel();
        {
            let guard = self.commands.lock().unwrap();
            let sender = guard
                .as_ref()
                .ok_or_else(|| PulseError::Script("context already closed".into()))?;
            sender
                .send(command(reply))
                .map_err(|_| PulseError::Script("context worker is gone".into()))?;
        }
        response
            .recv()
            .map_err(|_| PulseError::Script("context worker is gone".into()))?
    }
}

impl ExecutionContext for ScriptContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn invoke(&self, handler: &str) -> Result<String> {
        self.roundtrip(|reply| Command::Invoke(handler.to_string(), reply))
    }

    fn close(&self) {
        // Dropping the command sender ends the worker loop; the join waits
        // for the runtime to be torn down on the thread that built it.
        self.commands.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

/// Body of the context's owner thread. The runtime never leaves this
/// function; it is dropped here when the handle closes the command channel.
fn worker_loop(
    host: Host,
    source: String,
    ready: mpsc::Sender<Result<()>>,
    inbox: mpsc::Receiver<Command>,
) {
    let mut ctx = Context::default();

    let startup = bindings::install_host_functions(&mut ctx, &host).and_then(|()| {
        ctx.eval(Source::from_bytes(&source))
            .map(|_| ())
            .map_err(|e| PulseError::Script(format!("script evaluation error: {}", e)))
    });
    let failed = startup.is_err();
    if ready.send(startup).is_err() || failed {
        return;
    }

    while let Ok(command) = inbox.recv() {
        match command {
            Command::Routes(reply) => {
                let _ = reply.send(route_keys(&mut ctx));
            }
            Command::Invoke(handler, reply) => {
                let _ = reply.send(run_handler(&mut ctx, &handler));
            }
        }
    }
}

fn route_keys(ctx: &mut Context) -> Result<Vec<String>> {
    let routes = routes_object(ctx)?;
    let keys = routes
        .own_property_keys(ctx)
        .map_err(|e| PulseError::Script(format!("failed to list routes: {}", e)))?;

    Ok(keys
        .iter()
        .filter_map(|key| match key {
            PropertyKey::String(name) => name.to_std_string().ok(),
            _ => None,
        })
        .collect())
}

fn run_handler(ctx: &mut Context, handler: &str) -> Result<String> {
    let routes = routes_object(ctx)?;
    let func = routes
        .get(js_string!(handler), ctx)
        .map_err(|e| PulseError::Script(format!("route lookup error: {}", e)))?;

    if func.is_undefined() {
        return Err(PulseError::UnknownRoute(handler.to_string()));
    }

    let func_obj = func
        .as_object()
        .ok_or_else(|| PulseError::Script("registered route is not a function".into()))?;

    // The request-context object is the handler's single argument,
    // mirroring how the dispatcher bound the request beforehand.
    let request_obj = pulse_object(ctx)?
        .get(js_string!("__request"), ctx)
        .map_err(|e| PulseError::Script(format!("failed to load request object: {}", e)))?;

    let result = func_obj
        .call(&JsValue::undefined(), &[request_obj], ctx)
        .map_err(|e| PulseError::Script(format!("handler execution error: {}", e)))?;

    if result.is_undefined() || result.is_null() {
        return Ok(String::new());
    }

    let body = result
        .to_string(ctx)
        .map_err(|e| PulseError::Script(format!("handler result not stringifiable: {}", e)))?;
    Ok(body.to_std_string_escaped())
}

fn pulse_object(ctx: &mut Context) -> Result<boa_engine::object::JsObject> {
    ctx.global_object()
        .get(js_string!("pulse"), ctx)
        .map_err(|e| PulseError::Script(format!("failed to access pulse global: {}", e)))?
        .as_object()
        .cloned()
        .ok_or_else(|| PulseError::Script("pulse global is not an object".into()))
}

fn routes_object(ctx: &mut Context) -> Result<boa_engine::object::JsObject> {
    pulse_object(ctx)?
        .get(js_string!("__routes"), ctx)
        .map_err(|e| PulseError::Script(format!("failed to access route registry: {}", e)))?
        .as_object()
        .cloned()
        .ok_or_else(|| PulseError::Script("route registry is not an object".into()))
}
