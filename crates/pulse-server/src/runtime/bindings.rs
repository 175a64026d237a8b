//! Host functions exposed to user scripts.
//!
//! This is the single place where native Rust functions are installed into
//! a fresh Boa context. The surface:
//!
//! - `pulse.get/post/put/delete/patch/head/options(path, handler)`: route
//!   registration sugar over the `pulse.__routes` registry
//! - the request-context object passed to every handler: `method()`,
//!   `path()`, `query(name)`, `header(name)`, `body()`, `host()`, `ip()`,
//!   `protocol()`, `form(name)`, `cookie(name)`, `setStatus(code)`,
//!   `setHeader(name, value)`, `setCookie(name, value)`,
//!   `clearCookie(name)`, `clearCookies()`, `redirect(target, code)`
//! - `kv.memory` / `kv.disk`: `get(key)`, `listKeys(prefix, limit)`,
//!   `listPairs(prefix, limit)`, `transaction(callback)`,
//!   `serialTransaction(callback)`; the transaction wrappers hand the
//!   callback a `store` object with `get`/`set`/`delete` bound to the
//!   context's active transaction
//! - `pulse.ulid()`: monotonic, time-ordered string identifiers
//!
//! Natives hold their state in capture structs cloned into each closure;
//! nothing is smuggled through the JavaScript heap.

use crate::kv::Medium;
use crate::runtime::association::{AssociationTable, StoreBinding};
use crate::runtime::request::RequestState;
use crate::runtime::ContextId;
use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{builtins::JsArray, FunctionObjectBuilder, JsObject},
    property::Attribute,
    value::JsValue,
    Context, JsNativeError, JsResult, Source,
};
use boa_gc::{Finalize, Trace};
use hyper::header::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use pulse_common::error::{PulseError, Result};
use std::sync::Arc;

/// Route sugar installed after the natives; stores handlers under
/// `"METHOD path"` keys.
const PRELUDE: &str = r#"
(function() {
    const verbs = ['GET', 'POST', 'PUT', 'DELETE', 'PATCH', 'HEAD', 'OPTIONS'];
    for (const verb of verbs) {
        pulse[verb.toLowerCase()] = function(path, handler) {
            pulse.__route(verb, path, handler);
        };
    }
})();
"#;

/// State shared by every native function of one execution context.
#[derive(Clone, Trace, Finalize)]
pub struct Host {
    #[unsafe_ignore_trace]
    context_id: ContextId,
    #[unsafe_ignore_trace]
    associations: Arc<AssociationTable>,
    #[unsafe_ignore_trace]
    ulid: Arc<Mutex<ulid::Generator>>,
}

impl Host {
    pub fn new(
        context_id: ContextId,
        associations: Arc<AssociationTable>,
        ulid: Arc<Mutex<ulid::Generator>>,
    ) -> Self {
        Self {
            context_id,
            associations,
            ulid,
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// The request currently bound to this context. A missing binding is a
    /// broken dispatcher invariant (context used before binding) and is
    /// fatal at the point of detection.
    fn request(&self) -> Arc<RequestState> {
        let entry = self.associations.get(self.context_id).unwrap_or_else(|| {
            tracing::error!(context = %self.context_id, "no association entry for context");
            panic!("{}", PulseError::AssociationMissing("request accessed before binding"));
        });
        entry.request.clone().unwrap_or_else(|| {
            tracing::error!(context = %self.context_id, "no request bound to context");
            panic!("{}", PulseError::AssociationMissing("request accessed before binding"));
        })
    }

    /// The store binding for the given medium; attached during context
    /// initialization, so its absence is the same broken invariant.
    fn store(&self, medium: Medium) -> Arc<StoreBinding> {
        let entry = self.associations.get(self.context_id).unwrap_or_else(|| {
            tracing::error!(context = %self.context_id, "no association entry for context");
            panic!("{}", PulseError::AssociationMissing("store accessed before binding"));
        });
        let binding = match medium {
            Medium::Memory => entry.memory.clone(),
            Medium::Disk => entry.disk.clone(),
        };
        binding.unwrap_or_else(|| {
            tracing::error!(context = %self.context_id, medium = medium.as_str(), "no store bound");
            panic!("{}", PulseError::AssociationMissing("store accessed before binding"));
        })
    }
}

/// Capture for the read-only request accessors.
#[derive(Clone, Trace, Finalize)]
struct AccessorHost {
    host: Host,
    #[unsafe_ignore_trace]
    accessor: fn(&Host, &[JsValue]) -> String,
}

/// Capture for medium-scoped natives.
#[derive(Clone, Trace, Finalize)]
struct MediumHost {
    host: Host,
    #[unsafe_ignore_trace]
    medium: Medium,
    #[unsafe_ignore_trace]
    serial: bool,
}

/// Install the complete host function table into a fresh context,
/// then evaluate the route-sugar prelude.
pub fn install_host_functions(ctx: &mut Context, host: &Host) -> Result<()> {
    let pulse = JsObject::with_object_proto(ctx.intrinsics());

    let routes = JsObject::with_object_proto(ctx.intrinsics());
    set(ctx, &pulse, "__routes", routes)?;
    let route = route_fn(ctx);
    set(ctx, &pulse, "__route", route)?;
    let request = request_object(ctx, host)?;
    set(ctx, &pulse, "__request", request)?;
    let ulid = ulid_fn(ctx, host);
    set(ctx, &pulse, "ulid", ulid)?;

    let kv = JsObject::with_object_proto(ctx.intrinsics());
    let memory = medium_object(ctx, host, Medium::Memory)?;
    set(ctx, &kv, "memory", memory)?;
    let disk = medium_object(ctx, host, Medium::Disk)?;
    set(ctx, &kv, "disk", disk)?;

    ctx.register_global_property(js_string!("pulse"), pulse, Attribute::all())
        .map_err(|e| PulseError::Script(e.to_string()))?;
    ctx.register_global_property(js_string!("kv"), kv, Attribute::all())
        .map_err(|e| PulseError::Script(e.to_string()))?;

    ctx.eval(Source::from_bytes(PRELUDE))
        .map_err(|e| PulseError::Script(format!("prelude evaluation error: {}", e)))?;

    Ok(())
}

/// Native `pulse.__route(method, path, handler)`.
fn route_fn(ctx: &mut Context) -> JsObject {
    FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure(|_this, args, context| {
            let method = string_arg(args, 0, "method")?;
            let path = string_arg(args, 1, "path")?;

            let handler = args
                .get(2)
                .ok_or_else(|| JsNativeError::typ().with_message("handler argument required"))?;
            if !handler.as_object().is_some_and(|o| o.is_callable()) {
                return Err(JsNativeError::typ()
                    .with_message("handler must be a function")
                    .into());
            }

            let pulse = context
                .global_object()
                .get(js_string!("pulse"), context)?;
            let routes = pulse
                .as_object()
                .and_then(|o| o.get(js_string!("__routes"), context).ok())
                .and_then(|v| v.as_object().cloned())
                .ok_or_else(|| {
                    JsNativeError::typ().with_message("route registry is not an object")
                })?;

            let key = format!("{} {}", method, path);
            routes.set(js_string!(key), handler.clone(), true, context)?;

            Ok(JsValue::undefined())
        }),
    )
    .build()
    .into()
}

/// Native `pulse.ulid()`: monotonically increasing, time-ordered string
/// identifiers from the process-wide generator.
fn ulid_fn(ctx: &mut Context, host: &Host) -> JsObject {
    FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, host: &Host, _context| {
                let id = {
                    let mut generator = host.ulid.lock();
                    // Random-part overflow within one millisecond is the
                    // only failure; fall back to a fresh ULID.
                    generator.generate().unwrap_or_else(|_| ulid::Ulid::new())
                };
                Ok(JsValue::new(js_string!(id.to_string())))
            },
            host.clone(),
        ),
    )
    .build()
    .into()
}

/// The request-context object handed to handlers as their only argument.
fn request_object(ctx: &mut Context, host: &Host) -> Result<JsObject> {
    let request = JsObject::with_object_proto(ctx.intrinsics());

    let accessors: [(&str, fn(&Host, &[JsValue]) -> String); 10] = [
        ("method", |host, _args| host.request().method.clone()),
        ("path", |host, _args| host.request().path.clone()),
        ("body", |host, _args| host.request().body.clone()),
        ("host", |host, _args| host.request().host().to_string()),
        ("ip", |host, _args| host.request().remote_ip.clone()),
        ("protocol", |host, _args| host.request().protocol().to_string()),
        ("query", |host, args| {
            let name = plain_string(args, 0);
            host.request().query_param(&name).unwrap_or_default().to_string()
        }),
        ("header", |host, args| {
            let name = plain_string(args, 0);
            host.request().header(&name).unwrap_or_default().to_string()
        }),
        ("form", |host, args| {
            let name = plain_string(args, 0);
            host.request().form_param(&name).unwrap_or_default()
        }),
        ("cookie", |host, args| {
            let name = plain_string(args, 0);
            host.request().cookie(&name).unwrap_or_default()
        }),
    ];

    for (name, accessor) in accessors {
        let func = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &AccessorHost, _context| {
                    Ok(JsValue::new(js_string!((captures.accessor)(
                        &captures.host,
                        args
                    ))))
                },
                AccessorHost {
                    host: host.clone(),
                    accessor,
                },
            ),
        )
        .build();
        set(ctx, &request, name, func)?;
    }

    let set_status = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, host: &Host, _context| {
                let status = args
                    .first()
                    .and_then(JsValue::as_number)
                    .filter(|n| (100.0..600.0).contains(n))
                    .ok_or_else(|| {
                        JsNativeError::typ().with_message("setStatus expects an HTTP status code")
                    })? as u16;
                host.request().response.lock().status = status;
                Ok(JsValue::undefined())
            },
            host.clone(),
        ),
    )
    .build();
    set(ctx, &request, "setStatus", set_status)?;

    let set_header = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, host: &Host, _context| {
                let name = string_arg(args, 0, "header name")?;
                let value = string_arg(args, 1, "header value")?;
                // Reject here so a bad name or value surfaces to the script
                // instead of poisoning the HTTP response builder later.
                if HeaderName::try_from(name.as_str()).is_err() {
                    return Err(JsNativeError::typ()
                        .with_message(format!("invalid header name: {:?}", name))
                        .into());
                }
                if HeaderValue::try_from(value.as_str()).is_err() {
                    return Err(JsNativeError::typ()
                        .with_message(format!("invalid header value for {}", name))
                        .into());
                }
                host.request().response.lock().headers.push((name, value));
                Ok(JsValue::undefined())
            },
            host.clone(),
        ),
    )
    .build();
    set(ctx, &request, "setHeader", set_header)?;

    let set_cookie = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, host: &Host, _context| {
                let name = string_arg(args, 0, "cookie name")?;
                let value = string_arg(args, 1, "cookie value")?;
                let cookie = format!("{}={}; Path=/", name, value);
                if HeaderValue::try_from(cookie.as_str()).is_err() {
                    return Err(JsNativeError::typ()
                        .with_message("invalid cookie name or value")
                        .into());
                }
                host.request()
                    .response
                    .lock()
                    .headers
                    .push(("set-cookie".to_string(), cookie));
                Ok(JsValue::undefined())
            },
            host.clone(),
        ),
    )
    .build();
    set(ctx, &request, "setCookie", set_cookie)?;

    let clear_cookie = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, host: &Host, _context| {
                let name = string_arg(args, 0, "cookie name")?;
                let cookie = expired_cookie(&name);
                if HeaderValue::try_from(cookie.as_str()).is_err() {
                    return Err(JsNativeError::typ()
                        .with_message("invalid cookie name")
                        .into());
                }
                host.request()
                    .response
                    .lock()
                    .headers
                    .push(("set-cookie".to_string(), cookie));
                Ok(JsValue::undefined())
            },
            host.clone(),
        ),
    )
    .build();
    set(ctx, &request, "clearCookie", clear_cookie)?;

    let clear_cookies = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, host: &Host, _context| {
                let request = host.request();
                let names = request.cookie_names();
                let mut response = request.response.lock();
                for name in names {
                    let cookie = expired_cookie(&name);
                    // Names came in on the Cookie header; skip any that
                    // would not round-trip as a header value.
                    if HeaderValue::try_from(cookie.as_str()).is_ok() {
                        response.headers.push(("set-cookie".to_string(), cookie));
                    }
                }
                Ok(JsValue::undefined())
            },
            host.clone(),
        ),
    )
    .build();
    set(ctx, &request, "clearCookies", clear_cookies)?;

    let redirect = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, host: &Host, _context| {
                let target = string_arg(args, 0, "redirect target")?;
                if HeaderValue::try_from(target.as_str()).is_err() {
                    return Err(JsNativeError::typ()
                        .with_message("invalid redirect target")
                        .into());
                }
                let status = match args.get(1).filter(|v| !v.is_undefined()) {
                    None => 302,
                    Some(v) => v
                        .as_number()
                        .filter(|n| (100.0..600.0).contains(n))
                        .ok_or_else(|| {
                            JsNativeError::typ()
                                .with_message("redirect expects an HTTP status code")
                        })? as u16,
                };
                let request = host.request();
                let mut response = request.response.lock();
                response.status = status;
                response.headers.push(("location".to_string(), target));
                Ok(JsValue::undefined())
            },
            host.clone(),
        ),
    )
    .build();
    set(ctx, &request, "redirect", redirect)?;

    Ok(request)
}

fn expired_cookie(name: &str) -> String {
    format!("{}=; Path=/; Max-Age=0", name)
}

/// One medium's `kv` object: snapshot reads, prefix listings, and the two
/// transaction wrappers.
fn medium_object(ctx: &mut Context, host: &Host, medium: Medium) -> Result<JsObject> {
    let object = JsObject::with_object_proto(ctx.intrinsics());

    let get = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, mh: &MediumHost, _context| {
                let key = plain_string(args, 0);
                let value = mh
                    .host
                    .store(mh.medium)
                    .store()
                    .get(key.as_bytes())
                    .map_err(|e| kv_error(mh.medium, "get", e))?;
                // An absent key is an empty string, not an error.
                Ok(JsValue::new(js_string!(lossy(value.unwrap_or_default()))))
            },
            medium_host(host, medium, false),
        ),
    )
    .build();
    set(ctx, &object, "get", get)?;

    let list_keys = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, mh: &MediumHost, context| {
                let prefix = plain_string(args, 0);
                let limit = limit_arg(args, 1);
                let keys = mh
                    .host
                    .store(mh.medium)
                    .store()
                    .list_keys(prefix.as_bytes(), limit)
                    .map_err(|e| kv_error(mh.medium, "listKeys", e))?;

                let array = JsArray::new(context);
                for key in keys {
                    array.push(JsValue::new(js_string!(lossy(key))), context)?;
                }
                Ok(array.into())
            },
            medium_host(host, medium, false),
        ),
    )
    .build();
    set(ctx, &object, "listKeys", list_keys)?;

    let list_pairs = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, mh: &MediumHost, context| {
                let prefix = plain_string(args, 0);
                let limit = limit_arg(args, 1);
                let pairs = mh
                    .host
                    .store(mh.medium)
                    .store()
                    .list_pairs(prefix.as_bytes(), limit)
                    .map_err(|e| kv_error(mh.medium, "listPairs", e))?;

                let array = JsArray::new(context);
                for pair in pairs {
                    let entry = JsObject::with_object_proto(context.intrinsics());
                    entry.create_data_property_or_throw(
                        js_string!("key"),
                        JsValue::new(js_string!(lossy(pair.key))),
                        context,
                    )?;
                    entry.create_data_property_or_throw(
                        js_string!("value"),
                        JsValue::new(js_string!(lossy(pair.value))),
                        context,
                    )?;
                    array.push(entry, context)?;
                }
                Ok(array.into())
            },
            medium_host(host, medium, false),
        ),
    )
    .build();
    set(ctx, &object, "listPairs", list_pairs)?;

    let transaction = transaction_fn(ctx, medium_host(host, medium, false));
    set(ctx, &object, "transaction", transaction)?;
    let serial = transaction_fn(ctx, medium_host(host, medium, true));
    set(ctx, &object, "serialTransaction", serial)?;

    Ok(object)
}

/// `transaction(callback)` / `serialTransaction(callback)`: start a
/// transaction on the context's store binding, run the callback with a
/// `store` object, then commit. A throwing callback discards the pending
/// writes instead of committing them.
fn transaction_fn(ctx: &mut Context, mh: MediumHost) -> JsObject {
    FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, mh: &MediumHost, context| {
                let callback = args
                    .first()
                    .and_then(|v| v.as_object())
                    .filter(|o| o.is_callable())
                    .cloned()
                    .ok_or_else(|| {
                        JsNativeError::typ().with_message("transaction expects a callback")
                    })?;

                let binding = mh.host.store(mh.medium);
                binding
                    .begin(mh.serial)
                    .map_err(|e| kv_error(mh.medium, "transaction start", e))?;

                let store = store_object(context, mh.clone()).map_err(|e| {
                    binding.discard();
                    JsNativeError::error().with_message(e.to_string())
                })?;

                let result = callback.call(&JsValue::undefined(), &[store.into()], context);
                match result {
                    Ok(_) => binding
                        .end()
                        .map_err(|e| kv_error(mh.medium, "transaction commit", e))?,
                    Err(e) => {
                        binding.discard();
                        return Err(e);
                    }
                }

                Ok(JsValue::undefined())
            },
            mh,
        ),
    )
    .build()
    .into()
}

/// The `store` object a transaction callback receives; reads and writes go
/// through the binding's active transaction.
fn store_object(ctx: &mut Context, mh: MediumHost) -> Result<JsObject> {
    let store = JsObject::with_object_proto(ctx.intrinsics());

    let get = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, mh: &MediumHost, _context| {
                let key = plain_string(args, 0);
                let value = mh
                    .host
                    .store(mh.medium)
                    .txn_get(key.as_bytes())
                    .map_err(|e| kv_error(mh.medium, "store.get", e))?;
                Ok(JsValue::new(js_string!(lossy(value.unwrap_or_default()))))
            },
            mh.clone(),
        ),
    )
    .build();
    set(ctx, &store, "get", get)?;

    let set_fn = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, mh: &MediumHost, _context| {
                let key = string_arg(args, 0, "key")?;
                let value = string_arg(args, 1, "value")?;
                mh.host
                    .store(mh.medium)
                    .txn_set(key.as_bytes(), value.as_bytes())
                    .map_err(|e| kv_error(mh.medium, "store.set", e))?;
                Ok(JsValue::undefined())
            },
            mh.clone(),
        ),
    )
    .build();
    set(ctx, &store, "set", set_fn)?;

    let delete = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, mh: &MediumHost, _context| {
                let key = string_arg(args, 0, "key")?;
                mh.host
                    .store(mh.medium)
                    .txn_delete(key.as_bytes())
                    .map_err(|e| kv_error(mh.medium, "store.delete", e))?;
                Ok(JsValue::undefined())
            },
            mh.clone(),
        ),
    )
    .build();
    set(ctx, &store, "delete", delete)?;

    Ok(store)
}

fn medium_host(host: &Host, medium: Medium, serial: bool) -> MediumHost {
    MediumHost {
        host: host.clone(),
        medium,
        serial,
    }
}

fn set(ctx: &mut Context, object: &JsObject, name: &str, value: impl Into<JsValue>) -> Result<()> {
    object
        .set(js_string!(name), value.into(), false, ctx)
        .map(|_| ())
        .map_err(|e| PulseError::Script(e.to_string()))
}

/// Required string argument; missing or non-string is a type error.
fn string_arg(args: &[JsValue], index: usize, name: &str) -> JsResult<String> {
    args.get(index)
        .and_then(|v| v.as_string())
        .ok_or_else(|| {
            JsNativeError::typ().with_message(format!("{} must be a string", name))
        })?
        .to_std_string()
        .map_err(|e| {
            JsNativeError::typ()
                .with_message(format!("invalid {}: {:?}", name, e))
                .into()
        })
}

/// Optional string argument, coerced to empty on absence.
fn plain_string(args: &[JsValue], index: usize) -> String {
    args.get(index)
        .and_then(|v| v.as_string())
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_default()
}

/// Optional listing limit. An omitted, non-numeric, or negative limit
/// means unlimited: `listKeys(prefix)` returns the whole prefix range
/// rather than an empty result.
fn limit_arg(args: &[JsValue], index: usize) -> usize {
    args.get(index)
        .and_then(JsValue::as_number)
        .filter(|n| *n >= 0.0)
        .map(|n| n as usize)
        .unwrap_or(usize::MAX)
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

fn kv_error(medium: Medium, operation: &str, err: PulseError) -> boa_engine::JsError {
    tracing::error!(medium = medium.as_str(), operation, error = %err, "kv host call failed");
    JsNativeError::error()
        .with_message(format!("{} failed on {}: {}", operation, medium.as_str(), err))
        .into()
}
