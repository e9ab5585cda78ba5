//! V8 through deno_core: one `JsRuntime` per worker, holding one compiled handler.

use std::sync::Arc;

use deno_core::{JsRuntime, ModuleCodeString, RuntimeOptions, serde_v8, v8};
use protocol::TimerRequest;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::engine::{EngineError, HandlerSet, Invocation, ScriptEngine, Terminator, is_identifier};

const PRELUDE: &str = r#"
globalThis.__eventingTimers = [];
globalThis.createTimer = function (callback, due, reference, context) {
  const name = typeof callback === 'function' ? callback.name : String(callback);
  if (!name) {
    throw new TypeError('createTimer: callback must be a named function');
  }
  const when = due instanceof Date ? due.getTime() / 1000 : Number(due);
  if (!Number.isFinite(when)) {
    throw new TypeError('createTimer: due must be a Date or unix seconds');
  }
  globalThis.__eventingTimers.push({
    callback: name,
    due: Math.trunc(when),
    reference: String(reference),
    context: context === undefined ? null : context,
  });
};
globalThis.__eventingDrainTimers = function () {
  const timers = globalThis.__eventingTimers;
  globalThis.__eventingTimers = [];
  return timers;
};
"#;

const HANDLER_PROBE: &str = r#"({
  on_update: typeof OnUpdate === 'function',
  on_delete: typeof OnDelete === 'function',
})"#;

struct IsolateTerminator(v8::IsolateHandle);

impl Terminator for IsolateTerminator {
    fn terminate(&self) {
        self.0.terminate_execution();
    }
}

pub struct V8Engine {
    runtime: JsRuntime,
    handlers: HandlerSet,
}

impl V8Engine {
    pub fn new() -> Result<Self, EngineError> {
        let mut runtime = JsRuntime::new(RuntimeOptions::default());
        runtime
            .execute_script("eventing:prelude", ModuleCodeString::from(PRELUDE.to_string()))
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        Ok(Self {
            runtime,
            handlers: HandlerSet::default(),
        })
    }

    pub fn handlers(&self) -> HandlerSet {
        self.handlers
    }

    fn set_global<T: Serialize>(&mut self, name: &str, value: &T) -> Result<(), EngineError> {
        deno_core::scope!(scope, &mut self.runtime);
        let context = scope.get_current_context();
        let global = context.global(scope);
        let key = v8::String::new(scope, name)
            .ok_or_else(|| EngineError::Conversion(format!("{} key", name)))?;
        let value = serde_v8::to_v8(scope, value)
            .map_err(|err| EngineError::Conversion(format!("{} to v8: {}", name, err)))?;
        global.set(scope, key.into(), value);
        Ok(())
    }

    fn read<T: DeserializeOwned>(&mut self, value: v8::Global<v8::Value>) -> Result<T, EngineError> {
        deno_core::scope!(scope, &mut self.runtime);
        let local = v8::Local::new(scope, &value);
        serde_v8::from_v8::<T>(scope, local).map_err(|err| EngineError::Conversion(err.to_string()))
    }
}

impl ScriptEngine for V8Engine {
    fn load(&mut self, script: &str) -> Result<HandlerSet, EngineError> {
        self.runtime
            .execute_script("handler.js", ModuleCodeString::from(script.to_string()))
            .map_err(|err| EngineError::Compile(err.to_string()))?;
        let probe = self
            .runtime
            .execute_script("eventing:probe", ModuleCodeString::from(HANDLER_PROBE.to_string()))
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        self.handlers = self.read::<HandlerSet>(probe)?;
        Ok(self.handlers)
    }

    fn invoke(&mut self, invocation: Invocation<'_>) -> Result<Vec<TimerRequest>, EngineError> {
        let entry = invocation.entry_point();
        if !is_identifier(entry) {
            return Err(EngineError::Exception(format!(
                "{:?} is not a callable name",
                entry
            )));
        }
        let call = format!(
            "globalThis.__eventingTimers = [];\n\
             if (typeof {entry} !== 'function') {{ throw new ReferenceError('{entry} is not a function'); }}\n\
             {entry}.apply(globalThis, globalThis.__eventingArgs);\n\
             globalThis.__eventingDrainTimers();"
        );

        let args = invocation.arguments()?;
        self.set_global("__eventingArgs", &args)?;
        let result = self
            .runtime
            .execute_script("handler.js", ModuleCodeString::from(call))
            .map_err(|err| EngineError::Exception(err.to_string()))?;
        self.read::<Vec<TimerRequest>>(result)
    }

    fn terminator(&mut self) -> Arc<dyn Terminator> {
        Arc::new(IsolateTerminator(
            self.runtime.v8_isolate().thread_safe_handle(),
        ))
    }

    fn clear_termination(&mut self) {
        self.runtime
            .v8_isolate()
            .thread_safe_handle()
            .cancel_terminate_execution();
    }
}
