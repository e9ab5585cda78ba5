//! Interfaces to the systems the worker talks to but does not implement:
//! the key-value data-access layer, query binding, credential lookup, error
//! translation into script exceptions, the debugger and latency recording.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

use crate::config::HandlerConfig;
use crate::metrics::LcbExceptionTally;

#[derive(Debug, Error)]
pub enum DataAccessError {
    #[error("key not found")]
    NotFound,
    #[error("provider error {code}: {message}")]
    Provider { code: i32, message: String },
    #[error("no data-access handle available, pool capacity {0}")]
    PoolExhausted(usize),
    #[error("connect failed: {0}")]
    Connect(String),
}

impl DataAccessError {
    pub fn provider_code(&self) -> Option<i32> {
        match self {
            DataAccessError::Provider { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// One open handle to the data store.
pub trait DataAccess: Send {
    fn get(&mut self, key: &str) -> Result<Vec<u8>, DataAccessError>;
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), DataAccessError>;
    fn delete(&mut self, key: &str) -> Result<(), DataAccessError>;
}

pub trait DataAccessConnector: Send + Sync {
    fn connect(&self, config: &HandlerConfig) -> Result<Box<dyn DataAccess>, DataAccessError>;
}

/// Fixed set of handles opened at load time.
pub struct ConnectionPool {
    idle: Mutex<Vec<Box<dyn DataAccess>>>,
    capacity: usize,
    tally: Arc<LcbExceptionTally>,
}

impl ConnectionPool {
    pub fn open(
        connector: &dyn DataAccessConnector,
        config: &HandlerConfig,
        tally: Arc<LcbExceptionTally>,
    ) -> Result<Self, DataAccessError> {
        let capacity = config.lcb_inst_capacity.max(1);
        let mut idle = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push(connector.connect(config)?);
        }
        tracing::debug!("opened {} data-access handles for {}", capacity, config.app_name);
        Ok(Self {
            idle: Mutex::new(idle),
            capacity,
            tally,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn acquire(&self) -> Result<PooledConnection<'_>, DataAccessError> {
        let handle = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .ok_or(DataAccessError::PoolExhausted(self.capacity))?;
        Ok(PooledConnection {
            pool: self,
            handle: Some(handle),
        })
    }

    fn release(&self, handle: Box<dyn DataAccess>) {
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }
}

/// A borrowed handle; goes back to the pool on drop. Provider errors from the
/// `get`/`set`/`delete` wrappers are tallied by code.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    handle: Option<Box<dyn DataAccess>>,
}

impl PooledConnection<'_> {
    pub fn get(&mut self, key: &str) -> Result<Vec<u8>, DataAccessError> {
        let result = self.deref_mut().get(key);
        self.tally(result)
    }

    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<(), DataAccessError> {
        let result = self.deref_mut().set(key, value);
        self.tally(result)
    }

    pub fn delete(&mut self, key: &str) -> Result<(), DataAccessError> {
        let result = self.deref_mut().delete(key);
        self.tally(result)
    }

    pub fn release(self) {}

    fn tally<T>(&self, result: Result<T, DataAccessError>) -> Result<T, DataAccessError> {
        if let Err(err) = &result {
            if let Some(code) = err.provider_code() {
                self.pool.tally.add(code);
            }
        }
        result
    }
}

impl Deref for PooledConnection<'_> {
    type Target = dyn DataAccess;

    fn deref(&self) -> &Self::Target {
        match &self.handle {
            Some(handle) => handle.as_ref(),
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.handle {
            Some(handle) => handle.as_mut(),
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, host: &str, port: &str, bucket: &str) -> Option<Credentials>;
}

/// Memoizes another resolver per `(host, port, bucket)`.
pub struct CachedCredentials<R> {
    inner: R,
    cache: Mutex<HashMap<(String, String, String), Credentials>>,
}

impl<R: CredentialResolver> CachedCredentials<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

impl<R: CredentialResolver> CredentialResolver for CachedCredentials<R> {
    fn resolve(&self, host: &str, port: &str, bucket: &str) -> Option<Credentials> {
        let key = (host.to_string(), port.to_string(), bucket.to_string());
        if let Some(hit) = self.cache.lock().ok().and_then(|c| c.get(&key).cloned()) {
            return Some(hit);
        }
        let resolved = self.inner.resolve(host, port, bucket)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, resolved.clone());
        }
        Some(resolved)
    }
}

pub type QueryRows = Box<dyn Iterator<Item = Result<serde_json::Value, DataAccessError>>>;

pub trait QueryBinding {
    fn execute(
        &mut self,
        query: &str,
        params: &[serde_json::Value],
    ) -> Result<QueryRows, DataAccessError>;
}

/// What a script sees when a provider call fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptException {
    pub name: String,
    pub code: String,
    pub description: String,
}

pub trait ErrorTranslator: Send + Sync {
    fn translate(&self, code: i32, diagnostics: &[String]) -> ScriptException;

    /// A bare message such as `"LCB_KEY_ENOENT: The key does not exist"`.
    fn from_message(&self, message: &str) -> ScriptException {
        let (name, description) = match message.split_once(':') {
            Some((name, rest)) if !name.contains(' ') => (name.trim(), rest.trim()),
            _ => ("Error", message.trim()),
        };
        ScriptException {
            name: name.to_string(),
            code: String::new(),
            description: description.to_string(),
        }
    }
}

/// Well-known provider codes with their symbolic names.
pub struct ProviderErrorTranslator;

const PROVIDER_ERRORS: &[(i32, &str, &str)] = &[
    (0x02, "LCB_AUTH_ERROR", "Authentication failed"),
    (0x04, "LCB_DELTA_BADVAL", "The value requested to be incremented is not stored as a number"),
    (0x05, "LCB_E2BIG", "Object too big"),
    (0x07, "LCB_EINTERNAL", "Internal error"),
    (0x09, "LCB_ENOMEM", "Out of memory"),
    (0x0A, "LCB_ERANGE", "Invalid range"),
    (0x0C, "LCB_KEY_EEXISTS", "The key already exists in the server"),
    (0x0D, "LCB_KEY_ENOENT", "The key does not exist on the server"),
    (0x17, "LCB_ETIMEDOUT", "Client-Side timeout exceeded for operation"),
    (0x18, "LCB_CONNECT_ERROR", "Error while establishing TCP connection"),
    (0x1A, "LCB_EBUSY", "The server is too busy to handle the request"),
];

impl ErrorTranslator for ProviderErrorTranslator {
    fn translate(&self, code: i32, diagnostics: &[String]) -> ScriptException {
        let (name, mut description) = PROVIDER_ERRORS
            .iter()
            .find(|(known, _, _)| *known == code)
            .map(|(_, name, desc)| (name.to_string(), desc.to_string()))
            .unwrap_or_else(|| ("LCB_UNKNOWN".to_string(), format!("error code {}", code)));
        for diagnostic in diagnostics {
            description.push_str("; ");
            description.push_str(diagnostic);
        }
        ScriptException {
            name,
            code: code.to_string(),
            description,
        }
    }
}

/// Debugger session hooks. While a session is active the watchdog leaves
/// invocations alone.
pub trait Inspector: Send {
    fn start(&mut self, port: &str) -> Result<(), String>;
    fn stop(&mut self);
    fn debug_execute(&mut self, function: &str, args: &[serde_json::Value]) -> Result<(), String>;
}

pub trait LatencyRecorder: Send + Sync {
    fn record(&self, duration_nanos: u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MemoryStore {
        data: HashMap<String, Vec<u8>>,
    }

    impl DataAccess for MemoryStore {
        fn get(&mut self, key: &str) -> Result<Vec<u8>, DataAccessError> {
            if key == "locked" {
                return Err(DataAccessError::Provider {
                    code: 0x1A,
                    message: "busy".into(),
                });
            }
            self.data.get(key).cloned().ok_or(DataAccessError::NotFound)
        }

        fn set(&mut self, key: &str, value: &[u8]) -> Result<(), DataAccessError> {
            self.data.insert(key.to_string(), value.to_vec());
            Ok(())
        }

        fn delete(&mut self, key: &str) -> Result<(), DataAccessError> {
            self.data.remove(key).map(|_| ()).ok_or(DataAccessError::NotFound)
        }
    }

    struct MemoryConnector;

    impl DataAccessConnector for MemoryConnector {
        fn connect(&self, _: &HandlerConfig) -> Result<Box<dyn DataAccess>, DataAccessError> {
            Ok(Box::new(MemoryStore {
                data: HashMap::new(),
            }))
        }
    }

    #[test]
    fn pool_hands_out_capacity_handles() {
        let mut config = HandlerConfig::new("app");
        config.lcb_inst_capacity = 2;
        let tally = Arc::new(LcbExceptionTally::default());
        let pool = ConnectionPool::open(&MemoryConnector, &config, Arc::clone(&tally)).expect("open");
        assert_eq!(pool.capacity(), 2);

        let first = pool.acquire().expect("first");
        let mut second = pool.acquire().expect("second");
        assert!(matches!(pool.acquire(), Err(DataAccessError::PoolExhausted(2))));

        second.set("k", b"v").expect("set");
        assert_eq!(second.get("k").expect("get"), b"v".to_vec());
        assert!(matches!(second.get("missing"), Err(DataAccessError::NotFound)));
        assert!(second.get("locked").is_err());
        assert_eq!(tally.snapshot().get(&0x1A), Some(&1));

        first.release();
        drop(second);
        assert_eq!(pool.available(), 2);
    }

    struct CountingResolver(AtomicUsize);

    impl CredentialResolver for CountingResolver {
        fn resolve(&self, host: &str, _: &str, _: &str) -> Option<Credentials> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Some(Credentials {
                username: format!("user@{}", host),
                password: "secret".into(),
            })
        }
    }

    #[test]
    fn cached_credentials_resolve_once() {
        let cached = CachedCredentials::new(CountingResolver(AtomicUsize::new(0)));
        let a = cached.resolve("kv1", "11210", "src");
        let b = cached.resolve("kv1", "11210", "src");
        assert_eq!(a, b);
        assert_eq!(cached.inner.0.load(Ordering::Relaxed), 1);
        cached.invalidate();
        cached.resolve("kv1", "11210", "src");
        assert_eq!(cached.inner.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn translator_names_known_codes() {
        let translator = ProviderErrorTranslator;
        let exc = translator.translate(0x0D, &["vb 7".to_string()]);
        assert_eq!(exc.name, "LCB_KEY_ENOENT");
        assert_eq!(exc.code, "13");
        assert!(exc.description.ends_with("; vb 7"));
        assert_eq!(translator.translate(999, &[]).name, "LCB_UNKNOWN");

        let parsed = translator.from_message("LCB_ETIMEDOUT: took too long");
        assert_eq!(parsed.name, "LCB_ETIMEDOUT");
        assert_eq!(parsed.description, "took too long");
        assert_eq!(translator.from_message("plain failure").name, "Error");
    }
}
