//! Core data types: the FFI configuration layout, its Rust-native builder,
//! the opaque engine handle, and the callback registry entry.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use rhai::{Engine, Scope};

/// FFI-stable engine configuration. Field order and size must not change;
/// hosts construct this layout directly.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CRhaiConfig {
    /// Maximum evaluator operations before abort (0 = unlimited).
    pub max_operations: u64,
    /// Maximum call stack depth (0 = unlimited).
    pub max_stack_depth: u64,
    /// Maximum string length in bytes (0 = unlimited).
    pub max_string_length: u64,
    /// Wall-clock evaluation timeout in milliseconds (0 = none). Also bounds
    /// blocking waits on async host-callback responses.
    pub timeout_ms: u64,
    /// Disable `print`/`debug` I/O hooks.
    pub disable_file_io: u8,
    /// Disable the `eval` symbol.
    pub disable_eval: u8,
    /// Disable module resolution (installs a dummy resolver).
    pub disable_modules: u8,
    /// Explicit padding to keep the layout unambiguous across toolchains.
    pub _padding: [u8; 5],
}

impl Default for CRhaiConfig {
    fn default() -> Self {
        Self::secure_defaults()
    }
}

impl CRhaiConfig {
    pub const fn secure_defaults() -> Self {
        Self {
            max_operations: 1_000_000,
            max_stack_depth: 100,
            max_string_length: 10_485_760,
            timeout_ms: 5_000,
            disable_file_io: 1,
            disable_eval: 1,
            disable_modules: 1,
            _padding: [0; 5],
        }
    }

    pub const fn unlimited() -> Self {
        Self {
            max_operations: 0,
            max_stack_depth: 0,
            max_string_length: 0,
            timeout_ms: 0,
            disable_file_io: 0,
            disable_eval: 0,
            disable_modules: 0,
            _padding: [0; 5],
        }
    }
}

/// Rust-native, `Option`-based view of [`CRhaiConfig`]: a zero field means
/// "no limit", represented here as `None` rather than a magic number.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_operations: Option<u64>,
    pub max_stack_depth: Option<u64>,
    pub max_string_length: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub disable_file_io: bool,
    pub disable_eval: bool,
    pub disable_modules: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::secure_defaults()
    }
}

impl EngineConfig {
    pub fn secure_defaults() -> Self {
        Self::from_c_config(&CRhaiConfig::secure_defaults())
    }

    pub fn unlimited() -> Self {
        Self::from_c_config(&CRhaiConfig::unlimited())
    }

    pub fn from_c_config(c: &CRhaiConfig) -> Self {
        Self {
            max_operations: zero_to_none(c.max_operations),
            max_stack_depth: zero_to_none(c.max_stack_depth),
            max_string_length: zero_to_none(c.max_string_length),
            timeout_ms: zero_to_none(c.timeout_ms),
            disable_file_io: c.disable_file_io != 0,
            disable_eval: c.disable_eval != 0,
            disable_modules: c.disable_modules != 0,
        }
    }

    /// Reads overrides from `RHAI_BRIDGE_*` environment variables, falling
    /// back to secure defaults. Intended for local tooling and tests, not
    /// the host-driven path (which always goes through [`CRhaiConfig`]).
    pub fn from_env() -> Self {
        let mut config = Self::secure_defaults();
        if let Some(v) = env_u64("RHAI_BRIDGE_MAX_OPERATIONS") {
            config.max_operations = zero_to_none(v);
        }
        if let Some(v) = env_u64("RHAI_BRIDGE_MAX_STACK_DEPTH") {
            config.max_stack_depth = zero_to_none(v);
        }
        if let Some(v) = env_u64("RHAI_BRIDGE_MAX_STRING_LENGTH") {
            config.max_string_length = zero_to_none(v);
        }
        if let Some(v) = env_u64("RHAI_BRIDGE_TIMEOUT_MS") {
            config.timeout_ms = zero_to_none(v);
        }
        config
    }
}

fn zero_to_none(value: u64) -> Option<u64> {
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

/// One registered host callback, keyed by script-visible name and dispatched
/// by a monotonic ID so renaming/rebinding during concurrent work stays
/// well-defined.
#[derive(Debug, Clone)]
pub struct CallbackEntry {
    pub id: u64,
    pub arity: u8,
    pub name: String,
}

/// Everything an engine owns that is expensive to keep alive: the evaluator,
/// its default scope, and the callback table. Dropped on `engine_free`.
pub struct EngineInner {
    pub engine: Engine,
    pub scope: Scope<'static>,
    pub callbacks: HashMap<String, CallbackEntry>,
    pub next_callback_id: u64,
    pub config: EngineConfig,
}

impl EngineInner {
    pub fn new(engine: Engine, config: EngineConfig) -> Self {
        Self {
            engine,
            scope: Scope::new(),
            callbacks: HashMap::new(),
            next_callback_id: 1,
            config,
        }
    }
}

/// Opaque engine handle exposed to the host as `*mut CRhaiEngine`.
///
/// The outer allocation is never reclaimed by `engine_free`: only `inner` is
/// cleared and `alive` flipped to `false`. A stale pointer dereference after
/// free therefore reads a valid, "dead" handle instead of freed memory, so
/// every subsequent operation observes a [`crate::error::CoreError::Disposed`]
/// error rather than undefined behavior.
pub struct CRhaiEngine {
    alive: AtomicBool,
    inner: Mutex<Option<EngineInner>>,
}

impl CRhaiEngine {
    pub fn new(inner: EngineInner) -> Self {
        Self {
            alive: AtomicBool::new(true),
            inner: Mutex::new(Some(inner)),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Runs `f` against the live inner state, or returns a `Disposed` error
    /// if the engine has been freed.
    pub fn with_inner<T>(
        &self,
        f: impl FnOnce(&mut EngineInner) -> Result<T, crate::error::CoreError>,
    ) -> Result<T, crate::error::CoreError> {
        if !self.is_alive() {
            return Err(crate::error::CoreError::disposed("engine has been freed"));
        }
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.as_mut() {
            Some(inner) => f(inner),
            None => Err(crate::error::CoreError::disposed("engine has been freed")),
        }
    }

    /// Marks the handle dead and drops its expensive interior state. The
    /// outer allocation itself is left in place (see the struct docs).
    pub fn dispose(&self) {
        self.alive
            .store(false, std::sync::atomic::Ordering::Release);
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_defaults_match_spec() {
        let c = CRhaiConfig::secure_defaults();
        assert_eq!(c.max_operations, 1_000_000);
        assert_eq!(c.max_stack_depth, 100);
        assert_eq!(c.max_string_length, 10_485_760);
        assert_eq!(c.timeout_ms, 5_000);
        assert_eq!(c.disable_file_io, 1);
        assert_eq!(c.disable_eval, 1);
        assert_eq!(c.disable_modules, 1);
    }

    #[test]
    fn zero_means_unlimited() {
        let config = EngineConfig::from_c_config(&CRhaiConfig::unlimited());
        assert!(config.max_operations.is_none());
        assert!(config.max_stack_depth.is_none());
        assert!(config.max_string_length.is_none());
        assert!(config.timeout_ms.is_none());
        assert!(!config.disable_file_io);
        assert!(!config.disable_eval);
        assert!(!config.disable_modules);
    }

    #[test]
    fn dispose_marks_dead_and_clears_inner() {
        let inner = EngineInner::new(Engine::new(), EngineConfig::secure_defaults());
        let handle = CRhaiEngine::new(inner);
        assert!(handle.is_alive());

        handle.dispose();
        assert!(!handle.is_alive());

        let result = handle.with_inner(|_| Ok(()));
        assert!(matches!(result, Err(crate::error::CoreError::Disposed { .. })));
    }

    #[test]
    fn dispose_is_idempotent() {
        let inner = EngineInner::new(Engine::new(), EngineConfig::secure_defaults());
        let handle = CRhaiEngine::new(inner);
        handle.dispose();
        handle.dispose();
        assert!(!handle.is_alive());
    }
}
