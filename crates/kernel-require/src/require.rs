//! Requirement dispatch service and its initialization state machine.
//!
//! [`RequireService`] owns the process-wide mutable state: the requirement
//! store and the three channel generations. Hold exactly one instance per
//! kernel process and pass it to callers explicitly; the singleton lives
//! in the owner's scope, not in hidden globals.
//!
//! Channels do not survive a frontend reload. The service survives: after a
//! reload, `reload()` tears down the dead channel references and brings up
//! a fresh generation while (usually) preserving the store.

use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, info};
use serde_json::Value;

use crate::comm::{session_tag, Comm, CommTransport, MessageCallback, TransportError};
use crate::protocol::{
    ExecutePayload, SafeExecutePayload, CONFIG_TARGET, EXECUTE_TARGET, SAFE_EXECUTE_TARGET,
};
use crate::store::RequireStore;
use crate::template::{JsTemplate, TemplateError, TemplateParams};

/// Error type for dispatch and initialization operations.
#[derive(Debug, thiserror::Error)]
pub enum RequireError {
    /// An initialization-state transition was attempted with channels in an
    /// inconsistent configuration.
    #[error("Inconsistent initialization state: {0}")]
    Configuration(String),

    /// A send was attempted while the channel is absent. The usual cause is
    /// a frontend reload that invalidated the channels.
    #[error(
        "Comm channel `{target}` is not available; reload the frontend page, \
         then call `reload()` to re-initialize"
    )]
    CommUnavailable { target: &'static str },

    /// `execute_with_requirements` with `configured = false` needs a path
    /// mapping, not a key list.
    #[error("`required` must be a path mapping when `configured` is false")]
    RequirementsNotMapping,

    /// `pop` was called for a key that is not declared.
    #[error("Unknown library key `{0}`")]
    UnknownLibrary(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Transport failure on `{target}`: {source}")]
    Transport {
        target: &'static str,
        #[source]
        source: TransportError,
    },
}

/// Initialization lifecycle of the channel set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Library requirements for one execution.
#[derive(Debug, Clone)]
pub enum Requirements {
    /// Keys assumed to be configured already.
    Keys(Vec<String>),
    /// Path mapping to configure before dispatch.
    Paths(IndexMap<String, String>),
}

impl Requirements {
    /// Requirement keys, in declaration order.
    pub fn keys(&self) -> Vec<String> {
        match self {
            Requirements::Keys(keys) => keys.clone(),
            Requirements::Paths(paths) => paths.keys().cloned().collect(),
        }
    }
}

/// Options for `execute`-family dispatches.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Suppress frontend display of the execution.
    pub silent: bool,
    /// Whether the requirements are already configured. When false,
    /// `required` must be a path mapping and is configured first.
    pub configured: bool,
    /// Extra template parameters rendered into the script.
    pub params: TemplateParams,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            silent: false,
            configured: true,
            params: TemplateParams::new(),
        }
    }
}

/// The three kernel-to-frontend channels of one generation.
#[derive(Debug, Default)]
struct ChannelSet {
    config: Option<Comm>,
    execute: Option<Comm>,
    safe_execute: Option<Comm>,
}

impl ChannelSet {
    fn get(&self, target: &str) -> Option<&Comm> {
        match target {
            CONFIG_TARGET => self.config.as_ref(),
            EXECUTE_TARGET => self.execute.as_ref(),
            SAFE_EXECUTE_TARGET => self.safe_execute.as_ref(),
            _ => None,
        }
    }

    fn all_present(&self) -> bool {
        self.config.is_some() && self.execute.is_some() && self.safe_execute.is_some()
    }

    fn all_absent(&self) -> bool {
        self.config.is_none() && self.execute.is_none() && self.safe_execute.is_none()
    }

    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.config.is_none() {
            missing.push(CONFIG_TARGET);
        }
        if self.execute.is_none() {
            missing.push(EXECUTE_TARGET);
        }
        if self.safe_execute.is_none() {
            missing.push(SAFE_EXECUTE_TARGET);
        }
        missing
    }

    fn clear(&mut self) {
        self.config = None;
        self.execute = None;
        self.safe_execute = None;
    }
}

/// Kernel-side requirement manager and script dispatcher.
pub struct RequireService {
    transport: Arc<dyn CommTransport>,
    session: String,
    store: RequireStore,
    channels: ChannelSet,
    state: InitState,
}

impl RequireService {
    /// Create an uninitialized service over `transport`. Call
    /// [`initialize`](Self::initialize) before dispatching.
    pub fn new(transport: Arc<dyn CommTransport>) -> Self {
        Self {
            transport,
            session: session_tag(),
            store: RequireStore::new(),
            channels: ChannelSet::default(),
            state: InitState::Uninitialized,
        }
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    /// Session tag embedded in this service's channel ids.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Copy of the declared library paths.
    pub fn libs(&self) -> IndexMap<String, String> {
        self.store.libs()
    }

    /// Copy of the declared shims.
    pub fn shims(&self) -> IndexMap<String, Vec<String>> {
        self.store.shims()
    }

    /// Generation id of a live channel, if present.
    pub fn channel_id(&self, target: &str) -> Option<String> {
        self.channels.get(target).map(|c| c.comm_id().to_string())
    }

    /// Bring up the three channels and prime the frontend.
    ///
    /// Idempotent: a second call while `Ready` is a no-op (no duplicate
    /// channels, no duplicate sends). On success the frontend has received
    /// one config message carrying the full current store, so both sides
    /// start from the same state.
    pub fn initialize(&mut self) -> Result<(), RequireError> {
        if self.state == InitState::Ready {
            debug!("[require] already initialized, skipping");
            return Ok(());
        }

        self.state = InitState::Initializing;

        let config = self.open_channel(CONFIG_TARGET)?;
        let execute = self.open_channel(EXECUTE_TARGET)?;
        let safe_execute = self.open_channel(SAFE_EXECUTE_TARGET)?;

        self.channels = ChannelSet {
            config: Some(config),
            execute: Some(execute),
            safe_execute: Some(safe_execute),
        };
        self.set_ready(true)?;

        info!("[require] channels ready (session {})", self.session);

        // Prime the frontend with the full current state so a deterministic
        // starting point exists even when the store is empty.
        self.config(IndexMap::new(), IndexMap::new())
    }

    /// Tear down the channel references and re-initialize.
    ///
    /// The frontend is not signalled: its side of the channels died with
    /// the page, and its own reload event drives its teardown. Kernel-side
    /// state is preserved unless `clear` is set.
    pub fn reload(&mut self, clear: bool) -> Result<(), RequireError> {
        info!("[require] reloading (clear={})", clear);

        self.channels.clear();
        self.set_ready(false)?;

        if clear {
            self.store.clear();
        }

        self.initialize()
    }

    /// Merge `paths` and `shim` into the store and send the entire merged
    /// state on the `config` channel.
    pub fn config(
        &mut self,
        paths: IndexMap<String, String>,
        shim: IndexMap<String, Vec<String>>,
    ) -> Result<(), RequireError> {
        self.store.merge(paths, shim);
        let payload = self.store.snapshot();
        debug!(
            "[require] sending config with {} path(s), {} shim(s)",
            payload.paths.len(),
            payload.shim.len()
        );
        self.send_on(CONFIG_TARGET, to_message(&payload))
    }

    /// Declare a single library path: `config` with one entry.
    pub fn declare(&mut self, library: &str, path: &str) -> Result<(), RequireError> {
        let mut paths = IndexMap::new();
        paths.insert(library.to_string(), path.to_string());
        self.config(paths, IndexMap::new())
    }

    /// Remove `key` from the declared requirements.
    ///
    /// The frontend is not notified; see `RequireStore::pop`.
    pub fn pop(&mut self, key: &str) -> Result<(), RequireError> {
        if self.store.pop(key) {
            Ok(())
        } else {
            Err(RequireError::UnknownLibrary(key.to_string()))
        }
    }

    /// Render `script` and dispatch it on the `execute` channel with the
    /// given library requirements.
    pub fn execute_with_requirements(
        &mut self,
        script: &str,
        required: &Requirements,
        opts: ExecuteOptions,
    ) -> Result<(), RequireError> {
        if !opts.configured {
            match required {
                Requirements::Paths(paths) => self.config(paths.clone(), IndexMap::new())?,
                Requirements::Keys(_) => return Err(RequireError::RequirementsNotMapping),
            }
        }

        let require = required.keys();
        let parameters = require.iter().map(|key| parameter_name(key)).collect();
        let rendered = JsTemplate::new(script).safe_substitute(&opts.params);

        let payload = ExecutePayload {
            script: rendered,
            silent: opts.silent,
            require,
            parameters,
        };
        self.send_on(EXECUTE_TARGET, to_message(&payload))
    }

    /// Dispatch `script` with the store's current keys as requirements.
    ///
    /// An empty store is tolerated: the script runs with no requirements.
    pub fn execute(&mut self, script: &str, opts: ExecuteOptions) -> Result<(), RequireError> {
        let required = Requirements::Keys(self.store.keys());
        self.execute_with_requirements(script, &required, opts)
    }

    /// Render `script`, wrap it in an isolating block scope, and dispatch
    /// it on the `safe_execute` channel.
    ///
    /// Safe executions carry no requirement gating and are meant to be
    /// idempotent: the frontend replays them at its next initialization.
    pub fn safe_execute(
        &mut self,
        script: &str,
        params: &TemplateParams,
    ) -> Result<(), RequireError> {
        let rendered = JsTemplate::new(script).safe_substitute(params);
        let payload = SafeExecutePayload {
            script: wrap_safe(&rendered),
        };
        self.send_on(SAFE_EXECUTE_TARGET, to_message(&payload))
    }

    fn open_channel(&self, target: &'static str) -> Result<Comm, RequireError> {
        let callback: MessageCallback = Arc::new(move |message| {
            debug!("[require] `{}` acknowledgement: {}", target, message);
        });
        Comm::open(self.transport.as_ref(), target, &self.session, callback)
            .map_err(|source| RequireError::Transport { target, source })
    }

    /// Flip the readiness flag, enforcing the all-or-nothing barrier:
    /// `Ready` requires every channel present, `Uninitialized` requires
    /// every channel absent. Anything in between is a hard error, so a
    /// send can never race a half-formed channel set.
    fn set_ready(&mut self, ready: bool) -> Result<(), RequireError> {
        if ready {
            if !self.channels.all_present() {
                return Err(RequireError::Configuration(format!(
                    "cannot mark ready with missing channels: {:?}",
                    self.channels.missing()
                )));
            }
            self.state = InitState::Ready;
        } else {
            if !self.channels.all_absent() {
                return Err(RequireError::Configuration(
                    "cannot mark uninitialized while channels are live".to_string(),
                ));
            }
            self.state = InitState::Uninitialized;
        }
        Ok(())
    }

    /// Send on a channel, failing fast when it is absent. No queuing, no
    /// retry: recovery from a dead frontend is the caller's `reload()`.
    fn send_on(&self, target: &'static str, payload: Value) -> Result<(), RequireError> {
        let comm = self
            .channels
            .get(target)
            .ok_or(RequireError::CommUnavailable { target })?;
        comm.send(payload)
            .map_err(|source| RequireError::Transport { target, source })
    }
}

impl std::fmt::Debug for RequireService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequireService")
            .field("session", &self.session)
            .field("state", &self.state)
            .field("libs", &self.store.keys())
            .finish()
    }
}

/// Serialize a channel payload. These shapes are plain string/bool/list
/// structures; serialization cannot fail for them.
fn to_message<T: serde::Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or_default()
}

/// Identifier the frontend binds a required library to: the last path
/// segment of the key, with characters disallowed in identifiers mapped
/// to underscores.
fn parameter_name(key: &str) -> String {
    let segment = key.rsplit('/').next().unwrap_or(key);
    segment
        .chars()
        .map(|c| match c {
            '-' | '.' | '\'' | '"' => '_',
            c => c,
        })
        .collect()
}

/// Wrap a rendered script in a strict-mode block scope so its bindings
/// cannot leak into the frontend's global scope across replays.
fn wrap_safe(script: &str) -> String {
    format!("'use strict';\n{{\n{}\n}}", script)
}
