#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The plugin descriptor contract output instances are built from.
//!
//! An [`AsyncOutputPlugin`] is the concrete behaviour behind one
//! `OutputInstance`: construction (`init`), an optional pre-run hook
//! (`pre_run`), the flush body itself, and teardown (`exit`). In the
//! original cooperative-stack design these were C function pointers
//! called through a thread-local parameter slot; here they are ordinary
//! async trait methods, and `flush`'s return value (a [`task::Disposition`])
//! *is* the return protocol — there is no separate signalling call to
//! make.

use std::collections::HashMap;

use async_trait::async_trait;
use context::Context;
use task::Disposition;

pub mod effect;

pub use effect::EffectHandler;

/// Per-instance configuration properties, accumulated by `set_property`
/// and handed to a plugin's `init` once the registry has validated and
/// schema-merged them. Mirrors `flb_output_set_property`'s string
/// property list; typed fields (`host`, `tls.*`, ...) are parsed out of
/// this map by the registry before `init` is called.
pub type Properties = HashMap<String, String>;

/// Errors raised by a plugin or its builder.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No builder is registered for this plugin type name.
    #[error("unknown output plugin (type: {plugin_type})")]
    UnknownPlugin {
        /// The plugin type name that was requested.
        plugin_type: String,
    },

    /// A property failed schema validation or could not be parsed.
    #[error("invalid configuration (reason: {message}, plugin: {plugin})")]
    InvalidConfig {
        /// The plugin instance's name.
        plugin: String,
        /// The validation failure message.
        message: String,
    },

    /// The plugin failed outside of the flush return protocol (e.g. in
    /// `init` or `exit`).
    #[error("output plugin error (plugin: {plugin}, reason: {error})")]
    Plugin {
        /// The plugin instance's name.
        plugin: String,
        /// The error message.
        error: String,
        /// Free-form context for diagnostics.
        context: HashMap<String, String>,
    },
}

/// Capability flags a plugin descriptor advertises, inherited by every
/// instance built from it (`flb_output_instance.flags` in the grounding
/// source).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The plugin dials a network connection; `tls.*` properties are
    /// only accepted when this is set.
    pub network: bool,
    /// At most one flush may be active for an instance of this plugin at
    /// a time (`FLB_OUTPUT_NO_MULTIPLEX`).
    pub no_multiplex: bool,
    /// The plugin is hosted out-of-process, behind a proxy boundary
    /// (`FLB_OUTPUT_PLUGIN_PROXY`).
    pub proxy_hosted: bool,
}

/// Debug/logging context threaded through every call into a plugin.
#[derive(Clone, Debug)]
pub struct DebugInfo {
    /// The plugin type name (e.g. `"stdout"`).
    pub plugin_type: String,
    /// The instance's generated or aliased name.
    pub instance_name: String,
    /// The id of the process the instance runs in.
    pub process_id: String,
    /// The id of the task currently being flushed, if any.
    pub task_id: Option<u16>,
}

impl DebugInfo {
    /// Creates debug info with no task in flight (used for `init`/`exit`).
    pub fn for_instance(plugin_type: String, instance_name: String, process_id: String) -> Self {
        Self {
            plugin_type,
            instance_name,
            process_id,
            task_id: None,
        }
    }

    /// Returns a copy scoped to a specific in-flight task.
    pub fn for_task(&self, task_id: u16) -> Self {
        Self {
            task_id: Some(task_id),
            ..self.clone()
        }
    }
}

/// The plugin descriptor contract: construction, optional pre-run setup,
/// the flush body, and teardown.
#[async_trait]
pub trait AsyncOutputPlugin: Send {
    /// Validates `properties` and prepares any private state. Called once
    /// per instance, before any flush is dispatched to it. `context` is
    /// the process-wide key/value bag supplied when the engine was
    /// constructed (ambient settings every instance's `init` can read,
    /// distinct from this instance's own `properties`). Failure disables
    /// the instance for the session.
    async fn init(&mut self, properties: &Properties, context: &Context, effect_handler: &EffectHandler) -> Result<(), Error> {
        let _ = properties;
        let _ = context;
        let _ = effect_handler;
        Ok(())
    }

    /// Runs once, after every instance in the engine has completed
    /// `init`. Optional.
    async fn pre_run(&mut self, effect_handler: &EffectHandler) -> Result<(), Error> {
        let _ = effect_handler;
        Ok(())
    }

    /// Flushes one task's payload. The returned [`Disposition`] is the
    /// entirety of the original return protocol (§4.4): there is no
    /// separate call to make, no thread-local frame handle to consult.
    async fn flush(&mut self, buf: &[u8], tag: &[u8], effect_handler: &EffectHandler) -> Disposition;

    /// Releases any private state. Called once, when the instance is
    /// torn down.
    async fn exit(&mut self, effect_handler: &EffectHandler) -> Result<(), Error> {
        let _ = effect_handler;
        Ok(())
    }
}

/// Builds instances of one plugin type.
pub trait OutputPluginBuilder {
    /// The plugin type name this builder constructs (e.g. `"stdout"`).
    fn r#type(&self) -> &str;
    /// Capabilities every instance built by this builder carries.
    fn capabilities(&self) -> Capabilities;
    /// Builds a fresh, uninitialized plugin instance.
    fn build(&self) -> Result<Box<dyn AsyncOutputPlugin + Send + Sync>, Error>;
}

/// A catalog of known plugin types, consulted by the registry at
/// instance-creation time.
pub trait OutputPluginFactory {
    /// Returns a builder for `plugin_type`, or `None` if unregistered.
    fn builder(&self, plugin_type: &str) -> Option<Box<dyn OutputPluginBuilder + Send + Sync>>;
}
