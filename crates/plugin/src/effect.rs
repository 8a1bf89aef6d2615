//! Handler a plugin uses to log and to report contextualized errors.

use std::collections::HashMap;

use crate::{DebugInfo, Error};

/// Handler passed into every `AsyncOutputPlugin` method, carrying the
/// debug context for that call and providing logging/error helpers.
#[derive(Clone)]
pub struct EffectHandler {
    debug_info: DebugInfo,
}

impl EffectHandler {
    /// Creates a new effect handler scoped to `debug_info`.
    pub fn new(debug_info: DebugInfo) -> Self {
        Self { debug_info }
    }

    /// Logs an info message.
    pub fn info(&self, msg: &str) {
        tracing::info!(debug_info = ?self.debug_info, "{}", msg);
    }

    /// Logs a warning message.
    pub fn warn(&self, msg: &str) {
        tracing::warn!(debug_info = ?self.debug_info, "{}", msg);
    }

    /// Logs an error message.
    pub fn error(&self, msg: &str) {
        tracing::error!(debug_info = ?self.debug_info, "{}", msg);
    }

    /// Builds a contextualized [`Error::Plugin`] for this instance.
    pub fn to_error(&self, err_msg: String, context: HashMap<String, String>) -> Error {
        Error::Plugin {
            plugin: self.debug_info.instance_name.clone(),
            error: err_msg,
            context,
        }
    }
}
