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

//! Output instance registry (C3) and per-instance metrics (C6).
//!
//! `Registry` owns every configured [`OutputInstance`]: it allocates ids
//! and mask bits, validates properties as they accumulate, drives each
//! instance's `init` during [`Registry::check`], and unlinks an instance
//! on [`Registry::destroy`]. It is engine-thread-only state; nothing here
//! is `Sync`-required by accident.

pub mod mask;

use std::collections::HashMap;
use std::sync::Arc;

use context::Context;
use plugin::{AsyncOutputPlugin, Capabilities, DebugInfo, EffectHandler, OutputPluginFactory, Properties};
use tokio::sync::Mutex;
use tracing::{info, warn};

use mask::MaskAllocator;

/// Errors raised by the registry.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// No plugin builder is registered for the requested type.
    #[error("unknown output plugin type: {0}")]
    UnknownPlugin(String),
    /// All 64 mask bits are already reserved.
    #[error("mask bitmap exhausted (64 live instances already)")]
    MaskExhausted,
    /// No instance with this id is registered.
    #[error("unknown instance id: {0}")]
    UnknownInstance(u32),
    /// Both `match` and `match_regex` were set on the same instance.
    #[error("instance {0}: match and match_regex are mutually exclusive")]
    ExclusiveMatch(u32),
    /// A `tls.*` property was set on an instance whose plugin does not
    /// advertise the network capability.
    #[error("instance {0}: tls properties require a network-capable plugin")]
    TlsRequiresNetwork(u32),
    /// A numeric `net.*` property failed to parse.
    #[error("instance {0}: invalid numeric value for {1}: {2}")]
    InvalidNetOption(u32, String, String),
    /// `storage.total_limit_size` failed to parse.
    #[error("instance {0}: invalid storage.total_limit_size value: {1}")]
    InvalidStorageLimit(u32, String),
}

/// Routing rule: at most one of a literal glob or a compiled regex may be
/// active (`spec.md` §9: "prefer a tagged variant over two nullable
/// fields").
#[derive(Debug, Clone)]
pub enum MatchRule {
    /// Matches every tag (the default: no `match` property set).
    Any,
    /// A literal glob pattern (`*`, `?` wildcards only — no full glob
    /// library is warranted for this subset).
    Glob(String),
    /// A compiled regular expression.
    Regex(Box<regex::Regex>),
}

impl MatchRule {
    /// True if `tag` (decoded as UTF-8 lossily) matches this rule.
    pub fn matches(&self, tag: &[u8]) -> bool {
        let tag = String::from_utf8_lossy(tag);
        match self {
            MatchRule::Any => true,
            MatchRule::Glob(pattern) => glob_match(pattern, &tag),
            MatchRule::Regex(re) => re.is_match(&tag),
        }
    }
}

/// Minimal `*`/`?` glob matcher, sufficient for the `match` property
/// (full regex needs go through `match_regex` instead).
fn glob_match(pattern: &str, text: &str) -> bool {
    fn helper(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => helper(&p[1..], t) || (!t.is_empty() && helper(p, &t[1..])),
            Some(b'?') => !t.is_empty() && helper(&p[1..], &t[1..]),
            Some(&c) => t.first() == Some(&c) && helper(&p[1..], &t[1..]),
        }
    }
    helper(pattern.as_bytes(), text.as_bytes())
}

/// Network/TLS options, unchanged by this core beyond storage and
/// validation (`flb_output_instance`'s network/TLS fields).
#[derive(Debug, Clone, Default)]
pub struct NetworkOptions {
    /// Destination host, parsed from the URL-form destination syntax or
    /// the `host` property.
    pub host: Option<String>,
    /// Destination port.
    pub port: Option<u16>,
    /// Path fragment of a URL-form destination.
    pub uri: Option<String>,
    /// TLS is enabled for this instance's connections.
    pub use_tls: bool,
    /// Verify the peer certificate.
    pub tls_verify: bool,
    /// SNI virtual host override.
    pub tls_vhost: Option<String>,
    /// CA bundle directory.
    pub tls_ca_path: Option<String>,
    /// CA certificate file.
    pub tls_ca_file: Option<String>,
    /// Client certificate file.
    pub tls_crt_file: Option<String>,
    /// Client key file.
    pub tls_key_file: Option<String>,
    /// Client key passphrase.
    pub tls_key_passwd: Option<String>,
    /// Enable TCP keepalive.
    pub keepalive: Option<bool>,
    /// Keepalive idle timeout, in seconds.
    pub keepalive_idle_timeout: Option<u32>,
    /// Connect timeout, in seconds.
    pub connect_timeout: Option<u32>,
}

/// Per-instance counters (C6).
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    /// Records successfully flushed.
    pub out_ok_records: u64,
    /// Bytes successfully flushed.
    pub out_ok_bytes: u64,
    /// Flush attempts that returned `ERROR`.
    pub out_errors: u64,
    /// Retries observed by the scheduler for this instance.
    pub retries: u64,
}

/// One configured occurrence of an output plugin.
pub struct OutputInstance {
    /// Id unique among live instances.
    pub id: u32,
    /// Generated (`<plugin>.<n>`) or aliased name.
    pub name: String,
    /// The plugin type name this instance was built from.
    pub plugin_type: String,
    /// Single reserved bit in the process mask bitmap.
    pub mask_id: u64,
    /// Per-instance log level override.
    pub log_level: Option<tracing::Level>,
    /// Routing rule applied to incoming tags.
    pub route: MatchRule,
    /// Network/TLS options.
    pub network: NetworkOptions,
    /// Capabilities inherited from the plugin descriptor.
    pub capabilities: Capabilities,
    /// Maximum retry attempts; `None` means unlimited.
    pub retry_limit: Option<u32>,
    /// Worker-pool size; `0` means flushes run on the engine thread.
    pub workers: u32,
    /// Current filesystem buffer usage charged to this instance.
    pub fs_chunks_size: u64,
    /// Configured ceiling for `fs_chunks_size`; `None` means unbounded.
    pub total_limit_size: Option<u64>,
    /// Short-circuits network I/O for test harnesses.
    pub test_mode: bool,
    /// Becomes `false` if `init` fails; disabled instances are never
    /// dispatched to.
    pub usable: bool,
    /// `(task_id, frame_id)` pairs of this instance's currently active
    /// flush contexts. Frame ids are only unique within their own task,
    /// so both halves are needed to identify a context unambiguously.
    pub active_contexts: Vec<(u16, u16)>,
    /// Accumulated metrics.
    pub metrics: Metrics,
    /// Accumulated raw properties, passed verbatim to the plugin's
    /// `init`.
    properties: Properties,
    /// The plugin instance itself; doubles as the opaque "context"
    /// `init` would have produced in the original design. Shared and
    /// `Mutex`-guarded so a flush can be moved onto a worker task (C4)
    /// without the instance borrowing the registry for the duration.
    pub plugin: Arc<Mutex<Box<dyn AsyncOutputPlugin + Send + Sync>>>,
}

impl OutputInstance {
    /// Builds the [`DebugInfo`] for calls into this instance's plugin.
    pub fn debug_info(&self, process_id: &str) -> DebugInfo {
        DebugInfo::for_instance(self.plugin_type.clone(), self.name.clone(), process_id.to_string())
    }
}

/// The output instance registry (C3).
#[derive(Default)]
pub struct Registry {
    next_id: u32,
    mask_allocator: MaskAllocator,
    instances: Vec<OutputInstance>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a new instance from a plugin type, assigning a fresh id
    /// and mask bit, and links it into the registry.
    pub fn new_instance(&mut self, factory: &dyn OutputPluginFactory, plugin_type: &str) -> Result<u32, Error> {
        let builder = factory
            .builder(plugin_type)
            .ok_or_else(|| Error::UnknownPlugin(plugin_type.to_string()))?;
        let mask_id = self.mask_allocator.allocate().map_err(|_| Error::MaskExhausted)?;
        let id = self.next_id;
        self.next_id += 1;
        let name = format!("{plugin_type}.{id}");
        let plugin = builder.build().map_err(|_| Error::UnknownPlugin(plugin_type.to_string()))?;

        self.instances.push(OutputInstance {
            id,
            name,
            plugin_type: plugin_type.to_string(),
            mask_id,
            log_level: None,
            route: MatchRule::Any,
            network: NetworkOptions::default(),
            capabilities: builder.capabilities(),
            retry_limit: None,
            workers: 0,
            fs_chunks_size: 0,
            total_limit_size: None,
            test_mode: false,
            usable: true,
            active_contexts: Vec::new(),
            metrics: Metrics::default(),
            properties: HashMap::new(),
            plugin: Arc::new(Mutex::new(plugin)),
        });
        info!(instance_id = id, plugin_type, "output instance created");
        Ok(id)
    }

    /// Mutable access to a registered instance, for the dispatcher to
    /// update `active_contexts`/metrics. Returns `None` if `id` is not
    /// (or no longer) registered.
    pub fn instance_mut(&mut self, id: u32) -> Option<&mut OutputInstance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    /// Returns the instance with this id, if registered.
    pub fn instance(&self, id: u32) -> Option<&OutputInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    /// All currently registered instances.
    pub fn instances(&self) -> &[OutputInstance] {
        &self.instances
    }

    /// Accumulates one `key = value` property on an instance, validating
    /// it immediately where the rule does not depend on other instances
    /// having been created yet.
    pub fn set_property(&mut self, id: u32, key: &str, value: &str) -> Result<(), Error> {
        let instance = self.instance_mut(id).ok_or(Error::UnknownInstance(id))?;

        match key {
            "match" => {
                if matches!(instance.route, MatchRule::Regex(_)) {
                    return Err(Error::ExclusiveMatch(id));
                }
                instance.route = MatchRule::Glob(value.to_string());
            }
            "match_regex" => {
                if matches!(instance.route, MatchRule::Glob(_)) {
                    return Err(Error::ExclusiveMatch(id));
                }
                let re = regex::Regex::new(value).map_err(|_| Error::InvalidNetOption(id, key.into(), value.into()))?;
                instance.route = MatchRule::Regex(Box::new(re));
            }
            "alias" => instance.name = value.to_string(),
            "log_level" => {
                instance.log_level = value.parse().ok();
            }
            "retry_limit" => {
                instance.retry_limit =
                    Some(value.parse().map_err(|_| Error::InvalidNetOption(id, key.into(), value.into()))?);
            }
            "workers" => {
                instance.workers = value.parse().map_err(|_| Error::InvalidNetOption(id, key.into(), value.into()))?;
            }
            "storage.total_limit_size" => {
                instance.total_limit_size =
                    Some(value.parse().map_err(|_| Error::InvalidStorageLimit(id, value.into()))?);
            }
            _ if key.starts_with("net.") => {
                set_net_property(instance, id, key, value)?;
            }
            _ if key.starts_with("tls.") => {
                if !instance.capabilities.network {
                    return Err(Error::TlsRequiresNetwork(id));
                }
                set_tls_property(instance, key, value);
            }
            _ => {
                warn!(instance_id = id, key, "unrecognised configuration key");
            }
        }

        let _ = instance.properties.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Invokes every registered instance's `init` with its accumulated
    /// properties and the process-wide `context`. Returns the number of
    /// instances that failed and were marked unusable.
    pub async fn check(&mut self, process_id: &str, context: &Context) -> usize {
        let mut failures = 0;
        for instance in &mut self.instances {
            let debug_info = instance.debug_info(process_id);
            let effect_handler = EffectHandler::new(debug_info);
            if let Err(err) = instance.plugin.lock().await.init(&instance.properties, context, &effect_handler).await {
                warn!(instance_id = instance.id, error = %err, "instance init failed, disabling");
                instance.usable = false;
                failures += 1;
            }
        }
        failures
    }

    /// Tears an instance down: calls `exit`, unlinks it from the
    /// registry, and returns the `(task_id, frame_id)` pairs of any
    /// flush contexts that were still active so the dispatcher can
    /// cancel them.
    pub async fn destroy(&mut self, id: u32, process_id: &str) -> Result<Vec<(u16, u16)>, Error> {
        let pos = self.instances.iter().position(|i| i.id == id).ok_or(Error::UnknownInstance(id))?;
        let mut instance = self.instances.remove(pos);
        let debug_info = instance.debug_info(process_id);
        let effect_handler = EffectHandler::new(debug_info);
        if let Err(err) = instance.plugin.lock().await.exit(&effect_handler).await {
            warn!(instance_id = id, error = %err, "instance exit failed");
        }
        self.mask_allocator.release(instance.mask_id);
        Ok(std::mem::take(&mut instance.active_contexts))
    }

    /// Instance ids whose `route` matches `tag` and which are usable.
    pub fn matching(&self, tag: &[u8]) -> Vec<u32> {
        self.instances
            .iter()
            .filter(|i| i.usable && i.route.matches(tag))
            .map(|i| i.id)
            .collect()
    }
}

fn set_net_property(instance: &mut OutputInstance, id: u32, key: &str, value: &str) -> Result<(), Error> {
    let sub_key = &key["net.".len()..];
    match sub_key {
        "keepalive" => {
            instance.network.keepalive =
                Some(value.parse().map_err(|_| Error::InvalidNetOption(id, key.into(), value.into()))?);
        }
        "keepalive_idle_timeout" => {
            instance.network.keepalive_idle_timeout =
                Some(value.parse().map_err(|_| Error::InvalidNetOption(id, key.into(), value.into()))?);
        }
        "connect_timeout" => {
            instance.network.connect_timeout =
                Some(value.parse().map_err(|_| Error::InvalidNetOption(id, key.into(), value.into()))?);
        }
        _ => warn!(instance_id = id, key, "unrecognised net.* configuration key"),
    }
    Ok(())
}

fn set_tls_property(instance: &mut OutputInstance, key: &str, value: &str) {
    let sub_key = &key["tls.".len()..];
    match sub_key {
        "verify" => instance.network.tls_verify = value.parse().unwrap_or(true),
        "vhost" => instance.network.tls_vhost = Some(value.to_string()),
        "ca_path" => instance.network.tls_ca_path = Some(value.to_string()),
        "ca_file" => instance.network.tls_ca_file = Some(value.to_string()),
        "crt_file" => instance.network.tls_crt_file = Some(value.to_string()),
        "key_file" => instance.network.tls_key_file = Some(value.to_string()),
        "key_passwd" => instance.network.tls_key_passwd = Some(value.to_string()),
        _ => {
            instance.network.use_tls = true;
        }
    }
    instance.network.use_tls = true;
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use plugin::{Capabilities, EffectHandler, Error as PluginError, OutputPluginBuilder, Properties};
    use task::Disposition;

    #[derive(Default)]
    struct NoopPlugin;

    #[async_trait]
    impl AsyncOutputPlugin for NoopPlugin {
        async fn flush(&mut self, _buf: &[u8], _tag: &[u8], _effect_handler: &EffectHandler) -> Disposition {
            Disposition::Ok
        }
    }

    struct NoopBuilder {
        capabilities: Capabilities,
    }

    impl OutputPluginBuilder for NoopBuilder {
        fn r#type(&self) -> &str {
            "noop"
        }

        fn capabilities(&self) -> Capabilities {
            self.capabilities
        }

        fn build(&self) -> Result<Box<dyn AsyncOutputPlugin + Send + Sync>, PluginError> {
            Ok(Box::new(NoopPlugin))
        }
    }

    struct NoopFactory {
        capabilities: Capabilities,
    }

    impl OutputPluginFactory for NoopFactory {
        fn builder(&self, plugin_type: &str) -> Option<Box<dyn OutputPluginBuilder + Send + Sync>> {
            (plugin_type == "noop").then(|| {
                Box::new(NoopBuilder {
                    capabilities: self.capabilities,
                }) as Box<dyn OutputPluginBuilder + Send + Sync>
            })
        }
    }

    fn factory(network: bool) -> NoopFactory {
        NoopFactory {
            capabilities: Capabilities {
                network,
                no_multiplex: false,
                proxy_hosted: false,
            },
        }
    }

    #[test]
    fn mask_ids_are_unique_across_instances() {
        let factory = factory(false);
        let mut registry = Registry::new();
        let a = registry.new_instance(&factory, "noop").unwrap();
        let b = registry.new_instance(&factory, "noop").unwrap();
        let mask_a = registry.instance(a).unwrap().mask_id;
        let mask_b = registry.instance(b).unwrap().mask_id;
        assert_ne!(mask_a, mask_b);
    }

    #[test]
    fn match_and_match_regex_are_exclusive() {
        let factory = factory(false);
        let mut registry = Registry::new();
        let id = registry.new_instance(&factory, "noop").unwrap();
        registry.set_property(id, "match", "foo.*").unwrap();
        assert_eq!(registry.set_property(id, "match_regex", "^foo"), Err(Error::ExclusiveMatch(id)));
    }

    #[test]
    fn tls_property_requires_network_capability() {
        let factory = factory(false);
        let mut registry = Registry::new();
        let id = registry.new_instance(&factory, "noop").unwrap();
        assert_eq!(
            registry.set_property(id, "tls.verify", "true"),
            Err(Error::TlsRequiresNetwork(id))
        );
    }

    #[test]
    fn tls_property_accepted_for_network_capable_plugin() {
        let factory = factory(true);
        let mut registry = Registry::new();
        let id = registry.new_instance(&factory, "noop").unwrap();
        registry.set_property(id, "tls.verify", "true").unwrap();
        assert!(registry.instance(id).unwrap().network.use_tls);
    }

    #[tokio::test]
    async fn check_runs_init_and_destroy_runs_exit() {
        let factory = factory(false);
        let mut registry = Registry::new();
        let id = registry.new_instance(&factory, "noop").unwrap();
        let failures = registry.check("agent-1", &Context::new()).await;
        assert_eq!(failures, 0);
        assert!(registry.instance(id).unwrap().usable);
        let active = registry.destroy(id, "agent-1").await.unwrap();
        assert!(active.is_empty());
        assert!(registry.instance(id).is_none());
    }
}
