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

//! YAML configuration loading for the output registry (C3's external
//! surface).
//!
//! Configuration is parsed in the same two-pass shape the teacher crate
//! uses for its pipelines: an untyped, schema-validated pass
//! ([`OutputConfig`], via `serde_yaml` + `validator`), then a resolution
//! pass ([`load_into`]) that looks each destination's plugin type up in
//! a [`plugin::OutputPluginFactory`] and drives [`registry::Registry`].

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use plugin::OutputPluginFactory;
use registry::Registry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use validator::Validate;

/// Errors for the config module.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read or did not parse as YAML.
    #[error("invalid configuration file `{file}` - {message}")]
    InvalidConfig {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },

    /// An output's configuration failed schema validation.
    #[error("output `{destination}` failed validation: {message}")]
    InvalidOutput {
        /// The destination string (short-form or URL-form).
        destination: String,
        /// The validation failure message.
        message: String,
    },

    /// An output instance could not be constructed from its plugin type.
    #[error("output `{destination}` could not be created: {source}")]
    InstanceNotCreated {
        /// The destination string (short-form or URL-form).
        destination: String,
        /// The underlying registry error.
        #[source]
        source: registry::Error,
    },

    /// One of an output's properties was rejected by the registry.
    #[error("output `{destination}` rejected property `{key}`: {source}")]
    PropertyRejected {
        /// The destination string (short-form or URL-form).
        destination: String,
        /// The rejected property key.
        key: String,
        /// The underlying registry error.
        #[source]
        source: registry::Error,
    },
}

/// Top-level shape of the configuration file: a flat list of output
/// destinations. A list rather than a map keyed by name, since the same
/// plugin type may be configured more than once and the registry — not
/// this file — owns name generation (`<plugin>.<n>`).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct RawConfig {
    #[serde(default)]
    outputs: Vec<OutputConfig>,
}

/// One configured output destination, in the short-form/URL-form
/// destination syntax: `plugin_name` or `plugin_name://host:port/path`.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct OutputConfig {
    /// The short-form or URL-form destination string.
    pub destination: String,

    /// Worker-pool size; validated here since it bounds a real resource.
    #[validate(range(min = 0, max = 256))]
    #[serde(default)]
    pub workers: Option<u32>,

    /// Maximum retry attempts before giving up on this destination.
    #[validate(range(min = 0, max = 1_000_000))]
    #[serde(default)]
    pub retry_limit: Option<u32>,

    /// Every other recognised property (`match`, `match_regex`, `alias`,
    /// `log_level`, `storage.total_limit_size`, `net.*`, `tls.*`),
    /// passed straight through to [`registry::Registry::set_property`],
    /// which owns their parsing and validation.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// The parsed destination string, split into its plugin type and
/// optional network parts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Destination {
    plugin_type: String,
    host: Option<String>,
    port: Option<u16>,
    uri: Option<String>,
}

/// Parses the short-form/URL-form destination syntax: `plugin_name` or
/// `plugin_name://host:port/path`.
fn parse_destination(raw: &str) -> Destination {
    let Some((plugin_type, rest)) = raw.split_once("://") else {
        return Destination {
            plugin_type: raw.to_string(),
            host: None,
            port: None,
            uri: None,
        };
    };

    let (host_port, uri) = match rest.split_once('/') {
        Some((host_port, path)) => (host_port, Some(format!("/{path}"))),
        None => (rest, None),
    };
    let (host, port) = match host_port.split_once(':') {
        Some((host, port)) => ((!host.is_empty()).then(|| host.to_string()), port.parse::<u16>().ok()),
        None => ((!host_port.is_empty()).then(|| host_port.to_string()), None),
    };

    Destination {
        plugin_type: plugin_type.to_string(),
        host,
        port,
        uri,
    }
}

/// Reads and parses `config_file_path` as YAML, without resolving it
/// against a plugin factory.
fn parse(config_file_path: impl AsRef<Path>) -> Result<RawConfig, Error> {
    let file_name = config_file_path.as_ref().display().to_string();
    let file = File::open(&config_file_path).map_err(|err| Error::InvalidConfig {
        file: file_name.clone(),
        message: err.to_string(),
    })?;
    let reader = BufReader::new(file);
    serde_yaml::from_reader(reader).map_err(|err| Error::InvalidConfig {
        file: file_name,
        message: err.to_string(),
    })
}

/// Loads `config_file_path` and resolves every output into `registry`,
/// looking plugin types up in `factory`. Returns the number of outputs
/// loaded.
///
/// Resolution stops at the first error; outputs already created remain
/// in `registry` — the caller decides whether a partially loaded
/// registry is acceptable (startup errors are expected to abort the
/// process regardless, per the configuration error policy).
pub fn load_into(
    config_file_path: impl AsRef<Path>,
    registry: &mut Registry,
    factory: &dyn OutputPluginFactory,
) -> Result<usize, Error> {
    let file_name = config_file_path.as_ref().display().to_string();
    debug!(file = %file_name, "loading configuration");
    let raw = parse(config_file_path)?;

    for output in &raw.outputs {
        output.validate().map_err(|err| Error::InvalidOutput {
            destination: output.destination.clone(),
            message: err.to_string(),
        })?;

        let destination = parse_destination(&output.destination);
        let id = registry
            .new_instance(factory, &destination.plugin_type)
            .map_err(|source| Error::InstanceNotCreated {
                destination: output.destination.clone(),
                source,
            })?;

        if let Some(instance) = registry.instance_mut(id) {
            instance.network.host = destination.host;
            instance.network.port = destination.port;
            instance.network.uri = destination.uri;
        }

        if let Some(workers) = output.workers {
            registry
                .set_property(id, "workers", &workers.to_string())
                .map_err(|source| Error::PropertyRejected {
                    destination: output.destination.clone(),
                    key: "workers".to_string(),
                    source,
                })?;
        }
        if let Some(retry_limit) = output.retry_limit {
            registry
                .set_property(id, "retry_limit", &retry_limit.to_string())
                .map_err(|source| Error::PropertyRejected {
                    destination: output.destination.clone(),
                    key: "retry_limit".to_string(),
                    source,
                })?;
        }
        for (key, value) in &output.properties {
            registry
                .set_property(id, key, value)
                .map_err(|source| Error::PropertyRejected {
                    destination: output.destination.clone(),
                    key: key.clone(),
                    source,
                })?;
        }
    }

    debug!(file = %file_name, outputs = raw.outputs.len(), "configuration loaded");
    Ok(raw.outputs.len())
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use plugin::{AsyncOutputPlugin, Capabilities, EffectHandler, Error as PluginError, OutputPluginBuilder};
    use task::Disposition;

    struct NoopPlugin;

    #[async_trait]
    impl AsyncOutputPlugin for NoopPlugin {
        async fn flush(&mut self, _buf: &[u8], _tag: &[u8], _effect_handler: &EffectHandler) -> Disposition {
            Disposition::Ok
        }
    }

    struct NoopBuilder;

    impl OutputPluginBuilder for NoopBuilder {
        fn r#type(&self) -> &str {
            "stdout"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        fn build(&self) -> Result<Box<dyn AsyncOutputPlugin + Send + Sync>, PluginError> {
            Ok(Box::new(NoopPlugin))
        }
    }

    struct NetworkBuilder;

    impl OutputPluginBuilder for NetworkBuilder {
        fn r#type(&self) -> &str {
            "forward"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                network: true,
                no_multiplex: false,
                proxy_hosted: false,
            }
        }

        fn build(&self) -> Result<Box<dyn AsyncOutputPlugin + Send + Sync>, PluginError> {
            Ok(Box::new(NoopPlugin))
        }
    }

    struct TestFactory;

    impl OutputPluginFactory for TestFactory {
        fn builder(&self, plugin_type: &str) -> Option<Box<dyn OutputPluginBuilder + Send + Sync>> {
            match plugin_type {
                "stdout" => Some(Box::new(NoopBuilder)),
                "forward" => Some(Box::new(NetworkBuilder)),
                _ => None,
            }
        }
    }

    #[test]
    fn parses_short_form_destination() {
        let dest = parse_destination("stdout");
        assert_eq!(dest.plugin_type, "stdout");
        assert_eq!(dest.host, None);
        assert_eq!(dest.port, None);
        assert_eq!(dest.uri, None);
    }

    #[test]
    fn parses_url_form_destination() {
        let dest = parse_destination("forward://collector.example.com:24224/ingest");
        assert_eq!(dest.plugin_type, "forward");
        assert_eq!(dest.host, Some("collector.example.com".to_string()));
        assert_eq!(dest.port, Some(24224));
        assert_eq!(dest.uri, Some("/ingest".to_string()));
    }

    #[test]
    fn parses_url_form_destination_without_path() {
        let dest = parse_destination("forward://collector.example.com:24224");
        assert_eq!(dest.host, Some("collector.example.com".to_string()));
        assert_eq!(dest.port, Some(24224));
        assert_eq!(dest.uri, None);
    }

    #[test]
    fn load_into_resolves_outputs_and_network_fields() {
        let dir = std::env::temp_dir().join(format!("outflux-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("config.yaml");
        std::fs::write(
            &config_path,
            r#"
outputs:
  - destination: stdout
    properties:
      match: "*"
  - destination: "forward://collector.example.com:24224/ingest"
    workers: 2
    properties:
      tls.verify: "true"
"#,
        )
        .unwrap();

        let mut registry = Registry::new();
        let factory = TestFactory;
        let count = load_into(&config_path, &mut registry, &factory).unwrap();
        assert_eq!(count, 2);
        assert_eq!(registry.instances().len(), 2);

        let forward = registry
            .instances()
            .iter()
            .find(|i| i.plugin_type == "forward")
            .unwrap();
        assert_eq!(forward.network.host.as_deref(), Some("collector.example.com"));
        assert_eq!(forward.network.port, Some(24224));
        assert_eq!(forward.network.uri.as_deref(), Some("/ingest"));
        assert_eq!(forward.workers, 2);
        assert!(forward.network.use_tls);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_into_rejects_unknown_plugin_type() {
        let dir = std::env::temp_dir().join(format!("outflux-config-test-unknown-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("config.yaml");
        std::fs::write(&config_path, "outputs:\n  - destination: nonexistent\n").unwrap();

        let mut registry = Registry::new();
        let factory = TestFactory;
        let err = load_into(&config_path, &mut registry, &factory).unwrap_err();
        assert!(matches!(err, Error::InstanceNotCreated { .. }));

        std::fs::remove_dir_all(&dir).ok();
    }
}
