//! Demo output plugins: `stdout` prints each flushed record batch's
//! size, `null` discards it. Neither dials a connection — they exist so
//! the binary has something runnable out of the box; real transport
//! plugins stay external collaborators, per `spec.md` §1.

use async_trait::async_trait;
use plugin::{AsyncOutputPlugin, Capabilities, EffectHandler, Error, OutputPluginBuilder, OutputPluginFactory, Properties};
use task::Disposition;

struct StdoutPlugin;

#[async_trait]
impl AsyncOutputPlugin for StdoutPlugin {
    async fn flush(&mut self, buf: &[u8], tag: &[u8], effect_handler: &EffectHandler) -> Disposition {
        println!("[stdout] tag={:?} bytes={}", String::from_utf8_lossy(tag), buf.len());
        effect_handler.info("flush ok");
        Disposition::Ok
    }
}

struct StdoutBuilder;

impl OutputPluginBuilder for StdoutBuilder {
    fn r#type(&self) -> &str {
        "stdout"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn build(&self) -> Result<Box<dyn AsyncOutputPlugin + Send + Sync>, Error> {
        Ok(Box::new(StdoutPlugin))
    }
}

struct NullPlugin;

#[async_trait]
impl AsyncOutputPlugin for NullPlugin {
    async fn init(&mut self, _properties: &Properties, _context: &context::Context, effect_handler: &EffectHandler) -> Result<(), Error> {
        effect_handler.info("null output initialized");
        Ok(())
    }

    async fn flush(&mut self, _buf: &[u8], _tag: &[u8], _effect_handler: &EffectHandler) -> Disposition {
        Disposition::Ok
    }
}

struct NullBuilder;

impl OutputPluginBuilder for NullBuilder {
    fn r#type(&self) -> &str {
        "null"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn build(&self) -> Result<Box<dyn AsyncOutputPlugin + Send + Sync>, Error> {
        Ok(Box::new(NullPlugin))
    }
}

/// The factory registered by the `outflux` binary: `stdout` and `null`.
#[derive(Default)]
pub struct DemoFactory;

impl OutputPluginFactory for DemoFactory {
    fn builder(&self, plugin_type: &str) -> Option<Box<dyn OutputPluginBuilder + Send + Sync>> {
        match plugin_type {
            "stdout" => Some(Box::new(StdoutBuilder)),
            "null" => Some(Box::new(NullBuilder)),
            _ => None,
        }
    }
}
