//! End-to-end dispatcher scenarios wiring `registry`, `dispatch`, and
//! `task` together, the way a real engine tick would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use context::Context;
use dispatch::{Dispatcher, TaskOutcome};
use plugin::{AsyncOutputPlugin, Capabilities, EffectHandler, Error as PluginError, OutputPluginBuilder, OutputPluginFactory};
use registry::Registry;
use task::{Disposition, Task};

struct ScriptedPlugin {
    reply: Disposition,
    flushes: Arc<AtomicUsize>,
}

#[async_trait]
impl AsyncOutputPlugin for ScriptedPlugin {
    async fn flush(&mut self, _buf: &[u8], _tag: &[u8], _effect_handler: &EffectHandler) -> Disposition {
        let _ = self.flushes.fetch_add(1, Ordering::SeqCst);
        self.reply
    }
}

struct ScriptedBuilder {
    plugin_type: String,
    reply: Disposition,
    no_multiplex: bool,
    flushes: Arc<AtomicUsize>,
}

impl OutputPluginBuilder for ScriptedBuilder {
    fn r#type(&self) -> &str {
        &self.plugin_type
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            network: false,
            no_multiplex: self.no_multiplex,
            proxy_hosted: false,
        }
    }

    fn build(&self) -> Result<Box<dyn AsyncOutputPlugin + Send + Sync>, PluginError> {
        Ok(Box::new(ScriptedPlugin {
            reply: self.reply,
            flushes: self.flushes.clone(),
        }))
    }
}

struct ScriptedFactory {
    builders: Vec<(String, Disposition, bool, Arc<AtomicUsize>)>,
}

impl OutputPluginFactory for ScriptedFactory {
    fn builder(&self, plugin_type: &str) -> Option<Box<dyn OutputPluginBuilder + Send + Sync>> {
        self.builders.iter().find(|(name, ..)| name == plugin_type).map(|(name, reply, no_multiplex, flushes)| {
            Box::new(ScriptedBuilder {
                plugin_type: name.clone(),
                reply: *reply,
                no_multiplex: *no_multiplex,
                flushes: flushes.clone(),
            }) as Box<dyn OutputPluginBuilder + Send + Sync>
        })
    }
}

async fn settle(dispatcher: &mut Dispatcher) -> Vec<(u16, TaskOutcome)> {
    let mut seen = Vec::new();
    for _ in 0..200 {
        let outcomes = dispatcher.poll_completions();
        if !outcomes.is_empty() {
            seen.extend(outcomes);
        }
        if !seen.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    seen
}

#[tokio::test]
async fn single_instance_ok_updates_metrics_and_retires_task() {
    let flushes = Arc::new(AtomicUsize::new(0));
    let factory = ScriptedFactory {
        builders: vec![("ok".to_string(), Disposition::Ok, false, flushes.clone())],
    };
    let mut registry = Registry::new();
    let id = registry.new_instance(&factory, "ok").unwrap();
    let mask = registry.instance(id).unwrap().mask_id;
    assert_eq!(registry.check("agent-test", &Context::new()).await, 0);

    let mut dispatcher = Dispatcher::new(registry, "agent-test".to_string());
    dispatcher.dispatch(Task::new(1, b"payload".to_vec(), b"tag".to_vec(), 3, vec![mask]));

    let outcomes = settle(&mut dispatcher).await;
    assert_eq!(outcomes, vec![(1, TaskOutcome::Retired)]);
    assert_eq!(flushes.load(Ordering::SeqCst), 1);

    let instance = dispatcher.registry().instance(id).unwrap();
    assert_eq!(instance.metrics.out_ok_records, 3);
    assert_eq!(instance.metrics.out_ok_bytes, 7);
    assert!(instance.active_contexts.is_empty());
}

#[tokio::test]
async fn task_retires_only_after_both_matching_instances_complete() {
    let flushes_a = Arc::new(AtomicUsize::new(0));
    let flushes_b = Arc::new(AtomicUsize::new(0));
    let factory = ScriptedFactory {
        builders: vec![
            ("a".to_string(), Disposition::Ok, false, flushes_a.clone()),
            ("b".to_string(), Disposition::Ok, false, flushes_b.clone()),
        ],
    };
    let mut registry = Registry::new();
    let id_a = registry.new_instance(&factory, "a").unwrap();
    let id_b = registry.new_instance(&factory, "b").unwrap();
    let mask_a = registry.instance(id_a).unwrap().mask_id;
    let mask_b = registry.instance(id_b).unwrap().mask_id;

    let mut dispatcher = Dispatcher::new(registry, "agent-test".to_string());
    dispatcher.dispatch(Task::new(1, b"payload".to_vec(), b"tag".to_vec(), 1, vec![mask_a, mask_b]));

    let mut retired = false;
    for _ in 0..200 {
        let outcomes = dispatcher.poll_completions();
        if outcomes.iter().any(|(id, outcome)| *id == 1 && *outcome == TaskOutcome::Retired) {
            retired = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    assert!(retired);
    assert_eq!(flushes_a.load(Ordering::SeqCst), 1);
    assert_eq!(flushes_b.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn no_multiplex_instance_defers_a_second_task_until_the_first_completes() {
    let flushes = Arc::new(AtomicUsize::new(0));
    let factory = ScriptedFactory {
        builders: vec![("solo".to_string(), Disposition::Ok, true, flushes.clone())],
    };
    let mut registry = Registry::new();
    let id = registry.new_instance(&factory, "solo").unwrap();
    let mask = registry.instance(id).unwrap().mask_id;

    let mut dispatcher = Dispatcher::new(registry, "agent-test".to_string());
    dispatcher.dispatch(Task::new(1, b"first".to_vec(), b"tag".to_vec(), 1, vec![mask]));
    dispatcher.dispatch(Task::new(2, b"second".to_vec(), b"tag".to_vec(), 1, vec![mask]));

    // Only the first task's flush should be in flight; the second is
    // deferred until the first instance completes.
    assert_eq!(dispatcher.active_task_count(), 2);

    let first = settle(&mut dispatcher).await;
    assert_eq!(first, vec![(1, TaskOutcome::Retired)]);

    let second = settle(&mut dispatcher).await;
    assert_eq!(second, vec![(2, TaskOutcome::Retired)]);
    assert_eq!(flushes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retry_disposition_leaves_task_pending_and_increments_retry_metric() {
    let flushes = Arc::new(AtomicUsize::new(0));
    let factory = ScriptedFactory {
        builders: vec![("flaky".to_string(), Disposition::Retry, false, flushes.clone())],
    };
    let mut registry = Registry::new();
    let id = registry.new_instance(&factory, "flaky").unwrap();
    let mask = registry.instance(id).unwrap().mask_id;

    let mut dispatcher = Dispatcher::new(registry, "agent-test".to_string());
    dispatcher.dispatch(Task::new(1, b"payload".to_vec(), b"tag".to_vec(), 1, vec![mask]));

    let outcomes = settle(&mut dispatcher).await;
    assert_eq!(outcomes, vec![(1, TaskOutcome::StillPending)]);

    let instance = dispatcher.registry().instance(id).unwrap();
    assert_eq!(instance.metrics.out_errors, 0);
    assert_eq!(instance.metrics.retries, 1);
}

#[tokio::test]
async fn destroying_an_instance_mid_flight_cancels_its_context_without_a_completion() {
    let flushes = Arc::new(AtomicUsize::new(0));
    let factory = ScriptedFactory {
        builders: vec![("slow".to_string(), Disposition::Ok, false, flushes.clone())],
    };
    let mut registry = Registry::new();
    let id = registry.new_instance(&factory, "slow").unwrap();
    let mask = registry.instance(id).unwrap().mask_id;

    let mut dispatcher = Dispatcher::new(registry, "agent-test".to_string());
    dispatcher.dispatch(Task::new(1, b"payload".to_vec(), b"tag".to_vec(), 1, vec![mask]));

    let active_contexts = dispatcher.registry_mut().destroy(id, "agent-test").await.unwrap();
    dispatcher.cancel_instance(id, active_contexts);

    assert_eq!(dispatcher.active_task_count(), 0);
    assert!(dispatcher.registry().instance(id).is_none());
}
