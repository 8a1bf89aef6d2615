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

//! Flush execution context (C4) and the dispatcher/completion bus (C5).
//!
//! [`Dispatcher`] owns the [`registry::Registry`] plus every currently
//! in-flight [`task::Task`]. `dispatch` spawns one flush execution per
//! matching, eligible instance; each execution reports back over that
//! instance's own `mpsc` channel as a [`task::CompletionWord`], which
//! `poll_completions` decodes and applies.

use std::collections::HashMap;

use registry::Registry;
use task::{Completion, CompletionWord, Disposition, Task};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

/// Errors raised by the dispatcher.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The task id was not found among currently in-flight tasks.
    #[error("unknown task id: {0}")]
    UnknownTask(u16),
    /// No instance with this id is registered.
    #[error("unknown instance id: {0}")]
    UnknownInstance(u32),
    /// Packing or unpacking a completion word failed.
    #[error(transparent)]
    CompletionWord(#[from] task::model::Error),
}

/// What happened to a task as a result of applying one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task still has outstanding flush contexts.
    StillPending,
    /// `users` reached zero and the task was retired (removed).
    Retired,
}

/// The dispatcher (C5), owning the registry and every in-flight task.
pub struct Dispatcher {
    registry: Registry,
    process_id: String,
    tasks: HashMap<u16, Task>,
    next_frame_id: HashMap<u16, u16>,
    /// Tasks deferred because of `NoMultiplex`, keyed by the instance
    /// they're waiting on, in the order they were deferred.
    pending: HashMap<u32, Vec<u16>>,
    completion_txs: HashMap<u32, mpsc::UnboundedSender<CompletionWord>>,
    completion_rxs: HashMap<u32, mpsc::UnboundedReceiver<CompletionWord>>,
    handles: HashMap<(u16, u16), JoinHandle<()>>,
}

impl Dispatcher {
    /// Creates a dispatcher owning `registry`.
    pub fn new(registry: Registry, process_id: String) -> Self {
        Self {
            registry,
            process_id,
            tasks: HashMap::new(),
            next_frame_id: HashMap::new(),
            pending: HashMap::new(),
            completion_txs: HashMap::new(),
            completion_rxs: HashMap::new(),
            handles: HashMap::new(),
        }
    }

    /// Shared access to the underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Mutable access to the underlying registry (instance creation,
    /// property setting, `check`/`destroy`).
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    fn channel_for(&mut self, instance_id: u32) -> mpsc::UnboundedSender<CompletionWord> {
        self.completion_txs
            .entry(instance_id)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = self.completion_rxs.insert(instance_id, rx);
                tx
            })
            .clone()
    }

    /// The hot path (C5): delivers `task` to every matching, usable
    /// instance, spawning a flush execution context for each one that is
    /// eligible right now.
    pub fn dispatch(&mut self, task: Task) {
        let route_mask = task.routes.iter().fold(0u64, |acc, &m| acc | m);
        let eligible: Vec<u32> = self
            .registry
            .instances()
            .iter()
            .filter(|i| i.usable && (i.mask_id & route_mask) != 0)
            .map(|i| i.id)
            .collect();

        let task_id = task.id;
        let _ = self.tasks.insert(task_id, task);
        for instance_id in eligible {
            self.try_spawn(task_id, instance_id);
        }
    }

    /// Attempts to start a flush context for `task_id` on `instance_id`;
    /// defers it into `pending` if the instance is `NoMultiplex` and
    /// already busy.
    fn try_spawn(&mut self, task_id: u16, instance_id: u32) {
        let Some(instance) = self.registry.instance(instance_id) else {
            warn!(instance_id, "dispatch target vanished before spawn");
            return;
        };
        if instance.capabilities.no_multiplex && !instance.active_contexts.is_empty() {
            self.pending.entry(instance_id).or_default().push(task_id);
            return;
        }

        let frame_id = {
            let counter = self.next_frame_id.entry(task_id).or_insert(0);
            let id = *counter;
            *counter += 1;
            id
        };

        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        task.attach_context(frame_id);

        let Some(instance) = self.registry.instance_mut(instance_id) else {
            return;
        };
        instance.active_contexts.push((task_id, frame_id));
        let plugin = instance.plugin.clone();
        let debug_info = instance.debug_info(&self.process_id).for_task(task_id);

        let payload = task.payload.clone();
        let tag = task.tag.clone();
        let tx = self.channel_for(instance_id);

        trace!(task_id, instance_id, frame_id, "spawning flush context");
        let handle = tokio::task::spawn(async move {
            let effect_handler = plugin::EffectHandler::new(debug_info);
            let disposition = plugin.lock().await.flush(&payload, &tag, &effect_handler).await;
            let word = match CompletionWord::encode(disposition, task_id, frame_id) {
                Ok(word) => word,
                Err(err) => {
                    warn!(task_id, frame_id, error = %err, "failed to encode completion word");
                    return;
                }
            };
            if tx.send(word).is_err() {
                warn!(task_id, frame_id, instance_id, "completion channel closed before send");
            }
        });
        let _ = self.handles.insert((task_id, frame_id), handle);
    }

    /// Drains every instance's completion channel once, applying each
    /// word's effect (decrement `users`, update metrics, retire the task
    /// or re-arm deferred dispatches). Returns the outcomes for tasks
    /// whose state changed, in the order their completions were
    /// processed.
    pub fn poll_completions(&mut self) -> Vec<(u16, TaskOutcome)> {
        let mut outcomes = Vec::new();
        let instance_ids: Vec<u32> = self.completion_rxs.keys().copied().collect();
        for instance_id in instance_ids {
            while let Ok(word) = self.try_recv(instance_id) {
                if let Some(outcome) = self.apply_completion(instance_id, word) {
                    outcomes.push(outcome);
                }
            }
        }
        outcomes
    }

    fn try_recv(&mut self, instance_id: u32) -> Result<CompletionWord, mpsc::error::TryRecvError> {
        self.completion_rxs
            .get_mut(&instance_id)
            .ok_or(mpsc::error::TryRecvError::Disconnected)?
            .try_recv()
    }

    fn apply_completion(&mut self, instance_id: u32, word: CompletionWord) -> Option<(u16, TaskOutcome)> {
        let Completion {
            disposition,
            task_id,
            frame_id,
        } = match word.decode() {
            Ok(completion) => completion,
            Err(err) => {
                warn!(instance_id, error = %err, "dropping malformed completion word");
                return None;
            }
        };

        let _ = self.handles.remove(&(task_id, frame_id));

        if let Some(instance) = self.registry.instance_mut(instance_id) {
            if let Some(pos) = instance
                .active_contexts
                .iter()
                .position(|&(t, f)| t == task_id && f == frame_id)
            {
                let _ = instance.active_contexts.swap_remove(pos);
            }
            match disposition {
                Disposition::Ok => {}
                Disposition::Error => instance.metrics.out_errors += 1,
                Disposition::Retry => instance.metrics.retries += 1,
            }
        }

        let retired = {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                return None;
            };
            let _ = task.detach_context(frame_id);
            if disposition == Disposition::Ok {
                if let Some(instance) = self.registry.instance_mut(instance_id) {
                    instance.metrics.out_ok_records += task.record_count as u64;
                    instance.metrics.out_ok_bytes += task.byte_size as u64;
                }
            }
            task.is_retired()
        };

        let outcome = if retired {
            info!(task_id, "task retired");
            let _ = self.tasks.remove(&task_id);
            TaskOutcome::Retired
        } else {
            TaskOutcome::StillPending
        };

        self.retry_pending(instance_id);
        Some((task_id, outcome))
    }

    /// Re-attempts any dispatch deferred on `instance_id` because of
    /// `NoMultiplex`, now that a flush against it has just completed.
    /// Only the first deferred task can actually spawn (the instance
    /// allows one flush at a time); the rest are re-deferred by
    /// `try_spawn` in the same order.
    fn retry_pending(&mut self, instance_id: u32) {
        let Some(waiting) = self.pending.remove(&instance_id) else {
            return;
        };
        for task_id in waiting {
            self.try_spawn(task_id, instance_id);
        }
    }

    /// Cancels every active flush context for `instance_id` (instance
    /// teardown mid-flight): aborts the join handles and decrements the
    /// owning tasks' `users` without emitting a completion word, as
    /// `JoinHandle::abort`'s drop path stands in for the original frame
    /// destructor callback.
    pub fn cancel_instance(&mut self, _instance_id: u32, active_contexts: Vec<(u16, u16)>) {
        for (task_id, frame_id) in active_contexts {
            if let Some(handle) = self.handles.remove(&(task_id, frame_id)) {
                handle.abort();
            }
            if let Some(task) = self.tasks.get_mut(&task_id) {
                let _ = task.detach_context(frame_id);
                if task.is_retired() {
                    let _ = self.tasks.remove(&task_id);
                }
            }
        }
    }

    /// Number of tasks currently tracked as in-flight.
    pub fn active_task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use context::Context;
    use plugin::{Capabilities, EffectHandler, Error as PluginError, OutputPluginBuilder, OutputPluginFactory};
    use std::time::Duration;

    struct ScriptedPlugin {
        reply: Disposition,
    }

    #[async_trait]
    impl AsyncOutputPlugin for ScriptedPlugin {
        async fn flush(&mut self, _buf: &[u8], _tag: &[u8], _effect_handler: &EffectHandler) -> Disposition {
            self.reply
        }
    }

    struct ScriptedBuilder {
        capabilities: Capabilities,
        reply: Disposition,
    }

    impl OutputPluginBuilder for ScriptedBuilder {
        fn r#type(&self) -> &str {
            "scripted"
        }

        fn capabilities(&self) -> Capabilities {
            self.capabilities
        }

        fn build(&self) -> Result<Box<dyn AsyncOutputPlugin + Send + Sync>, PluginError> {
            Ok(Box::new(ScriptedPlugin { reply: self.reply }))
        }
    }

    struct ScriptedFactory {
        capabilities: Capabilities,
        reply: Disposition,
    }

    impl OutputPluginFactory for ScriptedFactory {
        fn builder(&self, plugin_type: &str) -> Option<Box<dyn OutputPluginBuilder + Send + Sync>> {
            (plugin_type == "scripted").then(|| {
                Box::new(ScriptedBuilder {
                    capabilities: self.capabilities,
                    reply: self.reply,
                }) as Box<dyn OutputPluginBuilder + Send + Sync>
            })
        }
    }

    fn factory(no_multiplex: bool, reply: Disposition) -> ScriptedFactory {
        ScriptedFactory {
            capabilities: Capabilities {
                network: false,
                no_multiplex,
                proxy_hosted: false,
            },
            reply,
        }
    }

    async fn settle(dispatcher: &mut Dispatcher) -> Vec<(u16, TaskOutcome)> {
        let mut outcomes = Vec::new();
        for _ in 0..100 {
            let batch = dispatcher.poll_completions();
            if batch.is_empty() {
                if dispatcher.active_task_count() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }
            outcomes.extend(batch);
        }
        outcomes
    }

    #[tokio::test]
    async fn dispatch_routes_only_to_matching_instances() {
        let factory = factory(false, Disposition::Ok);
        let mut registry = Registry::new();
        let matching = registry.new_instance(&factory, "scripted").unwrap();
        let other = registry.new_instance(&factory, "scripted").unwrap();
        let _ = registry.check("agent-1", &Context::new()).await;
        let mask = registry.instance(matching).unwrap().mask_id;

        let mut dispatcher = Dispatcher::new(registry, "agent-1".to_string());
        let task = Task::new(1, b"payload".to_vec(), b"tag".to_vec(), 1, vec![mask]);
        dispatcher.dispatch(task);

        let outcomes = settle(&mut dispatcher).await;
        assert_eq!(outcomes, vec![(1, TaskOutcome::Retired)]);
        assert_eq!(dispatcher.registry().instance(matching).unwrap().metrics.out_ok_records, 1);
        assert_eq!(dispatcher.registry().instance(other).unwrap().metrics.out_ok_records, 0);
    }

    #[tokio::test]
    async fn retry_disposition_does_not_retire_the_task() {
        let factory = factory(false, Disposition::Retry);
        let mut registry = Registry::new();
        let id = registry.new_instance(&factory, "scripted").unwrap();
        let _ = registry.check("agent-1", &Context::new()).await;
        let mask = registry.instance(id).unwrap().mask_id;

        let mut dispatcher = Dispatcher::new(registry, "agent-1".to_string());
        let task = Task::new(1, b"payload".to_vec(), b"tag".to_vec(), 1, vec![mask]);
        dispatcher.dispatch(task);

        let outcomes = settle(&mut dispatcher).await;
        assert_eq!(outcomes, vec![(1, TaskOutcome::StillPending)]);
        assert_eq!(dispatcher.registry().instance(id).unwrap().metrics.retries, 1);
    }

    #[tokio::test]
    async fn no_multiplex_instance_defers_a_second_dispatch_until_the_first_completes() {
        let factory = factory(true, Disposition::Ok);
        let mut registry = Registry::new();
        let id = registry.new_instance(&factory, "scripted").unwrap();
        let _ = registry.check("agent-1", &Context::new()).await;
        let mask = registry.instance(id).unwrap().mask_id;

        let mut dispatcher = Dispatcher::new(registry, "agent-1".to_string());
        dispatcher.dispatch(Task::new(1, b"a".to_vec(), b"tag".to_vec(), 1, vec![mask]));
        dispatcher.dispatch(Task::new(2, b"b".to_vec(), b"tag".to_vec(), 1, vec![mask]));

        let outcomes = settle(&mut dispatcher).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, outcome)| *outcome == TaskOutcome::Retired));
        assert_eq!(dispatcher.registry().instance(id).unwrap().metrics.out_ok_records, 2);
    }
}
