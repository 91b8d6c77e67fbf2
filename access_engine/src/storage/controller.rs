// Storage controller: queues rule-change events and forwards them to the
// adapter, per rule or batched, manually or on autosave.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::policy::{Emitter, ListenerId, StoreEvent};
use crate::types::Rule;

use super::Adapter;

/// Queue is drained under its lock in segments of this size, so a long
/// flush cannot starve concurrent enqueues.
const FLUSH_SEGMENT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Add,
    Remove,
}

struct QueueState {
    queue: VecDeque<(Opcode, Rule)>,
    wait: i64,
}

struct ControllerCore {
    adapter: Mutex<Arc<dyn Adapter>>,
    state: Mutex<QueueState>,
    autosave: AtomicBool,
}

impl ControllerCore {
    fn add_op(&self, opcode: Opcode, rule: Rule) {
        let should_flush = {
            let mut state = self.state.lock();
            state.queue.push_back((opcode, rule));
            if self.autosave.load(Ordering::SeqCst) {
                state.wait -= 1;
                state.wait <= 0
            } else {
                false
            }
        };
        if should_flush {
            if let Err(e) = self.flush() {
                warn!("autosave flush failed: {}", e);
            }
        }
    }

    /// Pushes unprocessed operations back to the queue front, preserving
    /// their order, after a failed adapter call.
    fn requeue(&self, ops: &[(Opcode, Rule)]) {
        let mut state = self.state.lock();
        for op in ops.iter().rev() {
            state.queue.push_front(op.clone());
        }
    }

    fn run_segment(&self, adapter: &Arc<dyn Adapter>, ops: Vec<(Opcode, Rule)>) -> Result<()> {
        if let Some(batch) = adapter.as_batch() {
            let mut i = 0;
            while i < ops.len() {
                let opcode = ops[i].0;
                let mut j = i;
                while j < ops.len() && ops[j].0 == opcode {
                    j += 1;
                }
                let rules: Vec<Rule> = ops[i..j].iter().map(|(_, r)| r.clone()).collect();
                let res = match opcode {
                    Opcode::Add => batch.add_rules(&rules),
                    Opcode::Remove => batch.remove_rules(&rules),
                };
                if let Err(e) = res {
                    self.requeue(&ops[i..]);
                    return Err(e);
                }
                i = j;
            }
            Ok(())
        } else if let Some(simple) = adapter.as_simple() {
            for (idx, (opcode, rule)) in ops.iter().enumerate() {
                let res = match opcode {
                    Opcode::Add => simple.add_rule(rule),
                    Opcode::Remove => simple.remove_rule(rule),
                };
                if let Err(e) = res {
                    self.requeue(&ops[idx..]);
                    return Err(e);
                }
            }
            Ok(())
        } else {
            self.requeue(&ops);
            Err(Error::adapter(
                "adapter supports neither per-rule nor batch writes",
            ))
        }
    }

    /// Drains the queue. A failed operation stays queued along with
    /// everything behind it, and the error surfaces to the caller.
    fn flush(&self) -> Result<()> {
        let adapter = Arc::clone(&self.adapter.lock());
        loop {
            let segment: Vec<(Opcode, Rule)> = {
                let mut state = self.state.lock();
                let n = state.queue.len().min(FLUSH_SEGMENT);
                state.queue.drain(..n).collect()
            };
            if segment.is_empty() {
                break;
            }
            self.run_segment(&adapter, segment)?;
        }
        self.state.lock().wait = 0;
        Ok(())
    }
}

/// Mirrors rule changes into the storage adapter. Listens to the model's
/// rule events while enabled; bulk loads run with the controller disabled so
/// the adapter is not called back with its own data.
pub struct StorageController {
    core: Arc<ControllerCore>,
    emitter: Arc<Emitter>,
    listeners: Mutex<Vec<ListenerId>>,
}

impl StorageController {
    pub fn new(
        emitter: Arc<Emitter>,
        adapter: Arc<dyn Adapter>,
        autosave: bool,
    ) -> StorageController {
        let sc = StorageController {
            core: Arc::new(ControllerCore {
                adapter: Mutex::new(adapter),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    wait: 0,
                }),
                autosave: AtomicBool::new(autosave),
            }),
            emitter,
            listeners: Mutex::new(Vec::new()),
        };
        sc.enable();
        sc
    }

    /// Attaches the rule-event listeners; idempotent.
    pub fn enable(&self) {
        let mut listeners = self.listeners.lock();
        if !listeners.is_empty() {
            return;
        }
        for (event, opcode) in [
            (StoreEvent::RuleAdded, Opcode::Add),
            (StoreEvent::RuleRemoved, Opcode::Remove),
        ] {
            let core = Arc::clone(&self.core);
            listeners.push(self.emitter.on(
                event,
                Box::new(move |rule| {
                    core.add_op(opcode, rule.to_vec());
                }),
            ));
        }
    }

    /// Detaches the listeners; queued operations stay queued.
    pub fn disable(&self) {
        let mut listeners = self.listeners.lock();
        for id in listeners.drain(..) {
            self.emitter.off(id);
        }
    }

    pub fn enabled(&self) -> bool {
        !self.listeners.lock().is_empty()
    }

    pub fn set_autosave(&self, on: bool) {
        self.core.autosave.store(on, Ordering::SeqCst);
    }

    pub fn autosave_enabled(&self) -> bool {
        self.core.autosave.load(Ordering::SeqCst)
    }

    /// Raises the autosave wait counter so a bulk mutation flushes once.
    pub fn add_wait(&self, n: usize) {
        self.core.state.lock().wait += n as i64;
    }

    /// Flushes whatever a bulk mutation left behind, e.g. when duplicate
    /// rules produced fewer events than `add_wait` expected.
    pub fn settle(&self) -> Result<()> {
        let pending = {
            let mut state = self.core.state.lock();
            state.wait = 0;
            !state.queue.is_empty()
        };
        if self.autosave_enabled() && pending {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Drains the operation queue into the adapter.
    pub fn flush(&self) -> Result<()> {
        self.core.flush()
    }

    pub fn set_adapter(&self, adapter: Arc<dyn Adapter>) {
        *self.core.adapter.lock() = adapter;
    }

    pub fn pending_ops(&self) -> usize {
        self.core.state.lock().queue.len()
    }
}

impl Drop for StorageController {
    fn drop(&mut self) {
        self.disable();
    }
}
