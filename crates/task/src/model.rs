//! Task/flush domain types and the completion wire format.
//!
//! `Task` and `FlushContext` are data only: the engine thread owns and
//! mutates them directly, and the actual execution unit that runs a
//! plugin's flush body (the async task standing in for the original
//! cooperative stack) lives in the `dispatch` crate. [`CompletionWord`]
//! is the packed 64-bit value a flush execution reports back with,
//! carried over an `mpsc` channel instead of the original event pipe but
//! bit-for-bit compatible with it.

use thiserror::Error;

/// Outcome of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The flush succeeded.
    Ok,
    /// The flush failed in a way the scheduler should retry.
    Retry,
    /// The flush failed and this attempt is terminated.
    Error,
}

impl Disposition {
    fn to_bits(self) -> u32 {
        match self {
            Disposition::Ok => 0,
            Disposition::Error => 1,
            Disposition::Retry => 2,
        }
    }

    fn from_bits(bits: u32) -> Result<Self, Error> {
        match bits {
            0 => Ok(Disposition::Ok),
            1 => Ok(Disposition::Error),
            2 => Ok(Disposition::Retry),
            other => Err(Error::BadDisposition(other)),
        }
    }
}

/// The only event kind this wire format currently carries.
const EVENT_KIND_TASK: u32 = 2;

/// Maximum value a 15-bit id field can hold.
const ID_MASK: u32 = 0x7fff;

/// Errors decoding or constructing a [`CompletionWord`].
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A task or frame id did not fit in 15 bits.
    #[error("id {0} does not fit in 15 bits")]
    IdOutOfRange(u32),
    /// The low 32 bits carried a disposition value outside `{0,1,2}`.
    #[error("invalid disposition bits: {0}")]
    BadDisposition(u32),
    /// The high 32 bits were not the `TASK` event kind.
    #[error("unexpected event kind: {0}")]
    UnexpectedEventKind(u32),
}

/// The 64-bit packed value a completed flush reports: high 32 bits are
/// the event kind (always `TASK = 2` in this core), low 32 bits are
/// `disposition(2) | task_id(15) | frame_id(15)` from high to low. Bit
/// positions must be preserved exactly; this type only exists to keep
/// that encoding centralized and tested.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionWord(u64);

/// A decoded [`CompletionWord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// The flush's outcome.
    pub disposition: Disposition,
    /// The id of the task this completion belongs to.
    pub task_id: u16,
    /// The id of the flush context (frame) within that task.
    pub frame_id: u16,
}

impl CompletionWord {
    /// Packs a disposition and ids into a completion word.
    pub fn encode(disposition: Disposition, task_id: u16, frame_id: u16) -> Result<Self, Error> {
        let task_id = u32::from(task_id);
        let frame_id = u32::from(frame_id);
        if task_id > ID_MASK {
            return Err(Error::IdOutOfRange(task_id));
        }
        if frame_id > ID_MASK {
            return Err(Error::IdOutOfRange(frame_id));
        }
        let low = (disposition.to_bits() << 30) | (task_id << 15) | frame_id;
        let word = (u64::from(EVENT_KIND_TASK) << 32) | u64::from(low);
        Ok(Self(word))
    }

    /// Unpacks a completion word, rejecting anything not carrying the
    /// `TASK` event kind.
    pub fn decode(self) -> Result<Completion, Error> {
        let event_kind = (self.0 >> 32) as u32;
        if event_kind != EVENT_KIND_TASK {
            return Err(Error::UnexpectedEventKind(event_kind));
        }
        let low = self.0 as u32;
        let disposition = Disposition::from_bits(low >> 30)?;
        let task_id = ((low >> 15) & ID_MASK) as u16;
        let frame_id = (low & ID_MASK) as u16;
        Ok(Completion {
            disposition,
            task_id,
            frame_id,
        })
    }

    /// The raw 64-bit wire value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A formatted batch of records awaiting dispatch to one or more
/// instances.
#[derive(Debug)]
pub struct Task {
    /// Id assigned by the engine scheduler, unique among live tasks.
    pub id: u16,
    /// The encoded record batch.
    pub payload: Vec<u8>,
    /// Routing tag matched against each instance's `match`/`match_regex`.
    pub tag: Vec<u8>,
    /// Number of records in `payload`.
    pub record_count: u32,
    /// Byte length of `payload`.
    pub byte_size: usize,
    /// Mask ids of the instances this task routes to.
    pub routes: Vec<u64>,
    /// Number of live flush contexts currently holding this task's
    /// payload. Incremented on each spawn, decremented on each
    /// completion, mutated only on the engine thread.
    users: u32,
    /// Frame ids of this task's currently active flush contexts.
    contexts: Vec<u16>,
}

impl Task {
    /// Creates a new task with no active flush contexts.
    pub fn new(id: u16, payload: Vec<u8>, tag: Vec<u8>, record_count: u32, routes: Vec<u64>) -> Self {
        let byte_size = payload.len();
        Self {
            id,
            payload,
            tag,
            record_count,
            byte_size,
            routes,
            users: 0,
            contexts: Vec::new(),
        }
    }

    /// Registers a newly spawned flush context, incrementing `users`.
    pub fn attach_context(&mut self, frame_id: u16) {
        self.users += 1;
        self.contexts.push(frame_id);
    }

    /// Removes a flush context (on completion or cancellation),
    /// decrementing `users`. Returns `true` if that was a context this
    /// task actually held.
    pub fn detach_context(&mut self, frame_id: u16) -> bool {
        if let Some(pos) = self.contexts.iter().position(|&id| id == frame_id) {
            let _ = self.contexts.swap_remove(pos);
            self.users -= 1;
            true
        } else {
            false
        }
    }

    /// Number of live flush contexts holding this task.
    pub fn users(&self) -> u32 {
        self.users
    }

    /// True once every spawned flush context has completed or been
    /// cancelled.
    pub fn is_retired(&self) -> bool {
        self.users == 0
    }
}

/// One in-flight invocation of an instance's flush entry. Purely
/// descriptive: the async task that actually runs the flush body lives
/// in the dispatcher, keyed by `(task_id, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushContext {
    /// Id unique within the owning task.
    pub id: u16,
    /// The task this context is flushing.
    pub task_id: u16,
    /// The instance whose flush entry this context runs.
    pub instance_id: u32,
}
