//! VM threads and the per-thread local-reference storage.

use std::cell::Cell;
use std::ptr;

use memoffset::offset_of;

use crate::args::ArgumentList;
use crate::machine::Machine;
use crate::object::Obj;

/// Thread execution states. Compiled code runs in `Active`; foreign
/// calls drop to `Idle` so other threads can reach safepoints;
/// `Exclusive` is held by a thread that stopped the world.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Active,
    Idle,
    Exclusive,
}

/// Per-thread VM state. The first three fields are addressed from
/// emitted code: helper-call sequences store the current frame base and
/// return address, and runtime helpers publish pending exceptions.
#[repr(C)]
pub struct Thread {
    pub exception: *mut Obj,

    /// Frame base (RBP) of the most recent compiled frame, written
    /// before every helper call and by the trampolines.
    pub frame: usize,

    /// Machine address at which the innermost compiled frame will
    /// resume; the unwinder's starting IP.
    pub xpc: usize,

    machine: *const Machine,
    pub java_thread: *mut Obj,
    pub parent: *mut Thread,
    state: Cell<ThreadState>,

    /// Innermost argument list, linked for reentrancy; the GC root set
    /// walks the chain.
    pub argument_list: *mut ArgumentList,

    pub handles: HandleMemory,

    /// `thread.frame` values captured at each entry-gate launch. The
    /// unwinder stops at the innermost boundary so host frames between
    /// gate invocations are never skipped.
    entry_frames: Vec<usize>,
}

impl Thread {
    pub fn new(machine: *const Machine, java_thread: *mut Obj, parent: *mut Thread) -> Thread {
        Thread {
            exception: ptr::null_mut(),
            frame: 0,
            xpc: 0,
            machine,
            java_thread,
            parent,
            state: Cell::new(ThreadState::Active),
            argument_list: ptr::null_mut(),
            handles: HandleMemory::new(),
            entry_frames: Vec::new(),
        }
    }

    pub fn offset_of_frame() -> i32 {
        offset_of!(Thread, frame) as i32
    }

    pub fn offset_of_xpc() -> i32 {
        offset_of!(Thread, xpc) as i32
    }

    pub fn machine(&self) -> &Machine {
        unsafe { &*self.machine }
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.set(state);
    }

    pub fn has_exception(&self) -> bool {
        !self.exception.is_null()
    }

    pub fn push_entry_frame(&mut self, frame: usize) {
        self.entry_frames.push(frame);
    }

    pub fn pop_entry_frame(&mut self) {
        self.entry_frames.pop().expect("no entry frame");
    }

    /// The frame value at which the current gate invocation started, or
    /// `None` outside any gate.
    pub fn entry_boundary(&self) -> Option<usize> {
        self.entry_frames.last().copied()
    }
}

pub const HANDLE_CHUNK: usize = 256;

/// Chunked storage for local references. Slot addresses stay stable for
/// the lifetime of the thread, so native code can hold them across
/// further allocation.
pub struct HandleMemory {
    buffers: Vec<Box<HandleBuffer>>,
    len: usize,
}

struct HandleBuffer {
    elements: [*mut Obj; HANDLE_CHUNK],
}

impl HandleBuffer {
    fn new() -> Box<HandleBuffer> {
        Box::new(HandleBuffer {
            elements: [ptr::null_mut(); HANDLE_CHUNK],
        })
    }
}

impl HandleMemory {
    pub fn new() -> HandleMemory {
        HandleMemory {
            buffers: vec![HandleBuffer::new()],
            len: 0,
        }
    }

    pub fn push(&mut self, obj: *mut Obj) -> *mut *mut Obj {
        let buffer = self.len / HANDLE_CHUNK;
        let element = self.len % HANDLE_CHUNK;

        if buffer == self.buffers.len() {
            self.buffers.push(HandleBuffer::new());
        }

        let slot = &mut self.buffers[buffer].elements[element];
        *slot = obj;
        self.len += 1;

        slot as *mut *mut Obj
    }

    /// Number of live slots; pass the value back to `truncate` for bulk
    /// release.
    pub fn watermark(&self) -> usize {
        self.len
    }

    pub fn truncate(&mut self, watermark: usize) {
        assert!(watermark <= self.len);

        for index in watermark..self.len {
            self.buffers[index / HANDLE_CHUNK].elements[index % HANDLE_CHUNK] = ptr::null_mut();
        }

        self.len = watermark;
    }

    pub fn visit_slots<F: FnMut(*mut *mut Obj)>(&mut self, mut f: F) {
        for index in 0..self.len {
            let slot =
                &mut self.buffers[index / HANDLE_CHUNK].elements[index % HANDLE_CHUNK];

            f(slot as *mut *mut Obj);
        }
    }
}

impl Default for HandleMemory {
    fn default() -> HandleMemory {
        HandleMemory::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jit_visible_offsets() {
        assert_eq!(
            crate::mem::ptr_width(),
            Thread::offset_of_frame()
        );
        assert_eq!(
            2 * crate::mem::ptr_width(),
            Thread::offset_of_xpc()
        );
    }

    #[test]
    fn test_handle_slots_are_stable() {
        let mut handles = HandleMemory::new();
        let first = handles.push(0x10 as *mut Obj);

        for i in 0..(2 * HANDLE_CHUNK) {
            handles.push(i as *mut Obj);
        }

        unsafe {
            assert_eq!(0x10 as *mut Obj, *first);
        }
    }

    #[test]
    fn test_watermark_truncate() {
        let mut handles = HandleMemory::new();
        handles.push(1 as *mut Obj);
        let mark = handles.watermark();
        let slot = handles.push(2 as *mut Obj);

        handles.truncate(mark);

        assert_eq!(1, handles.watermark());
        unsafe {
            assert!((*slot).is_null());
        }
    }

    #[test]
    fn test_visit_slots() {
        let mut handles = HandleMemory::new();
        handles.push(1 as *mut Obj);
        handles.push(2 as *mut Obj);

        let mut seen = Vec::new();
        handles.visit_slots(|slot| unsafe { seen.push(*slot as usize) });

        assert_eq!(vec![1, 2], seen);
    }
}
