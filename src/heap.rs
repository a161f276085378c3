//! Arena heap. Objects live for the life of the machine; collection is
//! a collaborator concern outside this crate, which is also why
//! pool-indexed references stay valid across the program.

use parking_lot::Mutex;

use crate::class::Class;
use crate::mem;
use crate::object::{ArrayObj, Obj};

pub struct Heap {
    allocations: Mutex<Vec<Box<[usize]>>>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            allocations: Mutex::new(Vec::new()),
        }
    }

    /// Zeroed, word-aligned allocation.
    fn alloc(&self, bytes: usize) -> *mut u8 {
        let words = (bytes + mem::ptr_width_usize() - 1) / mem::ptr_width_usize();
        let mut chunk = vec![0usize; words.max(1)].into_boxed_slice();
        let ptr = chunk.as_mut_ptr() as *mut u8;

        self.allocations.lock().push(chunk);

        ptr
    }

    pub fn make_object(&self, class: *mut Class, size: usize) -> *mut Obj {
        let obj = self.alloc(size) as *mut Obj;

        unsafe {
            (*obj).header.class = class;
        }

        obj
    }

    pub fn make_array(&self, class: *mut Class, element_size: usize, length: usize) -> *mut Obj {
        let size = ArrayObj::offset_of_data() as usize + element_size * length;
        let obj = self.alloc(size) as *mut ArrayObj;

        unsafe {
            (*obj).header.class = class;
            (*obj).length = length;
        }

        obj as *mut Obj
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;
    use std::ptr;

    #[test]
    fn test_array_layout() {
        let heap = Heap::new();
        let array = heap.make_array(ptr::null_mut(), 4, 3);

        unsafe {
            assert_eq!(3, object::array_length(array));
            object::array_set::<i32>(array, 0, 10);
            object::array_set::<i32>(array, 2, 30);
            assert_eq!(10, object::array_get::<i32>(array, 0));
            assert_eq!(0, object::array_get::<i32>(array, 1));
            assert_eq!(30, object::array_get::<i32>(array, 2));
        }
    }

    #[test]
    fn test_allocations_zeroed() {
        let heap = Heap::new();
        let obj = heap.make_object(ptr::null_mut(), 24);

        unsafe {
            let words = obj as *const usize;
            assert_eq!(0, *words.add(1));
            assert_eq!(0, *words.add(2));
        }
    }
}
