//! Argument marshalling for launching compiled code from the host, and
//! the `invoke` entry that every public invocation funnels through.

use std::ptr;

use crate::class::{Method, TypeCode};
use crate::descriptor::{DescriptorIter, ParamKind};
use crate::mem;
use crate::object::{self, IntObj, LongObj, Obj};
use crate::threads::Thread;

/// One host-side argument for `invoke_list`. With `indirect` set,
/// references arrive as handles and are dereferenced while marshalling.
#[derive(Copy, Clone, Debug)]
pub enum JavaValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(*mut Obj),
    Handle(*mut *mut Obj),
}

/// The word image a compiled frame expects, plus the parallel object
/// mask the root scanner walks. Word 0 is the thread, word 1 the method
/// (written by `invoke`), word 2 the caller's previous frame; argument
/// words follow, laid out to match the callee's parameter area.
pub struct ArgumentList {
    words: Vec<usize>,
    mask: Vec<bool>,
    thread: *mut Thread,
    next: *mut ArgumentList,
}

impl ArgumentList {
    fn reserved(t: *mut Thread) -> ArgumentList {
        unsafe {
            ArgumentList {
                words: vec![t as usize, 0, (*t).frame],
                mask: vec![false, true, false],
                thread: t,
                next: (*t).argument_list,
            }
        }
    }

    fn link(mut list: Box<ArgumentList>) -> Box<ArgumentList> {
        unsafe {
            (*list.thread).argument_list = &mut *list;
        }

        list
    }

    /// Appends the collected argument words. The frame image is the
    /// push order mirrored, so the words go in reversed.
    fn seal(&mut self, arg_words: Vec<(usize, bool)>) {
        for &(word, is_object) in arg_words.iter().rev() {
            self.words.push(word);
            self.mask.push(is_object);
        }
    }

    pub fn from_values(
        t: *mut Thread,
        this: *mut Obj,
        descriptor: &str,
        indirect: bool,
        values: &[JavaValue],
    ) -> Box<ArgumentList> {
        let mut list = Box::new(ArgumentList::reserved(t));
        let mut arg_words: Vec<(usize, bool)> = Vec::new();

        if !this.is_null() {
            arg_words.push((this as usize, true));
        }

        let mut index = 0;

        for kind in DescriptorIter::new(descriptor) {
            let value = values[index];
            index += 1;

            match (kind, value) {
                (ParamKind::Reference, JavaValue::Object(obj)) => {
                    assert!(!indirect, "direct reference in indirect call");
                    arg_words.push((obj as usize, true));
                }

                (ParamKind::Reference, JavaValue::Handle(handle)) => {
                    assert!(indirect, "handle in direct call");
                    let obj = if handle.is_null() {
                        ptr::null_mut()
                    } else {
                        unsafe { *handle }
                    };
                    arg_words.push((obj as usize, true));
                }

                (ParamKind::Int64, JavaValue::Long(v)) => {
                    push_category2(&mut arg_words, v as u64);
                }

                (ParamKind::Float64, JavaValue::Double(v)) => {
                    push_category2(&mut arg_words, v.to_bits());
                }

                (ParamKind::Float32, JavaValue::Float(v)) => {
                    arg_words.push((v.to_bits() as usize, false));
                }

                (
                    ParamKind::Int8 | ParamKind::Int16 | ParamKind::Int32,
                    JavaValue::Int(v),
                ) => {
                    arg_words.push((v as u32 as usize, false));
                }

                (kind, value) => panic!("argument {:?} does not fit {:?}", value, kind),
            }
        }

        list.seal(arg_words);
        ArgumentList::link(list)
    }

    /// The array-of-boxed-objects form: primitives arrive boxed, with
    /// category-2 values in long boxes.
    pub fn from_object_array(
        t: *mut Thread,
        this: *mut Obj,
        descriptor: &str,
        arguments: *mut Obj,
    ) -> Box<ArgumentList> {
        let mut list = Box::new(ArgumentList::reserved(t));
        let mut arg_words: Vec<(usize, bool)> = Vec::new();

        if !this.is_null() {
            arg_words.push((this as usize, true));
        }

        let mut index = 0;

        for kind in DescriptorIter::new(descriptor) {
            let element: *mut Obj = unsafe { object::array_get(arguments, index) };
            index += 1;

            match kind {
                ParamKind::Reference => {
                    arg_words.push((element as usize, true));
                }

                ParamKind::Int64 | ParamKind::Float64 => {
                    let value = unsafe { (*(element as *mut LongObj)).value };
                    push_category2(&mut arg_words, value as u64);
                }

                _ => {
                    let value = unsafe { (*(element as *mut IntObj)).value };
                    arg_words.push((value as u32 as usize, false));
                }
            }
        }

        list.seal(arg_words);
        ArgumentList::link(list)
    }

    pub fn set_method(&mut self, method: *mut Method) {
        self.words[1] = method as usize;
    }

    pub fn words(&self) -> *const usize {
        self.words.as_ptr()
    }

    pub fn byte_length(&self) -> usize {
        self.words.len() * mem::ptr_width_usize()
    }

    pub fn next(&self) -> *mut ArgumentList {
        self.next
    }

    /// Calls the visitor for every word whose mask bit marks it as an
    /// object root.
    pub fn visit_roots<F: FnMut(*mut *mut Obj)>(&mut self, mut f: F) {
        for (index, &is_object) in self.mask.iter().enumerate() {
            if is_object {
                f(&mut self.words[index] as *mut usize as *mut *mut Obj);
            }
        }
    }
}

impl Drop for ArgumentList {
    fn drop(&mut self) {
        unsafe {
            (*self.thread).argument_list = self.next;
        }
    }
}

/// Category-2 word pair: high word pushed first, low word on top.
fn push_category2(arg_words: &mut Vec<(usize, bool)>, value: u64) {
    arg_words.push(((value >> 32) as usize, false));
    arg_words.push((value as u32 as usize, false));
}

/// Launches a method through the entry gate and boxes the result.
/// Restores the thread's frame and truncates local references created
/// during the call; a pending exception stays observable on the thread
/// with a zero-sentinel result.
pub fn invoke(t: *mut Thread, method: *mut Method, list: &mut ArgumentList) -> *mut Obj {
    unsafe {
        let machine = (*t).machine();

        list.set_method(method);

        let saved_frame = (*t).frame;
        let watermark = (*t).handles.watermark();
        (*t).push_entry_frame(saved_frame);

        let gate = machine.entry_gate();
        let entry = (*method).compiled_code().entry();
        let result = gate(entry, list.words(), list.byte_length());

        (*t).pop_entry_frame();
        (*t).frame = saved_frame;
        (*t).handles.truncate(watermark);

        match (*method).return_code {
            TypeCode::Byte
            | TypeCode::Boolean
            | TypeCode::Char
            | TypeCode::Short
            | TypeCode::Float
            | TypeCode::Int => machine.make_int(result as i32),

            TypeCode::Long | TypeCode::Double => machine.make_long(result as i64),

            TypeCode::Object => result as usize as *mut Obj,

            TypeCode::Void => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category2_word_order() {
        let mut words = Vec::new();
        push_category2(&mut words, 0x1122334455667788);

        assert_eq!(vec![(0x11223344, false), (0x55667788, false)], words);
    }
}
