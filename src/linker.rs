//! Constant-pool resolution and the type tests emitted code leans on.
//! Class loading proper is a collaborator; pools arrive pre-linked and
//! resolution here is a checked lookup.

use crate::bytecode::ACC_SUPER;
use crate::class::{Class, Field, Method, PoolEntry};
use crate::error::VmError;
use crate::machine::Machine;
use crate::object::Obj;

/// 1-based pool lookup; index 0 is never valid.
pub fn pool_entry(pool: &[PoolEntry], index: u16) -> Option<&PoolEntry> {
    (index as usize).checked_sub(1).and_then(|i| pool.get(i))
}

pub fn resolve_class(pool: &[PoolEntry], index: u16) -> Result<*mut Class, VmError> {
    match pool_entry(pool, index) {
        Some(&PoolEntry::ClassRef(class)) => Ok(class),
        _ => Err(VmError::UnresolvedClass(index)),
    }
}

pub fn resolve_field(pool: &[PoolEntry], index: u16) -> Result<*mut Field, VmError> {
    match pool_entry(pool, index) {
        Some(&PoolEntry::FieldRef(field)) => Ok(field),
        _ => Err(VmError::UnresolvedField(index)),
    }
}

pub fn resolve_method(pool: &[PoolEntry], index: u16) -> Result<*mut Method, VmError> {
    match pool_entry(pool, index) {
        Some(&PoolEntry::MethodRef(method)) => Ok(method),
        _ => Err(VmError::UnresolvedMethod(index)),
    }
}

/// `sub` is the same class as `sup` or inherits from it.
pub fn is_assignable_from(sup: *const Class, sub: *const Class) -> bool {
    let mut current = sub;

    while !current.is_null() {
        if current == sup {
            return true;
        }

        current = unsafe { (*current).super_class };
    }

    false
}

pub fn instance_of(class: *const Class, obj: *const Obj) -> bool {
    if obj.is_null() {
        return false;
    }

    is_assignable_from(class, unsafe { (*obj).class() })
}

/// An `invokespecial` target that must be re-looked-up in the caller's
/// superclass: a non-constructor declared in a true superclass of a
/// class compiled with `ACC_SUPER`.
pub fn is_special_method(method: *const Method, class: *const Class) -> bool {
    unsafe {
        (*class).flags & ACC_SUPER != 0
            && (*method).name != "<init>"
            && (*method).class != class as *mut Class
            && is_assignable_from((*method).class, class)
    }
}

/// Walks `class` and its superclasses for a method with the given name
/// and descriptor.
pub fn find_method(
    class: *const Class,
    name: &str,
    descriptor: &str,
) -> Option<*mut Method> {
    let mut current = class;

    while !current.is_null() {
        unsafe {
            for &method in &(*current).methods {
                if (*method).name == name && (*method).descriptor == descriptor {
                    return Some(method);
                }
            }

            current = (*current).super_class;
        }
    }

    None
}

/// Foreign entry point for a native method, keyed `Class.method` in the
/// machine's symbol registry.
pub fn resolve_native_method(machine: &Machine, method: &Method) -> Option<usize> {
    let class_name = if method.class.is_null() {
        "?"
    } else {
        unsafe { &(*method.class).name }
    };

    machine.native_symbol(&format!("{}.{}", class_name, method.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::PoolEntry;

    #[test]
    fn test_resolution_failure() {
        let pool = vec![PoolEntry::Int(3), PoolEntry::Unresolved];

        assert!(resolve_class(&pool, 1).is_err());
        assert!(resolve_class(&pool, 2).is_err());
        assert!(resolve_field(&pool, 2).is_err());
        assert!(resolve_method(&pool, 3).is_err());
    }
}
