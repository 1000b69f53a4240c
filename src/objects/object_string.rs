use crate::objects::object::{Object, ObjectType};
use crate::objects::object_manager::ObjectManager;
use crate::table::Table;
use crate::value::make_nil_value;

#[repr(C)]
pub struct ObjectString {
    pub object: Object,
    pub content: String,
    pub hash: u32,
}

impl ObjectString {
    pub fn new(content: &str) -> ObjectString {
        Self::from_owned(content.to_string())
    }

    pub fn from_owned(content: String) -> ObjectString {
        let hash = hash_string(&content);
        ObjectString {
            object: Object::new(ObjectType::ObjString),
            content,
            hash,
        }
    }
}

/// FNV-1a.
pub fn hash_string(content: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in content.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Interning entry point for borrowed text. Returns the canonical string
/// object for `content`, allocating and registering one on first sight.
pub fn copy_string(
    object_manager: &mut ObjectManager,
    intern_strings: &mut Table,
    content: &str,
) -> *mut ObjectString {
    let hash = hash_string(content);
    if let Some(interned) = intern_strings.find_string(content, hash) {
        return interned;
    }
    let (string, _) = object_manager.alloc_string(content);
    intern_strings.set(string, make_nil_value());
    string
}

/// Interning entry point that adopts a caller-owned buffer. On an intern hit
/// the buffer is simply dropped.
pub fn take_string(
    object_manager: &mut ObjectManager,
    intern_strings: &mut Table,
    content: String,
) -> *mut ObjectString {
    let hash = hash_string(&content);
    if let Some(interned) = intern_strings.find_string(&content, hash) {
        return interned;
    }
    let (string, _) = object_manager.adopt_string(content);
    intern_strings.set(string, make_nil_value());
    string
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use super::ObjectString;

    impl Drop for ObjectString {
        fn drop(&mut self) {
            println!("drop object: type=ObjectString, content={}", self.content);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_content_sensitive() {
        assert_eq!(hash_string("init"), hash_string("init"));
        assert_ne!(hash_string("init"), hash_string("inis"));
        // FNV-1a offset basis for the empty string.
        assert_eq!(hash_string(""), 2166136261);
    }

    #[test]
    fn test_copy_string_is_idempotent() {
        let mut object_manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let first = copy_string(&mut object_manager, &mut intern_strings, "once");
        let bytes_after_first = object_manager.bytes_allocated();
        let second = copy_string(&mut object_manager, &mut intern_strings, "once");
        assert!(std::ptr::eq(first, second));
        assert_eq!(object_manager.bytes_allocated(), bytes_after_first);
        assert_eq!(intern_strings.len(), 1);
    }

    #[test]
    fn test_take_string_reuses_canonical_object() {
        let mut object_manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let copied = copy_string(&mut object_manager, &mut intern_strings, "shared");
        let taken = take_string(&mut object_manager, &mut intern_strings, String::from("shared"));
        assert!(std::ptr::eq(copied, taken));
        assert_eq!(intern_strings.len(), 1);
    }
}
