use crate::chunk::Chunk;
use crate::objects::object::{Object, ObjectType};

#[repr(C)]
pub struct ObjectFunction {
    pub object: Object,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: String,
}

impl ObjectFunction {
    pub fn new(arity: u8, name: String) -> Self {
        ObjectFunction {
            object: Object::new(ObjectType::ObjFunction),
            arity,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use super::ObjectFunction;

    impl Drop for ObjectFunction {
        fn drop(&mut self) {
            println!("drop object: type=ObjectFunction, name={}", self.name);
        }
    }
}
