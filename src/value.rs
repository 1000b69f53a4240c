use crate::objects::{
    object::{Object, ObjectType},
    object_bound_method::ObjectBoundMethod,
    object_class::ObjectClass,
    object_closure::ObjectClosure,
    object_function::ObjectFunction,
    object_instance::ObjectInstance,
    object_manager::ObjectManager,
    object_native_function::ObjectNativeFunction,
    object_string::{self, ObjectString},
};
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    ValueNil,
    ValueBool,
    ValueNumber,
    ValueObject,
}

#[derive(Clone, Copy)]
pub union ValueUnion {
    pub boolean: bool,
    pub number: f64,
    pub object: *mut Object,
}

#[derive(Clone, Copy)]
pub struct Value {
    pub value_type: ValueType,
    pub value_as: ValueUnion,
}

pub type ValueArray = Vec<Value>;

impl Default for Value {
    fn default() -> Self {
        make_nil_value()
    }
}

pub fn make_nil_value() -> Value {
    Value {
        value_type: ValueType::ValueNil,
        value_as: ValueUnion { number: 0.0 },
    }
}

pub fn make_bool_value(boolean: bool) -> Value {
    Value {
        value_type: ValueType::ValueBool,
        value_as: ValueUnion { boolean },
    }
}

pub fn make_number_value(number: f64) -> Value {
    Value {
        value_type: ValueType::ValueNumber,
        value_as: ValueUnion { number },
    }
}

pub fn make_object_value(object: *mut Object) -> Value {
    Value {
        value_type: ValueType::ValueObject,
        value_as: ValueUnion { object },
    }
}

/// Interns `content` and wraps the canonical string object as a Value.
pub fn make_string_value(
    object_manager: &mut ObjectManager,
    intern_strings: &mut Table,
    content: &str,
) -> Value {
    let string = object_string::copy_string(object_manager, intern_strings, content);
    make_object_value(string as *mut Object)
}

pub fn is_nil(value: &Value) -> bool {
    value.value_type == ValueType::ValueNil
}

pub fn is_bool(value: &Value) -> bool {
    value.value_type == ValueType::ValueBool
}

pub fn is_number(value: &Value) -> bool {
    value.value_type == ValueType::ValueNumber
}

pub fn is_object(value: &Value) -> bool {
    value.value_type == ValueType::ValueObject
}

fn is_object_type(value: &Value, obj_type: ObjectType) -> bool {
    is_object(value) && unsafe { (*as_object(value)).obj_type } == obj_type
}

pub fn is_string(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjString)
}

pub fn is_function(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjFunction)
}

pub fn is_closure(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjClosure)
}

pub fn is_native_function(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjNativeFunction)
}

pub fn is_class(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjClass)
}

pub fn is_instance(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjInstance)
}

pub fn is_bound_method(value: &Value) -> bool {
    is_object_type(value, ObjectType::ObjBoundMethod)
}

pub fn as_bool(value: &Value) -> bool {
    debug_assert!(is_bool(value));
    unsafe { value.value_as.boolean }
}

pub fn as_number(value: &Value) -> f64 {
    debug_assert!(is_number(value));
    unsafe { value.value_as.number }
}

pub fn as_object(value: &Value) -> *mut Object {
    debug_assert!(is_object(value));
    unsafe { value.value_as.object }
}

pub fn as_string_object(value: &Value) -> *mut ObjectString {
    debug_assert!(is_string(value));
    as_object(value) as *mut ObjectString
}

pub fn as_function_object(value: &Value) -> *mut ObjectFunction {
    debug_assert!(is_function(value));
    as_object(value) as *mut ObjectFunction
}

pub fn as_closure_object(value: &Value) -> *mut ObjectClosure {
    debug_assert!(is_closure(value));
    as_object(value) as *mut ObjectClosure
}

pub fn as_native_function_object(value: &Value) -> *mut ObjectNativeFunction {
    debug_assert!(is_native_function(value));
    as_object(value) as *mut ObjectNativeFunction
}

pub fn as_class_object(value: &Value) -> *mut ObjectClass {
    debug_assert!(is_class(value));
    as_object(value) as *mut ObjectClass
}

pub fn as_instance_object(value: &Value) -> *mut ObjectInstance {
    debug_assert!(is_instance(value));
    as_object(value) as *mut ObjectInstance
}

pub fn as_bound_method_object(value: &Value) -> *mut ObjectBoundMethod {
    debug_assert!(is_bound_method(value));
    as_object(value) as *mut ObjectBoundMethod
}

// Strings compare by pointer too: interning guarantees equal contents share
// one canonical object.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        if self.value_type != other.value_type {
            return false;
        }
        match self.value_type {
            ValueType::ValueNil => true,
            ValueType::ValueBool => as_bool(self) == as_bool(other),
            ValueType::ValueNumber => as_number(self) == as_number(other),
            ValueType::ValueObject => std::ptr::eq(as_object(self), as_object(other)),
        }
    }
}

fn format_number(number: f64) -> String {
    if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        let formatted = format!("{:.10}", number);
        let formatted = formatted.trim_end_matches('0').trim_end_matches('.');
        formatted.to_string()
    }
}

fn format_function(function: *const ObjectFunction) -> String {
    let name = unsafe { (*function).name.as_str() };
    if name.is_empty() {
        "<script>".to_string()
    } else {
        format!("<fn {}>", name)
    }
}

unsafe fn format_object(object: *mut Object) -> String {
    match (*object).obj_type {
        ObjectType::ObjString => (*(object as *mut ObjectString)).content.clone(),
        ObjectType::ObjFunction => format_function(object as *const ObjectFunction),
        ObjectType::ObjNativeFunction => "<native fn>".to_string(),
        ObjectType::ObjClosure => format_function((*(object as *mut ObjectClosure)).function),
        ObjectType::ObjUpvalue => "upvalue".to_string(),
        ObjectType::ObjClass => (*(object as *mut ObjectClass)).name.clone(),
        ObjectType::ObjInstance => {
            let instance = object as *mut ObjectInstance;
            format!("{} instance", (*(*instance).class).name)
        }
        ObjectType::ObjBoundMethod => {
            let bound = object as *mut ObjectBoundMethod;
            format_function((*(*bound).method).function)
        }
    }
}

pub fn format_value(value: &Value) -> String {
    match value.value_type {
        ValueType::ValueNil => "nil".to_string(),
        ValueType::ValueBool => format!("{}", as_bool(value)),
        ValueType::ValueNumber => format_number(as_number(value)),
        ValueType::ValueObject => unsafe { format_object(as_object(value)) },
    }
}

pub fn print_value(value: &Value) {
    print!("{}", format_value(value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_equality() {
        assert!(make_nil_value() == make_nil_value());
        assert!(make_bool_value(true) == make_bool_value(true));
        assert!(make_bool_value(true) != make_bool_value(false));
        assert!(make_number_value(1.5) == make_number_value(1.5));
        assert!(make_number_value(1.0) != make_bool_value(true));
        assert!(make_nil_value() != make_bool_value(false));
    }

    #[test]
    fn test_nan_is_not_equal_to_itself() {
        let nan = make_number_value(f64::NAN);
        assert!(nan != nan);
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_value(&make_number_value(3.0)), "3");
        assert_eq!(format_value(&make_number_value(-7.0)), "-7");
        assert_eq!(format_value(&make_number_value(2.5)), "2.5");
        assert_eq!(format_value(&make_number_value(0.1)), "0.1");
    }

    #[test]
    fn test_interned_strings_compare_equal_by_pointer() {
        let mut object_manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let a = make_string_value(&mut object_manager, &mut intern_strings, "same");
        let b = make_string_value(&mut object_manager, &mut intern_strings, "same");
        let c = make_string_value(&mut object_manager, &mut intern_strings, "other");
        assert!(a == b);
        assert!(a != c);
    }
}
