use std::time::{SystemTime, UNIX_EPOCH};

use crate::objects::object::NativeObject;
use crate::value::{make_number_value, Value};

/// `clock()` builtin: seconds since the epoch as a number.
pub struct ClockTime;

impl ClockTime {
    pub fn new() -> Self {
        ClockTime {}
    }
}

impl NativeObject for ClockTime {
    fn call(&self, _args: &[Value]) -> Result<Value, String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| "Time went backwards.".to_string())?;
        Ok(make_number_value(now.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{as_number, is_number};

    #[test]
    fn test_clock_returns_positive_seconds() {
        let clock = ClockTime::new();
        let value = clock.call(&[]).expect("clock should not fail");
        assert!(is_number(&value));
        assert!(as_number(&value) > 0.0);
    }
}
