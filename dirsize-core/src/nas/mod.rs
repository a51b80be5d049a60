//! Opaque, authenticated, rate-limited adapter to one NAS's versioned
//! RPC-style HTTP API.

mod client;
mod rate_limit;

pub use client::{BackgroundTask, DirSizeStatus, NasClient};
pub use rate_limit::RateLimiter;

/// Accepts the NAS's "finished" flag across every representation it has
/// been observed to send: bool, numeric, and string forms.
pub fn is_finished(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i == 1
            } else if let Some(f) = n.as_f64() {
                (f - 1.0).abs() < f64::EPSILON
            } else {
                false
            }
        }
        serde_json::Value::String(s) => {
            matches!(s.as_str(), "true" | "True" | "TRUE" | "1" | "yes")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_every_documented_truthy_form() {
        for v in [
            json!(true),
            json!("true"),
            json!("True"),
            json!("TRUE"),
            json!("1"),
            json!("yes"),
            json!(1),
            json!(1.0),
        ] {
            assert!(is_finished(&v), "expected {v:?} to be finished");
        }
    }

    #[test]
    fn rejects_every_documented_falsy_form() {
        for v in [
            json!(false),
            json!("false"),
            json!(0),
            serde_json::Value::Null,
            json!(""),
            json!(2),
            json!(-1),
        ] {
            assert!(!is_finished(&v), "expected {v:?} to not be finished");
        }
    }
}
