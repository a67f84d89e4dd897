//! Monotonic message id generation.

use std::sync::Mutex;

use uuid::Uuid;

/// Generates unique, time-ordered message ids.
///
/// Ids are UUID v7 values rendered in the 32-character simple form, so
/// their lexicographic order matches creation order. A guard on the last
/// issued value keeps ids strictly increasing even when the clock ties or
/// steps backwards within the process.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    last: Mutex<Uuid>,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn generate(&self) -> String {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let candidate = Uuid::now_v7();
        let next = if candidate > *last {
            candidate
        } else {
            Uuid::from_u128(last.as_u128().wrapping_add(1))
        };
        *last = next;
        next.as_simple().to_string()
    }
}
