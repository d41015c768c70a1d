// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Statistics exposed to the collecting system.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing count of measurements forwarded to the sink.
///
/// Shared between concurrent notification callbacks; all updates are atomic.
#[derive(Debug, Default)]
pub struct ReceivedCounter {
    count: AtomicU64,
}

impl ReceivedCounter {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` and returns the new total.
    #[inline]
    pub fn add(&self, n: u64) -> u64 {
        self.count.fetch_add(n, Ordering::Relaxed) + n
    }

    /// Returns the current total.
    #[inline]
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Formats the one-line status polled by the host.
///
/// The count is grouped in thousands and the text is centered in a field of
/// `max_len` characters, truncated when it does not fit.
pub fn short_status(received: u64, max_len: usize) -> String {
    let status = format!("Total sent measurements {}", group_thousands(received));
    let len = status.chars().count();
    if len >= max_len {
        return status.chars().take(max_len).collect();
    }
    let left = (max_len - len) / 2;
    let right = max_len - len - left;
    format!("{}{status}{}", " ".repeat(left), " ".repeat(right))
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_add() {
        let counter = ReceivedCounter::new();
        assert_eq!(counter.add(3), 3);
        assert_eq!(counter.add(0), 3);
        assert_eq!(counter.add(2), 5);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_counter_concurrent() {
        let counter = Arc::new(ReceivedCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.add(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn test_short_status() {
        assert_eq!(short_status(42, 26), "Total sent measurements 42");
        assert_eq!(short_status(42, 5), "Total");
        assert_eq!(short_status(42, 30), "  Total sent measurements 42  ");
        assert_eq!(short_status(42, 29).len(), 29);
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }
}
