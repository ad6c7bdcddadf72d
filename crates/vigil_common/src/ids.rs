//! Process-local ID generation.
//!
//! IDs look like `chg-20250114093042-17`: a kind prefix, a UTC timestamp,
//! and a per-kind counter reduced mod 1000. They only need to be unique
//! within the process; stores key entries by the ID the caller inserted and
//! never regenerate them, so collisions across restarts are harmless.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

pub struct IdGenerator {
    prefix: &'static str,
    counter: AtomicU64,
}

impl IdGenerator {
    pub const fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "{}-{}-{}",
            self.prefix,
            Utc::now().format("%Y%m%d%H%M%S"),
            n % 1000
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix_and_counter() {
        static GEN: IdGenerator = IdGenerator::new("chg");
        let a = GEN.next();
        let b = GEN.next();
        assert!(a.starts_with("chg-"));
        assert!(a.ends_with("-1"));
        assert!(b.ends_with("-2"));
    }

    #[test]
    fn counter_wraps_at_one_thousand() {
        let gen = IdGenerator::new("evt");
        for _ in 0..1000 {
            gen.next();
        }
        assert!(gen.next().ends_with("-1"));
    }
}
