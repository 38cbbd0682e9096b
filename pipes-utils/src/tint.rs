use std::sync::atomic::{AtomicU64, Ordering};

/// Issues correlation ids of the form `{name}-{pid}:{n}`.
///
/// One generator is owned by each broker instance; `n` starts at 1 and is never reused
/// for the lifetime of the generator.
#[derive(Debug)]
pub struct TintGenerator {
    name: String,
    pid: u32,
    counter: AtomicU64,
}

impl TintGenerator {
    #[inline]
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self::with_pid(name, std::process::id())
    }

    #[inline]
    pub fn with_pid<N: Into<String>>(name: N, pid: u32) -> Self {
        Self { name: name.into(), pid, counter: AtomicU64::new(0) }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn next_tint(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}:{}", self.name, self.pid, n)
    }

    /// Number of tints issued so far.
    #[inline]
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_tint_format() {
        let g = TintGenerator::with_pid("pipes", 42);
        assert_eq!(g.next_tint(), "pipes-42:1");
        assert_eq!(g.next_tint(), "pipes-42:2");
        assert_eq!(g.issued(), 2);
    }

    #[test]
    fn test_tint_unique_across_threads() {
        let g = Arc::new(TintGenerator::new("t"));
        let handles = (0..4)
            .map(|_| {
                let g = g.clone();
                std::thread::spawn(move || (0..250).map(|_| g.next_tint()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();
        let mut all = HashSet::new();
        for h in handles {
            for t in h.join().unwrap() {
                assert!(all.insert(t));
            }
        }
        assert_eq!(all.len(), 1000);
    }
}
