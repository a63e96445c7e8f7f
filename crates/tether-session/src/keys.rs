//! Session key generation.
//!
//! A key is the only thing a client needs to resume its session, so the
//! default generator draws 128 random bits. [`SeededKeys`] is for setups
//! that want reproducible keys derived from a seed through their own hash.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// Issues session keys. Keys must be non-empty and unique among live
/// sessions.
pub trait KeyGenerator: Send + Sync + 'static {
    fn generate(&self) -> String;
}

impl<F> KeyGenerator for F
where
    F: Fn() -> String + Send + Sync + 'static,
{
    fn generate(&self) -> String {
        self()
    }
}

/// 32 lowercase hex characters from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomKeys;

impl KeyGenerator for RandomKeys {
    fn generate(&self) -> String {
        let bytes: [u8; 16] = rand::rng().random();
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// `hash(seed + counter)` with a counter owned by the generator.
pub struct SeededKeys<H> {
    seed: String,
    counter: AtomicU64,
    hash: H,
}

impl<H> SeededKeys<H>
where
    H: Fn(&str) -> String + Send + Sync + 'static,
{
    pub fn new(seed: impl ToString, hash: H) -> Self {
        Self {
            seed: seed.to_string(),
            counter: AtomicU64::new(0),
            hash,
        }
    }
}

impl<H> KeyGenerator for SeededKeys<H>
where
    H: Fn(&str) -> String + Send + Sync + 'static,
{
    fn generate(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        (self.hash)(&format!("{}{n}", self.seed))
    }
}

impl<H> std::fmt::Debug for SeededKeys<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeededKeys")
            .field("counter", &self.counter.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
