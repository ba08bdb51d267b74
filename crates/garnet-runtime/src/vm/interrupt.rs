//! Cooperative interrupts
//!
//! Any thread may post an interrupt through a cloned [`InterruptToken`].
//! The dispatch loop polls the token at branches and calls and hands a
//! pending interrupt to the VM's interrupt handler.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Kinds of interrupt a token can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// User asked to stop (e.g. Ctrl-C)
    Stop,
    /// A timer fired; the host may run deferred work
    Timer,
    /// Embedder-defined reason
    Custom(u8),
}

impl Interrupt {
    fn bit(self) -> u32 {
        match self {
            Interrupt::Stop => 1,
            Interrupt::Timer => 1 << 1,
            Interrupt::Custom(n) => 1 << (2 + (n as u32 % 30)),
        }
    }

    fn from_bit(bit: u32) -> Interrupt {
        match bit {
            1 => Interrupt::Stop,
            2 => Interrupt::Timer,
            other => Interrupt::Custom((other.trailing_zeros() - 2) as u8),
        }
    }
}

/// Shared handle to a set of pending interrupts.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    pending: Arc<AtomicU32>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post an interrupt. Safe to call from any thread.
    pub fn post(&self, interrupt: Interrupt) {
        self.pending.fetch_or(interrupt.bit(), Ordering::Release);
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Take the highest-priority pending interrupt.
    pub fn take(&self) -> Option<Interrupt> {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            let bit = current & current.wrapping_neg();
            match self.pending.compare_exchange_weak(
                current,
                current & !bit,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Interrupt::from_bit(bit)),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn clear(&self) {
        self.pending.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_take_in_priority_order() {
        let token = InterruptToken::new();
        let remote = token.clone();
        remote.post(Interrupt::Custom(3));
        remote.post(Interrupt::Stop);

        assert!(token.is_pending());
        assert_eq!(token.take(), Some(Interrupt::Stop));
        assert_eq!(token.take(), Some(Interrupt::Custom(3)));
        assert_eq!(token.take(), None);
        assert!(!token.is_pending());
    }

    #[test]
    fn test_post_from_another_thread() {
        let token = InterruptToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.post(Interrupt::Timer))
            .join()
            .unwrap();
        assert_eq!(token.take(), Some(Interrupt::Timer));
    }
}
