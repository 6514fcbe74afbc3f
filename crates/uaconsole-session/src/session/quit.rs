// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! External quit flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A settable flag observed by the monitoring loop at poll boundaries.
///
/// Clones share the flag. Raising it never wakes the controller; the next
/// poll tick sees it.
#[derive(Debug, Clone, Default)]
pub struct QuitSignal {
    raised: Arc<AtomicBool>,
}

impl QuitSignal {
    /// Creates a lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag.
    pub fn raise(&self) {
        if !self.raised.swap(true, Ordering::SeqCst) {
            tracing::debug!("Quit signal raised");
        }
    }

    /// Returns `true` once the flag was raised.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let signal = QuitSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_raised());

        signal.raise();
        signal.raise();
        assert!(observer.is_raised());
    }
}
