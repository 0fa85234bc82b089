use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

const CORRUPTION: u8 = 0b01;
const SECRET: u8 = 0b10;

/// Cumulative risk exposure of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaintState {
    /// The session has consumed untrusted input
    #[serde(default)]
    pub corruption: bool,
    /// The session has seen sensitive data
    #[serde(default)]
    pub secret: bool,
}

impl TaintState {
    pub const CLEAN: TaintState = TaintState {
        corruption: false,
        secret: false,
    };

    pub fn is_clean(&self) -> bool {
        !self.corruption && !self.secret
    }

    /// Both flags set: untrusted input and sensitive data in one session.
    pub fn is_dual(&self) -> bool {
        self.corruption && self.secret
    }

    fn bits(&self) -> u8 {
        (if self.corruption { CORRUPTION } else { 0 }) | (if self.secret { SECRET } else { 0 })
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            corruption: bits & CORRUPTION != 0,
            secret: bits & SECRET != 0,
        }
    }
}

impl std::fmt::Display for TaintState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.corruption, self.secret) {
            (false, false) => write!(f, "clean"),
            (true, false) => write!(f, "corruption"),
            (false, true) => write!(f, "secret"),
            (true, true) => write!(f, "corruption+secret"),
        }
    }
}

/// Session-owned taint bits. Flags can only be added.
#[derive(Debug, Default)]
pub struct TaintCell(AtomicU8);

impl TaintCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn get(&self) -> TaintState {
        TaintState::from_bits(self.0.load(Ordering::Acquire))
    }

    /// ORs `flags` in and returns the resulting state.
    pub fn mark(&self, flags: TaintState) -> TaintState {
        let previous = self.0.fetch_or(flags.bits(), Ordering::AcqRel);
        TaintState::from_bits(previous | flags.bits())
    }
}

/// Maps tool names seen in `tool_result` events to the taint they carry.
#[derive(Debug, Default)]
pub struct TaintRules {
    untrusted: HashSet<String>,
    sensitive: HashSet<String>,
}

impl TaintRules {
    pub fn new(untrusted: &[String], sensitive: &[String]) -> Self {
        Self {
            untrusted: untrusted.iter().cloned().collect(),
            sensitive: sensitive.iter().cloned().collect(),
        }
    }

    pub fn classify(&self, tool_name: &str) -> TaintState {
        TaintState {
            corruption: self.untrusted.contains(tool_name),
            secret: self.sensitive.contains(tool_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cell_is_clean() {
        let cell = TaintCell::new();
        assert!(cell.get().is_clean());
        assert_eq!(cell.get().to_string(), "clean");
    }

    #[test]
    fn test_mark_is_monotonic() {
        let cell = TaintCell::new();
        let after = cell.mark(TaintState {
            corruption: true,
            secret: false,
        });
        assert!(after.corruption && !after.secret);

        // Marking with nothing set never clears anything
        assert_eq!(cell.mark(TaintState::CLEAN), after);

        let after = cell.mark(TaintState {
            corruption: false,
            secret: true,
        });
        assert!(after.is_dual());
        assert_eq!(cell.get(), after);
        assert_eq!(after.to_string(), "corruption+secret");
    }

    #[test]
    fn test_cells_are_independent() {
        let a = TaintCell::new();
        let b = TaintCell::new();
        a.mark(TaintState {
            corruption: true,
            secret: true,
        });
        assert!(b.get().is_clean());
    }

    #[test]
    fn test_rules_classify_tools() {
        let rules = TaintRules::new(
            &["web_fetch".to_string()],
            &["read_secret".to_string(), "web_fetch".to_string()],
        );
        assert!(rules.classify("ls").is_clean());
        assert_eq!(
            rules.classify("read_secret"),
            TaintState {
                corruption: false,
                secret: true
            }
        );
        assert!(rules.classify("web_fetch").is_dual());
    }
}
