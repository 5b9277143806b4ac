//! Retry decisions for failed messages.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::{RetryOptions, RetryRule};

/// What to do with a message after its handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Put it back, visible again after the delay.
    Retry(Duration),
    /// Retries for this exception type are used up.
    Error,
    /// The message is already gone; nothing to undo.
    NoAction,
}

/// Per-exception-type retry delays.
///
/// The n-th failure of a type (1-based) is retried after the rule's n-th
/// delay. Once the delays run out the message moves to the error store.
#[derive(Debug, Clone)]
pub struct RetryTable {
    default: Vec<Duration>,
    exceptions: HashMap<String, Vec<Duration>>,
}

fn delays(rule: &RetryRule) -> Vec<Duration> {
    rule.delays_ms
        .iter()
        .map(|&ms| Duration::from_millis(ms))
        .collect()
}

impl RetryTable {
    pub fn from_options(options: &RetryOptions) -> Self {
        Self {
            default: delays(&options.default),
            exceptions: options
                .exceptions
                .iter()
                .map(|(name, rule)| (name.clone(), delays(rule)))
                .collect(),
        }
    }

    fn rule(&self, exception_type: &str) -> &[Duration] {
        self.exceptions
            .get(exception_type)
            .unwrap_or(&self.default)
    }

    pub fn max_retries(&self, exception_type: &str) -> u32 {
        self.rule(exception_type).len() as u32
    }

    /// Decide for the `count`-th recorded failure of `exception_type`.
    /// `None` means the message no longer exists.
    pub fn decide(&self, exception_type: &str, count: Option<u32>) -> Decision {
        let Some(count) = count else {
            return Decision::NoAction;
        };
        let rule = self.rule(exception_type);
        match count.checked_sub(1).and_then(|i| rule.get(i as usize)) {
            Some(&delay) => Decision::Retry(delay),
            None => Decision::Error,
        }
    }
}

impl Default for RetryTable {
    fn default() -> Self {
        Self::from_options(&RetryOptions::default())
    }
}
