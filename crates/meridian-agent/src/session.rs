//! Session-key data model (spec §3): the bounded history tail,
//! preferences, and the admin rate-limit window, all owned by one session
//! key and mutated only at request boundaries.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// `(organization, user)` — the unit of serialization (spec §3 "Session
/// key").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub organization: String,
    pub user: String,
}

impl SessionKey {
    pub fn new(organization: impl Into<String>, user: impl Into<String>) -> Self {
        SessionKey { organization: organization.into(), user: user.into() }
    }

    pub fn as_actor_key(&self) -> String {
        format!("{}:{}", self.organization, self.user)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub user_message: String,
    pub assistant_text: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    pub response_language: String,
    pub first_interaction: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Preferences { response_language: "en".to_string(), first_interaction: true }
    }
}

fn response_language_pattern_ok(value: &str) -> bool {
    value.len() == 2 && value.bytes().all(|b| b.is_ascii_lowercase())
}

impl Preferences {
    pub fn validate(&self) -> Result<(), crate::error::AgentError> {
        if !response_language_pattern_ok(&self.response_language) {
            return Err(crate::error::AgentError::InvalidResponseLanguage { value: self.response_language.clone() });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub window_start_ms: u64,
    pub count: u32,
}

impl RateLimitWindow {
    /// Slides the window forward if `now_ms` has moved past
    /// `window_start_ms + window_ms`, then increments the count. Returns
    /// whether the request is within the allowed rate (spec §6 admin
    /// rate-limit knobs).
    pub fn admit(&mut self, now_ms: u64, window_ms: u64, max_requests: u32) -> bool {
        if now_ms.saturating_sub(self.window_start_ms) >= window_ms {
            self.window_start_ms = now_ms;
            self.count = 0;
        }
        self.count += 1;
        self.count <= max_requests
    }
}

/// Session state persisted per key (spec §3 "Session state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub history: VecDeque<Exchange>,
    pub history_capacity: usize,
    pub preferences: Preferences,
    pub rate_limit: RateLimitWindow,
}

impl SessionState {
    pub fn new(history_capacity: usize) -> Self {
        SessionState {
            history: VecDeque::new(),
            history_capacity,
            preferences: Preferences::default(),
            rate_limit: RateLimitWindow::default(),
        }
    }

    /// Appends one exchange, trimming to `history_capacity` (spec §4.8,
    /// §8 invariant `1 <= h <= S`).
    pub fn push_exchange(&mut self, exchange: Exchange) {
        self.history.push_back(exchange);
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
    }

    /// The last `n` exchanges turned into alternating user/assistant text
    /// messages, for the LM's message log (spec §8 scenario 6: history
    /// truncation).
    pub fn history_tail_as_messages(&self, n: usize) -> Vec<meridian_core::ChatMessage> {
        self.history
            .iter()
            .rev()
            .take(n)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .flat_map(|exchange| {
                vec![
                    meridian_core::ChatMessage::user_text(exchange.user_message.clone()),
                    meridian_core::ChatMessage::assistant_text(exchange.assistant_text.clone()),
                ]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_trimmed_to_capacity() {
        let mut state = SessionState::new(2);
        for i in 0..5 {
            state.push_exchange(Exchange { user_message: format!("u{i}"), assistant_text: format!("a{i}"), timestamp_ms: i });
        }
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history.front().unwrap().user_message, "u3");
    }

    #[test]
    fn history_tail_returns_alternating_messages_in_order() {
        let mut state = SessionState::new(50);
        for i in 0..10 {
            state.push_exchange(Exchange { user_message: format!("u{i}"), assistant_text: format!("a{i}"), timestamp_ms: i });
        }
        let tail = state.history_tail_as_messages(5);
        assert_eq!(tail.len(), 10);
        assert_eq!(tail[0].text_content(), "u5");
        assert_eq!(tail[9].text_content(), "a9");
    }

    #[test]
    fn response_language_must_be_two_lowercase_letters() {
        let mut prefs = Preferences::default();
        assert!(prefs.validate().is_ok());
        prefs.response_language = "EN".to_string();
        assert!(prefs.validate().is_err());
        prefs.response_language = "english".to_string();
        assert!(prefs.validate().is_err());
        prefs.response_language = "12".to_string();
        assert!(prefs.validate().is_err());
    }

    #[test]
    fn rate_limit_window_resets_after_the_window_elapses() {
        let mut window = RateLimitWindow::default();
        assert!(window.admit(0, 60_000, 2));
        assert!(window.admit(100, 60_000, 2));
        assert!(!window.admit(200, 60_000, 2));
        assert!(window.admit(61_000, 60_000, 2));
    }
}
