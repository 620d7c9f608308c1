use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use hypideas_types::events::ChangeEvent;
use hypideas_types::models::TypingIndicator;

/// Lifetime of a typing indicator row on the server.
pub const TYPING_EXPIRY_SECS: i64 = 10;
/// Minimum spacing between outgoing typing updates while keys keep coming.
pub const KEYSTROKE_DEBOUNCE: Duration = Duration::from_secs(1);
/// Idle time after the last keystroke before typing is cleared.
pub const STOP_AFTER: Duration = Duration::from_secs(3);
/// Re-announce typing before the server row expires.
pub const REFRESH_AFTER: Duration = Duration::from_secs(7);

/// Who else is typing in the open conversation or channel.
#[derive(Debug, Clone)]
pub struct TypingTracker {
    me: Uuid,
    typers: Vec<(Uuid, DateTime<Utc>)>,
}

impl TypingTracker {
    pub fn new(me: Uuid) -> Self {
        Self {
            me,
            typers: Vec::new(),
        }
    }

    pub fn apply(&mut self, event: ChangeEvent<TypingIndicator>) {
        match event {
            ChangeEvent::Insert(ind) | ChangeEvent::Update(ind) => {
                if ind.user_id == self.me {
                    return;
                }
                self.typers.retain(|(user, _)| *user != ind.user_id);
                if ind.is_typing {
                    self.typers.push((ind.user_id, ind.expires_at));
                }
            }
            ChangeEvent::Delete(key) => self.typers.retain(|(user, _)| *user != key.user_id),
        }
    }

    /// Users typing at `now`, in the order they started. Expired entries are
    /// never reported, even if their delete event never arrives.
    pub fn active(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.typers
            .iter()
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(user, _)| *user)
            .collect()
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.typers.retain(|(_, expires_at)| *expires_at > now);
    }

    pub fn clear(&mut self) {
        self.typers.clear();
    }

    /// One line for the typing bar, or `None` when nobody is typing.
    pub fn summary(&self, now: DateTime<Utc>, name: impl Fn(Uuid) -> String) -> Option<String> {
        let active = self.active(now);
        match active.as_slice() {
            [] => None,
            [a] => Some(format!("{} is typing", name(*a))),
            [a, b] => Some(format!("{} and {} are typing", name(*a), name(*b))),
            [a, rest @ ..] => Some(format!("{} and {} others are typing", name(*a), rest.len())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

/// Outgoing typing state for the local composer.
///
/// Feed it keystrokes and poll it periodically; each returned signal should
/// be written to the backend.
#[derive(Debug, Clone, Default)]
pub struct TypingDebouncer {
    announced_at: Option<Instant>,
    last_keystroke: Option<Instant>,
}

impl TypingDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        self.last_keystroke = Some(now);
        match self.announced_at {
            None => {
                self.announced_at = Some(now);
                Some(TypingSignal::Start)
            }
            Some(at) if now.duration_since(at) >= REFRESH_AFTER => {
                self.announced_at = Some(now);
                Some(TypingSignal::Start)
            }
            Some(_) => None,
        }
    }

    /// Emit `Stop` once the composer has been idle for [`STOP_AFTER`].
    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        let last = self.last_keystroke?;
        if self.announced_at.is_some() && now.duration_since(last) >= STOP_AFTER {
            self.reset();
            return Some(TypingSignal::Stop);
        }
        None
    }

    /// Sending a message clears typing immediately.
    pub fn on_send(&mut self) -> Option<TypingSignal> {
        let was_typing = self.is_typing();
        self.reset();
        was_typing.then_some(TypingSignal::Stop)
    }

    pub fn reset(&mut self) {
        self.announced_at = None;
        self.last_keystroke = None;
    }

    pub fn is_typing(&self) -> bool {
        self.announced_at.is_some()
    }

    /// Whether the last keystroke is recent enough to still count as
    /// composing, for callers that batch draft updates.
    pub fn is_composing(&self, now: Instant) -> bool {
        self.last_keystroke
            .is_some_and(|last| now.duration_since(last) < KEYSTROKE_DEBOUNCE)
    }
}
