use std::time::Duration;

/// Bounded, immediate re-attempts with one pause before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts including the first request.
    pub max_attempts: u32,
    /// Pause after the last failed attempt, before the error surfaces.
    pub final_delay: Duration,
}

impl RetryPolicy {
    /// Policy with `max_attempts` attempts and the standard one-second final pause.
    pub const fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            final_delay: Duration::from_secs(1),
        }
    }

    /// Conversation creation.
    pub const fn create_conversation() -> Self {
        Self::attempts(10)
    }

    /// Access token refresh for an existing conversation.
    pub const fn refresh_token() -> Self {
        Self::attempts(10)
    }

    /// Conversation history download.
    pub const fn fetch_history() -> Self {
        Self::attempts(10)
    }

    /// Conversation list download.
    pub const fn list_conversations() -> Self {
        Self::attempts(5)
    }

    /// Remote conversation deletion.
    pub const fn delete_conversation() -> Self {
        Self::attempts(3)
    }

    /// Image attachment upload.
    pub const fn upload_image() -> Self {
        Self::attempts(3)
    }

    /// Same budget, no final pause.
    pub const fn without_delay(self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            final_delay: Duration::ZERO,
        }
    }

    pub(crate) fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::attempts(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_match_operations() {
        assert_eq!(RetryPolicy::create_conversation().max_attempts, 10);
        assert_eq!(RetryPolicy::list_conversations().max_attempts, 5);
        assert_eq!(RetryPolicy::delete_conversation().max_attempts, 3);
        assert_eq!(RetryPolicy::upload_image().max_attempts, 3);
        assert_eq!(
            RetryPolicy::refresh_token().final_delay,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::attempts(0);
        assert_eq!(policy.effective_attempts(), 1);
        assert_eq!(policy.without_delay().final_delay, Duration::ZERO);
    }
}
