/// Identity health definitions for rotation decisions
use std::fmt;

/// Represents whether an identity may be handed out for a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityHealth {
    /// Trusted at full rate
    Healthy,

    /// Recovering from a burn; only used for single probe fetches
    Cooling,

    /// Recently tied to a ban signal; excluded until its cooldown elapses
    Burned,
}

impl IdentityHealth {
    /// Returns true if this identity can be picked by normal rotation
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Applies the outcome of a probe or regular fetch
    ///
    /// A cooling identity that succeeded is trusted again; one that failed
    /// softly goes straight back to burned. Healthy and burned identities are
    /// left alone because burning is decided by host ban detection.
    pub fn after_fetch(self, succeeded: bool) -> Self {
        match (self, succeeded) {
            (Self::Cooling, true) => Self::Healthy,
            (Self::Cooling, false) => Self::Burned,
            (other, _) => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Cooling => "cooling",
            Self::Burned => "burned",
        }
    }
}

impl fmt::Display for IdentityHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_healthy_is_trusted() {
        assert!(IdentityHealth::Healthy.is_trusted());
        assert!(!IdentityHealth::Cooling.is_trusted());
        assert!(!IdentityHealth::Burned.is_trusted());
    }

    #[test]
    fn test_probe_outcomes() {
        assert_eq!(
            IdentityHealth::Cooling.after_fetch(true),
            IdentityHealth::Healthy
        );
        assert_eq!(
            IdentityHealth::Cooling.after_fetch(false),
            IdentityHealth::Burned
        );
        assert_eq!(
            IdentityHealth::Healthy.after_fetch(false),
            IdentityHealth::Healthy
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(IdentityHealth::Burned.to_string(), "burned");
    }
}
