/// Hard cap on agent attempts per stage quality loop.
pub const MAX_QA_ATTEMPTS: u32 = 3;

/// Best-of-three results scoring below this escalate to an operator.
pub const MIN_SCORE_THRESHOLD: u8 = 40;

pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_CRITIC_TIMEOUT_SECS: u64 = 300;

/// Environment variable that overrides the directory holding `config.json`.
pub const CONFIG_DIR_ENV: &str = "REELRS_HOME";
pub const DEFAULT_CONFIG_DIR: &str = ".reelrs";

/// Whether a best-of-three score is too weak to proceed without an operator.
pub fn needs_escalation(score: u8) -> bool {
    score < MIN_SCORE_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_strict() {
        assert!(needs_escalation(39));
        assert!(!needs_escalation(40));
        assert!(!needs_escalation(100));
        assert!(needs_escalation(0));
    }
}
