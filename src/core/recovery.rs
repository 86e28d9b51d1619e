//! 错误恢复策略
//!
//! 根据 CapabilityError 与副作用等级返回 RecoveryAction，供网关决定是退避重试还是让本步骤失败。

use std::time::Duration;

use crate::capability::{CapabilityError, SideEffect};
use crate::config::GatewaySection;

/// 网关层恢复动作
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待后重试同一调用
    RetryWithBackoff(Duration),
    /// 放弃本步骤；会话停留在上一个检查点
    FailStep,
}

/// 有界指数退避：delay = min(base * 2^attempt, max)
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from_config(&GatewaySection::default())
    }
}

impl RecoveryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(cfg: &GatewaySection) -> Self {
        Self::new(
            cfg.max_retries,
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// attempt 从 0 计数（第一次失败后 attempt = 0）
    pub fn handle(&self, err: &CapabilityError, side_effect: SideEffect, attempt: u32) -> RecoveryAction {
        if attempt >= self.max_retries {
            return RecoveryAction::FailStep;
        }
        match err {
            CapabilityError::Unavailable(_) => RecoveryAction::RetryWithBackoff(self.backoff(attempt)),
            // 超时后非幂等写入可能已生效，不在本地重试
            CapabilityError::Timeout(_) if side_effect != SideEffect::NonIdempotentWrite => {
                RecoveryAction::RetryWithBackoff(self.backoff(attempt))
            }
            _ => RecoveryAction::FailStep,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RecoveryPolicy {
        RecoveryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(350))
    }

    #[test]
    fn test_unavailable_retries_with_bounded_backoff() {
        let p = policy();
        let err = CapabilityError::Unavailable("oracle overloaded".into());
        assert_eq!(
            p.handle(&err, SideEffect::ReadOnly, 0),
            RecoveryAction::RetryWithBackoff(Duration::from_millis(100))
        );
        assert_eq!(
            p.handle(&err, SideEffect::ReadOnly, 1),
            RecoveryAction::RetryWithBackoff(Duration::from_millis(200))
        );
        assert_eq!(
            p.handle(&err, SideEffect::ReadOnly, 2),
            RecoveryAction::RetryWithBackoff(Duration::from_millis(350))
        );
        assert_eq!(p.handle(&err, SideEffect::ReadOnly, 3), RecoveryAction::FailStep);
    }

    #[test]
    fn test_timeout_not_retried_for_non_idempotent_write() {
        let p = policy();
        let err = CapabilityError::Timeout(Duration::from_secs(30));
        assert!(matches!(
            p.handle(&err, SideEffect::IdempotentWrite, 0),
            RecoveryAction::RetryWithBackoff(_)
        ));
        assert_eq!(
            p.handle(&err, SideEffect::NonIdempotentWrite, 0),
            RecoveryAction::FailStep
        );
    }

    #[test]
    fn test_permanent_errors_fail_step() {
        let p = policy();
        for err in [
            CapabilityError::InvalidArguments("missing part_number".into()),
            CapabilityError::NotFound("WO-404".into()),
            CapabilityError::Failed("insufficient stock".into()),
        ] {
            assert_eq!(p.handle(&err, SideEffect::ReadOnly, 0), RecoveryAction::FailStep);
        }
    }

    #[test]
    fn test_backoff_saturates() {
        let p = policy();
        assert_eq!(p.backoff(40), Duration::from_millis(350));
    }
}
