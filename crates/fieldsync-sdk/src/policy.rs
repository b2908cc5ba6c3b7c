//! 连通性策略模块
//!
//! 引擎不直接探测网络，每次操作前询问策略对象是否允许。
//! 宿主应用可按蜂窝/WiFi、省电模式、登录态等维度实现自己的策略。

use std::sync::atomic::{AtomicBool, Ordering};

use crate::remote::FetchScope;

/// 连通性策略
pub trait ConnectivityPolicy: Send + Sync {
    /// 当前是否允许推送记录
    fn should_push_observations(&self) -> bool;
    /// 当前是否允许推送附件
    fn should_push_attachments(&self) -> bool;
    /// 当前是否允许拉取某类资源
    fn should_fetch(&self, scope: FetchScope) -> bool;
    /// 登录态是否有效（失效时拉取调度整体停摆）
    fn is_authenticated(&self) -> bool;
}

/// 开关式默认策略
///
/// 各开关独立可变，供宿主在网络状态变化时翻转；也用于测试。
pub struct StaticConnectivityPolicy {
    push_observations: AtomicBool,
    push_attachments: AtomicBool,
    fetch: AtomicBool,
    authenticated: AtomicBool,
}

impl StaticConnectivityPolicy {
    pub fn new() -> Self {
        Self {
            push_observations: AtomicBool::new(true),
            push_attachments: AtomicBool::new(true),
            fetch: AtomicBool::new(true),
            authenticated: AtomicBool::new(true),
        }
    }

    pub fn set_push_observations(&self, allowed: bool) {
        self.push_observations.store(allowed, Ordering::SeqCst);
    }

    pub fn set_push_attachments(&self, allowed: bool) {
        self.push_attachments.store(allowed, Ordering::SeqCst);
    }

    pub fn set_fetch(&self, allowed: bool) {
        self.fetch.store(allowed, Ordering::SeqCst);
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }
}

impl Default for StaticConnectivityPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityPolicy for StaticConnectivityPolicy {
    fn should_push_observations(&self) -> bool {
        self.push_observations.load(Ordering::SeqCst)
    }

    fn should_push_attachments(&self) -> bool {
        self.push_attachments.load(Ordering::SeqCst)
    }

    fn should_fetch(&self, _scope: FetchScope) -> bool {
        self.fetch.load(Ordering::SeqCst)
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_policy_toggles() {
        let policy = StaticConnectivityPolicy::new();
        assert!(policy.should_push_observations());
        assert!(policy.should_fetch(FetchScope::Observations));

        policy.set_push_observations(false);
        policy.set_fetch(false);
        assert!(!policy.should_push_observations());
        assert!(!policy.should_fetch(FetchScope::Locations));
        // 附件开关独立
        assert!(policy.should_push_attachments());
    }
}
