//! 进行中尝试的进程内跟踪
//!
//! 同一身份同时最多一次网络尝试：变更事件和定时器可能同时命中同一条
//! 记录，两个触发必须坍缩成一次网络调用。check-and-insert 在同一把锁
//! 下原子完成，不存在"两边都看到不在飞"的窗口。内容从不持久化，
//! 进程重启即清空（附件传输的跨重启识别靠落库的 transfer_task_id）。

use std::collections::HashSet;
use parking_lot::Mutex;

/// 在飞身份
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InFlightKey {
    Observation(i64),
    Attachment(i64),
    /// 附件传输关联 ID（跨进程重启识别后台传输）
    Transfer(String),
}

/// 进程内在飞集合
#[derive(Debug, Default)]
pub struct InFlightSet {
    keys: Mutex<HashSet<InFlightKey>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 原子 check-and-insert；已存在返回 false（调用方跳过本次触发）
    pub fn try_insert(&self, key: InFlightKey) -> bool {
        self.keys.lock().insert(key)
    }

    pub fn contains(&self, key: &InFlightKey) -> bool {
        self.keys.lock().contains(key)
    }

    pub fn remove(&self, key: &InFlightKey) {
        self.keys.lock().remove(key);
    }

    /// 当前在飞的传输数（附件批次排空判定用）
    pub fn transfer_count(&self) -> usize {
        self.keys
            .lock()
            .iter()
            .filter(|k| matches!(k, InFlightKey::Transfer(_)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    /// 清空（stop 时调用；不取消已提交的网络操作）
    pub fn clear(&self) {
        self.keys.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_try_insert_is_exclusive() {
        let set = InFlightSet::new();
        assert!(set.try_insert(InFlightKey::Observation(1)));
        assert!(!set.try_insert(InFlightKey::Observation(1)));
        // 不同身份互不影响
        assert!(set.try_insert(InFlightKey::Observation(2)));
        assert!(set.try_insert(InFlightKey::Attachment(1)));

        set.remove(&InFlightKey::Observation(1));
        assert!(set.try_insert(InFlightKey::Observation(1)));
    }

    #[test]
    fn test_transfer_count() {
        let set = InFlightSet::new();
        set.try_insert(InFlightKey::Transfer("t-1".into()));
        set.try_insert(InFlightKey::Transfer("t-2".into()));
        set.try_insert(InFlightKey::Attachment(9));
        assert_eq!(set.transfer_count(), 2);
        set.remove(&InFlightKey::Transfer("t-1".into()));
        assert_eq!(set.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_insert_single_winner() {
        let set = Arc::new(InFlightSet::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let set = set.clone();
            handles.push(tokio::spawn(async move {
                set.try_insert(InFlightKey::Observation(42))
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
