//! 脏数据变更通知类型
//!
//! StorageManager 在每次提交后，对命中"需要同步"谓词的行广播一条事件：
//! 记录要求 dirty == true，附件要求父记录关联存在（建表约束保证）。
//! 事件只携带身份，不携带负载——同一身份至少送达一次，协调器收到后
//! 必须重新读库取当前状态，把事件当幂等触发器用。

use serde::{Deserialize, Serialize};

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Inserted,
    Updated,
}

/// 受影响的实体身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEntity {
    Observation(i64),
    Attachment(i64),
}

/// 一次变更事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity: ChangeEntity,
}

impl ChangeEvent {
    pub fn inserted(entity: ChangeEntity) -> Self {
        Self {
            kind: ChangeKind::Inserted,
            entity,
        }
    }

    pub fn updated(entity: ChangeEntity) -> Self {
        Self {
            kind: ChangeKind::Updated,
            entity,
        }
    }
}
