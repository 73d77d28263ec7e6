//! 研究生命周期事件
//!
//! 管线在研究状态变化时发布事件，Web层通过广播通道订阅实时流，
//! 同时保留一段有界历史供仪表盘查询。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::{broadcast, RwLock};

use crate::models::StudyStatus;

/// 事件中的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Created,
    Updated,
    Finalizing,
    Completed,
    Failed,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl From<StudyStatus> for LifecycleStatus {
    fn from(status: StudyStatus) -> Self {
        match status {
            StudyStatus::Active => Self::Updated,
            StudyStatus::Finalizing => Self::Finalizing,
            StudyStatus::Completed => Self::Completed,
            StudyStatus::Failed => Self::Failed,
        }
    }
}

/// 研究生命周期事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyEvent {
    pub study_uid: String,
    pub status: LifecycleStatus,
    pub timestamp: DateTime<Utc>,
    pub series_count: usize,
    pub instance_count: usize,
}

impl StudyEvent {
    pub fn new(
        study_uid: impl Into<String>,
        status: LifecycleStatus,
        series_count: usize,
        instance_count: usize,
    ) -> Self {
        Self {
            study_uid: study_uid.into(),
            status,
            timestamp: Utc::now(),
            series_count,
            instance_count,
        }
    }
}

/// 事件总线
///
/// 广播通道允许任意数量的订阅者；历史队列有界，旧事件被挤出。
/// 没有订阅者时发送会失败，这是正常情况，不作为错误处理。
pub struct EventBus {
    sender: broadcast::Sender<StudyEvent>,
    history: RwLock<VecDeque<StudyEvent>>,
    history_limit: usize,
}

impl EventBus {
    pub fn new(capacity: usize, history_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: RwLock::new(VecDeque::with_capacity(history_limit)),
            history_limit,
        }
    }

    /// 发布一条事件
    pub async fn emit(&self, event: StudyEvent) {
        tracing::debug!(
            study_uid = %event.study_uid,
            status = event.status.as_str(),
            "emitting lifecycle event"
        );
        {
            let mut history = self.history.write().await;
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.sender.send(event);
    }

    /// 订阅实时事件流
    pub fn subscribe(&self) -> broadcast::Receiver<StudyEvent> {
        self.sender.subscribe()
    }

    /// 最近的事件历史，从旧到新
    pub async fn recent(&self) -> Vec<StudyEvent> {
        self.history.read().await.iter().cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256, 512)
    }
}
