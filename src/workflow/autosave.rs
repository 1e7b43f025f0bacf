//! 草稿自动保存 - 流程层
//!
//! 一个独立的 tokio 任务，通过无界通道接收命令：
//! - `Changed`：记下最新快照，安静期内没有新的变化才保存
//! - `Flush`：立即保存待保存的快照
//! - `Cancel`：丢弃待保存的快照（提交成功后使用，避免草稿被重新写回）
//! - `Shutdown`：保存待保存的快照后退出
//!
//! 保存失败只记录日志，不影响调用方。

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::record::{Owner, SchoolRecord, SubmissionMethod};
use crate::services::DraftService;

/// 待保存的草稿内容
#[derive(Debug, Clone, PartialEq)]
pub struct DraftSnapshot {
    pub method: SubmissionMethod,
    pub record: SchoolRecord,
    pub reviewed: bool,
    pub edit_record_id: Option<String>,
}

/// 自动保存命令
#[derive(Debug)]
pub enum AutosaveCommand {
    Changed(DraftSnapshot),
    /// 立即保存；回执为是否写入成功（没有待保存内容时为 false）
    Flush(oneshot::Sender<bool>),
    Cancel(oneshot::Sender<()>),
    Shutdown,
}

/// 自动保存任务的句柄
pub struct Autosaver {
    tx: mpsc::UnboundedSender<AutosaveCommand>,
    handle: JoinHandle<()>,
}

impl Autosaver {
    /// 为某个所有者启动自动保存任务
    pub fn spawn(drafts: DraftService, owner: Owner, quiet_period: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(drafts, owner, quiet_period, rx));
        Self { tx, handle }
    }

    /// 通知内容变化
    pub fn changed(&self, snapshot: DraftSnapshot) {
        self.send(AutosaveCommand::Changed(snapshot));
    }

    /// 立即保存并等待结果
    pub async fn flush(&self) -> bool {
        let (ack, done) = oneshot::channel();
        self.send(AutosaveCommand::Flush(ack));
        done.await.unwrap_or(false)
    }

    /// 丢弃待保存内容；返回时任务中没有进行中的保存
    pub async fn cancel(&self) {
        let (ack, done) = oneshot::channel();
        self.send(AutosaveCommand::Cancel(ack));
        let _ = done.await;
    }

    /// 保存待保存内容并结束任务
    pub async fn shutdown(self) {
        self.send(AutosaveCommand::Shutdown);
        if let Err(e) = self.handle.await {
            warn!("自动保存任务异常退出: {}", e);
        }
    }

    fn send(&self, command: AutosaveCommand) {
        if self.tx.send(command).is_err() {
            warn!("自动保存任务已停止，忽略命令");
        }
    }
}

async fn run(
    drafts: DraftService,
    owner: Owner,
    quiet_period: Duration,
    mut rx: mpsc::UnboundedReceiver<AutosaveCommand>,
) {
    let mut pending: Option<DraftSnapshot> = None;

    loop {
        let command = if pending.is_some() {
            tokio::select! {
                command = rx.recv() => command,
                _ = tokio::time::sleep(quiet_period) => {
                    save(&drafts, &owner, pending.take());
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match command {
            Some(AutosaveCommand::Changed(snapshot)) => pending = Some(snapshot),
            Some(AutosaveCommand::Flush(ack)) => {
                let saved = save(&drafts, &owner, pending.take());
                let _ = ack.send(saved);
            }
            Some(AutosaveCommand::Cancel(ack)) => {
                if pending.take().is_some() {
                    debug!("丢弃待保存的草稿: 用户 {}", owner);
                }
                let _ = ack.send(());
            }
            Some(AutosaveCommand::Shutdown) | None => {
                save(&drafts, &owner, pending.take());
                break;
            }
        }
    }

    debug!("自动保存任务结束: 用户 {}", owner);
}

fn save(drafts: &DraftService, owner: &Owner, snapshot: Option<DraftSnapshot>) -> bool {
    let Some(snapshot) = snapshot else {
        return false;
    };
    match drafts.save(
        owner,
        snapshot.method,
        &snapshot.record,
        snapshot.reviewed,
        snapshot.edit_record_id.as_deref(),
    ) {
        Ok(()) => true,
        Err(e) => {
            warn!("⚠️ 自动保存草稿失败: {}", e);
            false
        }
    }
}
