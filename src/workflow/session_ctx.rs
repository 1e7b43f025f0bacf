//! 提交会话上下文
//!
//! 封装"谁在提交、是新建还是编辑哪一份"这一信息

use std::fmt::Display;

use crate::models::record::Owner;

/// 提交会话上下文
#[derive(Debug, Clone)]
pub struct SessionCtx {
    /// 已认证的所有者
    pub owner: Owner,

    /// 编辑模式下的目标记录
    pub edit_record_id: Option<String>,
}

impl SessionCtx {
    /// 新建模式
    pub fn new(owner: Owner) -> Self {
        Self {
            owner,
            edit_record_id: None,
        }
    }

    /// 编辑模式
    pub fn editing(owner: Owner, record_id: String) -> Self {
        Self {
            owner,
            edit_record_id: Some(record_id),
        }
    }

    pub fn is_edit_mode(&self) -> bool {
        self.edit_record_id.is_some()
    }
}

impl Display for SessionCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.edit_record_id {
            Some(id) => write!(f, "[用户 {} 编辑#{}]", self.owner, id),
            None => write!(f, "[用户 {} 新建]", self.owner),
        }
    }
}
