// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// 结果字段最大长度（字符数），超长截断而非拒绝
pub const RESULT_MAX_LEN: usize = 65_536;

/// 错误字段最大长度（字符数）
pub const ERROR_MAX_LEN: usize = 2_048;

/// 任务创建时的初始进度
pub const PROGRESS_CREATED: i32 = 10;

/// 提供商调用开始时的进度
pub const PROGRESS_RUNNING: i32 = 20;

/// 任务完成时的进度
pub const PROGRESS_DONE: i32 = 100;

/// AI任务实体
///
/// 表示一个待执行的AI工作单元（翻译、批量翻译、格式化或内容生成）。
/// `prompt` 与 `provider` 在创建时写入且不再变更，崩溃恢复依赖这一点：
/// 恢复时无需从其他表重建请求内容。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// 任务唯一标识符
    pub id: Uuid,
    /// 所属租户（店铺/账户）ID，限流与恢复均按租户隔离
    pub tenant_id: Uuid,
    /// 任务类型，决定派发时的执行方式
    pub task_type: TaskType,
    /// 任务状态
    pub status: TaskStatus,
    /// 绑定的外部AI提供商键名，创建后不可变
    pub provider: String,
    /// 完整物化的请求文本，创建后不可变
    pub prompt: String,
    /// 调用方关联元数据，队列本身不解释其内容
    pub context: TaskContext,
    /// 进度 0-100，运行期间单调不减
    pub progress: i32,
    /// 已重试次数
    pub retry_count: i32,
    /// 最大重试次数
    pub max_retries: i32,
    /// 预估令牌数，供限流器的令牌预算使用
    pub estimated_tokens: i32,
    /// 提供商输出，超长截断
    pub result: Option<String>,
    /// 失败诊断信息，超长截断
    pub error: Option<String>,
    /// 最早可派发时间，重试退避持久化在此字段
    pub scheduled_at: Option<DateTime<FixedOffset>>,
    /// 创建时间
    pub created_at: DateTime<FixedOffset>,
    /// 最后更新时间，每次状态迁移都会刷新
    pub updated_at: DateTime<FixedOffset>,
    /// 终态时间（完成或失败）
    pub completed_at: Option<DateTime<FixedOffset>>,
    /// 过期时间，超过后不再参与恢复，等待外部清理作业删除
    pub expires_at: Option<DateTime<FixedOffset>>,
}

/// 任务类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// 单字段单语言翻译
    #[default]
    Translation,
    /// 批量翻译，一个任务扇出到多个目标语言
    TranslationBulk,
    /// 文本格式化
    Formatting,
    /// AI内容生成
    AiGeneration,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskType::Translation => write!(f, "translation"),
            TaskType::TranslationBulk => write!(f, "translation_bulk"),
            TaskType::Formatting => write!(f, "formatting"),
            TaskType::AiGeneration => write!(f, "ai_generation"),
        }
    }
}

impl FromStr for TaskType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "translation" => Ok(TaskType::Translation),
            "translation_bulk" => Ok(TaskType::TranslationBulk),
            "formatting" => Ok(TaskType::Formatting),
            "ai_generation" => Ok(TaskType::AiGeneration),
            _ => Err(()),
        }
    }
}

/// 任务状态枚举
///
/// 状态只向前推进：
/// Pending → Queued → Running → Completed/Failed
/// 唯一的例外是可重试的瞬时失败，Running 可退回 Queued。
/// 终态（Completed/Failed）不再发生任何迁移。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 已创建，等待调度器接收
    #[default]
    Pending,
    /// 已入队，等待限流器放行
    Queued,
    /// 正在调用提供商
    Running,
    /// 成功完成
    Completed,
    /// 已失败（终态错误或重试耗尽）
    Failed,
}

impl TaskStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 校验向目标状态的迁移是否合法
    ///
    /// 同状态迁移在非终态下视为合法：限流推迟与重试重排只更新
    /// scheduled_at，批量任务的进度推进只更新 progress，状态本身
    /// 不变。
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(next, TaskStatus::Queued | TaskStatus::Failed),
            TaskStatus::Queued => matches!(
                next,
                TaskStatus::Queued | TaskStatus::Running | TaskStatus::Failed
            ),
            TaskStatus::Running => matches!(
                next,
                TaskStatus::Running | TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Queued
            ),
            TaskStatus::Completed | TaskStatus::Failed => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(()),
        }
    }
}

/// 任务关联元数据
///
/// 按任务类型区分的标签联合，每种类型只携带它实际需要的关联字段。
/// 队列不解释这些内容，只原样持久化并随状态查询返回给调用方。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskContext {
    /// 单语言翻译
    Translation {
        resource_type: String,
        resource_id: String,
        resource_title: Option<String>,
        field_type: Option<String>,
        target_locale: String,
    },
    /// 批量翻译，一个任务覆盖多个目标语言
    TranslationBulk {
        resource_type: String,
        resource_id: String,
        resource_title: Option<String>,
        field_type: Option<String>,
        target_locales: Vec<String>,
    },
    /// 格式化
    Formatting {
        resource_type: String,
        resource_id: String,
        field_type: Option<String>,
    },
    /// 内容生成
    AiGeneration {
        resource_type: String,
        resource_id: String,
        resource_title: Option<String>,
    },
}

impl TaskContext {
    /// 批量翻译的目标语言列表；非批量任务返回空
    pub fn bulk_locales(&self) -> &[String] {
        match self {
            TaskContext::TranslationBulk { target_locales, .. } => target_locales,
            _ => &[],
        }
    }
}

impl Task {
    /// 创建一个新的AI任务
    ///
    /// # 参数
    ///
    /// * `tenant_id` - 所属租户ID
    /// * `task_type` - 任务类型
    /// * `provider` - 提供商键名
    /// * `prompt` - 完整请求文本
    /// * `estimated_tokens` - 预估令牌数
    /// * `context` - 调用方关联元数据
    /// * `retention` - 保留期，决定 expires_at
    ///
    /// # 返回值
    ///
    /// 返回状态为 Pending、进度为初始值的新任务
    pub fn new(
        tenant_id: Uuid,
        task_type: TaskType,
        provider: String,
        prompt: String,
        estimated_tokens: i32,
        context: TaskContext,
        retention: chrono::Duration,
    ) -> Self {
        let now: DateTime<FixedOffset> = Utc::now().into();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            task_type,
            status: TaskStatus::Pending,
            provider,
            prompt,
            context,
            progress: PROGRESS_CREATED,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            estimated_tokens,
            result: None,
            error: None,
            scheduled_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: Some(now + retention),
        }
    }

    /// 判断任务是否处于终态
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 判断任务是否还可重试
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 判断任务在给定时刻是否已过期
    pub fn is_expired(&self, now: DateTime<FixedOffset>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

/// 截断提供商输出到结果字段上限
///
/// 超长内容截断保存而不是拒绝整个结果。按字符边界截断，
/// 多字节文本不会被切到半个字符。
pub fn cap_result(text: &str) -> String {
    truncate_chars(text, RESULT_MAX_LEN)
}

/// 截断失败诊断到错误字段上限
pub fn cap_error(text: &str) -> String {
    truncate_chars(text, ERROR_MAX_LEN)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
