//! 判定器回复格式
//!
//! 这些类型的 JSON Schema 会拼进提示词，回复按同样的类型反序列化。
//! 字段尽量宽松：数字允许越界，步骤列表允许直接给数组。

use schemars::JsonSchema;
use serde::Deserialize;

use crate::model::{Complexity, TodoDraft};

/// 复杂度判定回复
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ComplexityReply {
    /// 复杂度评分，1 到 10
    #[serde(alias = "complexity_score")]
    pub score: i64,
    /// 是否需要拆成多个步骤
    #[serde(alias = "decompose")]
    pub needs_decomposition: bool,
    /// 预计步骤数
    #[serde(default)]
    pub estimated_steps: Option<i64>,
    /// 需要的能力，如 file_read、web_search
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl ComplexityReply {
    pub fn into_complexity(self) -> Complexity {
        let score = self.score.clamp(1, 10) as u8;
        let estimated_steps = self
            .estimated_steps
            .unwrap_or(if self.needs_decomposition { 3 } else { 1 })
            .clamp(1, u32::MAX as i64) as u32;
        Complexity {
            score,
            needs_decomposition: self.needs_decomposition,
            estimated_steps,
            required_capabilities: self.required_capabilities,
            reasoning: self.reasoning,
        }
        .clamped()
    }
}

/// 分解回复：`{"steps": [...]}` 或直接一个数组
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum DecompositionReply {
    Wrapped {
        #[serde(alias = "todos", alias = "todo_list")]
        steps: Vec<TodoDraft>,
    },
    Bare(Vec<TodoDraft>),
}

impl DecompositionReply {
    pub fn into_steps(self) -> Vec<TodoDraft> {
        match self {
            DecompositionReply::Wrapped { steps } | DecompositionReply::Bare(steps) => steps,
        }
    }
}

/// 失败步骤重新生成的回复；`step` 为 null 表示放弃
///
/// Bare 放在前面：缺失的 Option 字段会被当成 None，Wrapped 能匹配任意对象。
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RegenerationReply {
    Bare(TodoDraft),
    Wrapped { step: Option<TodoDraft> },
}

impl RegenerationReply {
    pub fn into_step(self) -> Option<TodoDraft> {
        match self {
            RegenerationReply::Wrapped { step } => step,
            RegenerationReply::Bare(step) => Some(step),
        }
    }
}
