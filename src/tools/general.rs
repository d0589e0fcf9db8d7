//! 通用处理工具
//!
//! general_processor 是能力推断的兜底：不访问外部资源，只回显步骤内容并附带当前时间，
//! 使简单查询在没有专用工具时也能走完整条执行链。

use async_trait::async_trait;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::model::ExecutionContext;
use crate::tools::schema::schema_value;
use crate::tools::{Tool, ToolDefinition};
use crate::tools::orchestrator::GENERAL_CAPABILITY;

#[derive(Debug, Deserialize, JsonSchema)]
struct GeneralParams {
    /// 步骤内容
    #[serde(default)]
    content: String,
    #[serde(default)]
    todo_id: Option<String>,
}

pub struct GeneralProcessorTool {
    def: ToolDefinition,
}

impl GeneralProcessorTool {
    pub fn new() -> Self {
        Self {
            def: ToolDefinition::new(
                GENERAL_CAPABILITY,
                "General processor: records the step content and the current time",
            )
            .capabilities([GENERAL_CAPABILITY, "general"])
            .parameters(schema_value::<GeneralParams>()),
        }
    }
}

impl Default for GeneralProcessorTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for GeneralProcessorTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<Value, String> {
        let args: GeneralParams = serde_json::from_value(params).map_err(|e| e.to_string())?;
        let text = if args.content.trim().is_empty() {
            "(empty)".to_string()
        } else {
            args.content
        };
        Ok(json!({
            "task_id": ctx.task_id,
            "todo_id": args.todo_id,
            "processed": text,
            "current_time": Utc::now().to_rfc3339(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echoes_content_with_time() {
        let tool = GeneralProcessorTool::new();
        let ctx = ExecutionContext::new("t1", ".");
        let out = tool
            .execute(json!({"content": "get the current time", "todo_id": "x"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["processed"], "get the current time");
        assert_eq!(out["task_id"], "t1");
        assert!(out["current_time"].as_str().is_some());

        let out = tool.execute(json!({}), &ctx).await.unwrap();
        assert_eq!(out["processed"], "(empty)");
    }
}
