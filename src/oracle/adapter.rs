//! 复杂度判定适配层
//!
//! ComplexityOracle 是引擎看到的接口，所有方法在边界上都不失败：
//! 判定失败时返回保守默认值，分解失败时退回规则判定器的三步模板。
//! OracleAdapter 把任意 OracleClient（文本进、文本出）包装成 ComplexityOracle。

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::config::TaskSection;
use crate::model::{Complexity, ExecutionContext, Task, TodoDraft, TodoItem};
use crate::oracle::schema::{ComplexityReply, DecompositionReply, RegenerationReply};
use crate::oracle::{parse_block, OracleClient, OracleError, RuleBasedOracle};
use crate::tools::schema_json;

#[async_trait]
pub trait ComplexityOracle: Send + Sync {
    /// 判定查询的复杂度
    async fn classify(&self, query: &str, ctx: &ExecutionContext) -> Complexity;

    /// 把任务拆成步骤草稿；`capabilities` 是当前可用的工具名与能力标签
    async fn decompose(&self, task: &Task, capabilities: &[String], ctx: &ExecutionContext) -> Vec<TodoDraft>;

    /// 为失败步骤生成替代步骤；None 表示不重新生成
    async fn regenerate(&self, _failed: &TodoItem, _error: &str, _capabilities: &[String]) -> Option<TodoDraft> {
        None
    }

    fn name(&self) -> &str {
        "oracle"
    }
}

const CLASSIFY_SYSTEM: &str = "You judge how complex a user request is for an automated task engine. \
Reply with a single JSON object and nothing else.";

const DECOMPOSE_SYSTEM: &str = "You break a user request into a small ordered list of executable steps. \
Each step should need one or two tools. Reply with a single JSON object and nothing else.";

const REGENERATE_SYSTEM: &str = "A step of a task failed. Propose one replacement step that avoids the failure, \
or return {\"step\": null} if the step should not be retried. Reply with JSON only.";

/// 文本判定器适配层
pub struct OracleAdapter<C: OracleClient> {
    client: C,
    fallback: RuleBasedOracle,
    max_steps: usize,
}

impl<C: OracleClient> OracleAdapter<C> {
    pub fn new(client: C, cfg: &TaskSection) -> Self {
        Self {
            client,
            fallback: RuleBasedOracle::new(cfg),
            max_steps: cfg.max_todo_items.max(1),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    async fn ask<T: DeserializeOwned>(&self, system: &str, prompt: &str) -> Result<T, OracleError> {
        let raw = self.client.complete(system, prompt).await?;
        parse_block(&raw)
    }

    fn classify_prompt(query: &str, ctx: &ExecutionContext) -> String {
        format!(
            "Request:\n{}\n\nWorking directory: {}\n\n\
             Score 1 (trivial, one tool call) to 10 (long multi-stage work). \
             Set needs_decomposition when more than one step is required.\n\n\
             Reply schema:\n{}",
            query,
            ctx.working_directory.display(),
            schema_json::<ComplexityReply>()
        )
    }

    fn decompose_prompt(&self, task: &Task, capabilities: &[String]) -> String {
        let hint = task
            .complexity
            .as_ref()
            .map(|c| format!("Estimated steps: {}\n", c.estimated_steps))
            .unwrap_or_default();
        let feedback = task
            .metadata
            .get("user_feedback")
            .and_then(|v| v.as_str())
            .map(|f| format!("User feedback on the previous plan: {}\n", f))
            .unwrap_or_default();
        format!(
            "Request:\n{}\n\n{}{}Available tools and capabilities: {}\n\
             Use at most {} steps. tools_needed must only contain names from the list above. \
             dependencies refer to earlier steps by zero-based index or by key.\n\n\
             Reply schema:\n{}",
            task.query,
            hint,
            feedback,
            capabilities.join(", "),
            self.max_steps,
            schema_json::<DecompositionReply>()
        )
    }
}

#[async_trait]
impl<C: OracleClient> ComplexityOracle for OracleAdapter<C> {
    async fn classify(&self, query: &str, ctx: &ExecutionContext) -> Complexity {
        let prompt = Self::classify_prompt(query, ctx);
        match self.ask::<ComplexityReply>(CLASSIFY_SYSTEM, &prompt).await {
            Ok(reply) => reply.into_complexity(),
            Err(e) => {
                tracing::warn!(oracle = %self.client.name(), error = %e, "complexity analysis failed, using conservative default");
                Complexity::conservative_default()
            }
        }
    }

    async fn decompose(&self, task: &Task, capabilities: &[String], ctx: &ExecutionContext) -> Vec<TodoDraft> {
        let prompt = self.decompose_prompt(task, capabilities);
        let parsed = self
            .ask::<DecompositionReply>(DECOMPOSE_SYSTEM, &prompt)
            .await
            .map(DecompositionReply::into_steps)
            .and_then(|steps| {
                if steps.is_empty() || steps.iter().any(|s| s.content.trim().is_empty()) {
                    Err(OracleError::Malformed("empty step list or step content".to_string()))
                } else {
                    Ok(steps)
                }
            });
        match parsed {
            Ok(steps) => steps,
            Err(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    oracle = %self.client.name(),
                    error = %e,
                    "decomposition failed, falling back to default plan"
                );
                self.fallback.decompose(task, capabilities, ctx).await
            }
        }
    }

    async fn regenerate(&self, failed: &TodoItem, error: &str, capabilities: &[String]) -> Option<TodoDraft> {
        let prompt = format!(
            "Failed step:\n{}\n\nTools it used: {}\nError: {}\nAvailable tools and capabilities: {}\n\n\
             Reply schema:\n{}",
            failed.content,
            failed.tools_needed.join(", "),
            error,
            capabilities.join(", "),
            schema_json::<RegenerationReply>()
        );
        match self.ask::<RegenerationReply>(REGENERATE_SYSTEM, &prompt).await {
            Ok(reply) => reply.into_step().filter(|s| !s.content.trim().is_empty()),
            Err(e) => {
                tracing::debug!(todo_id = %failed.id, error = %e, "step regeneration unavailable");
                None
            }
        }
    }

    fn name(&self) -> &str {
        self.client.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ScriptedOracleClient;

    fn adapter(replies: &[&str]) -> OracleAdapter<ScriptedOracleClient> {
        OracleAdapter::new(ScriptedOracleClient::new(replies.iter().copied()), &TaskSection::default())
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("t1", ".")
    }

    #[tokio::test]
    async fn test_classify_parses_and_clamps() {
        let oracle = adapter(&["Sure!\n```json\n{\"score\": 12, \"needs_decomposition\": true, \"estimated_steps\": 4}\n```"]);
        let c = oracle.classify("build a report", &ctx()).await;
        assert_eq!(c.score, 10);
        assert_eq!(c.estimated_steps, 4);

        let calls = oracle.client().calls().await;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.contains("build a report"));
        assert!(calls[0].1.contains("needs_decomposition"));
    }

    #[tokio::test]
    async fn test_classify_falls_back_on_garbage_or_error() {
        let oracle = adapter(&["I am not sure"]);
        assert_eq!(oracle.classify("x", &ctx()).await, Complexity::conservative_default());
        // 脚本耗尽后客户端返回 Unavailable
        assert_eq!(oracle.classify("x", &ctx()).await, Complexity::conservative_default());
    }

    #[tokio::test]
    async fn test_decompose_uses_reply_or_default_plan() {
        let oracle = adapter(&[
            r#"{"steps": [{"key": "a", "content": "fetch"}, {"content": "use", "dependencies": ["a"]}]}"#,
            "[]",
        ]);
        let task = Task::new("analyze data.csv");
        let caps = vec!["general_processor".to_string()];

        let steps = oracle.decompose(&task, &caps, &ctx()).await;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].content, "use");

        // 空步骤列表退回三步默认计划
        let steps = oracle.decompose(&task, &caps, &ctx()).await;
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].content, "Read data.csv");
    }

    #[tokio::test]
    async fn test_regenerate() {
        let oracle = adapter(&[r#"{"step": {"content": "read a smaller file"}}"#, r#"{"step": null}"#]);
        let failed = TodoItem::new("read huge.bin");
        let step = oracle.regenerate(&failed, "too large", &[]).await.unwrap();
        assert_eq!(step.content, "read a smaller file");
        assert!(oracle.regenerate(&failed, "too large", &[]).await.is_none());
        assert!(oracle.regenerate(&failed, "too large", &[]).await.is_none());
    }
}
