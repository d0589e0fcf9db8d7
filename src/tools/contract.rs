//! 工具契约
//!
//! 引擎只通过 `Tool` 与具体工具交互：definition 描述能力与安全属性，execute / execute_stream 执行，
//! initialize / cleanup / health_check 为可选生命周期钩子，缺省视为无需初始化且始终健康。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ExecutionContext;

/// 工具的静态描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// 可满足的能力名，供编排器按能力解析工具
    #[serde(default)]
    pub capability_tags: Vec<String>,
    pub is_concurrency_safe: bool,
    pub is_read_only: bool,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    /// 参数 JSON Schema
    #[serde(default)]
    pub parameters: Value,
}

impl ToolDefinition {
    /// 默认并发安全且只读
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            capability_tags: Vec::new(),
            is_concurrency_safe: true,
            is_read_only: true,
            required_permissions: Vec::new(),
            parameters: Value::Null,
        }
    }

    pub fn capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capability_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn concurrency_safe(mut self, safe: bool) -> Self {
        self.is_concurrency_safe = safe;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.is_read_only = read_only;
        self
    }

    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capability_tags.iter().any(|t| t == capability)
    }
}

/// 工具 trait：所有可被编排器调用的能力都实现此接口
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    fn name(&self) -> &str {
        &self.definition().name
    }

    /// 执行工具；Err 为面向用户的错误文本
    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<Value, String>;

    /// 流式执行，缺省只产出 execute 的单个结果
    fn execute_stream<'a>(
        &'a self,
        params: Value,
        ctx: &'a ExecutionContext,
    ) -> BoxStream<'a, Result<Value, String>> {
        Box::pin(stream::once(self.execute(params, ctx)))
    }

    async fn initialize(&self) -> Result<(), String> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), String> {
        Ok(())
    }

    /// Ok(false) 表示探测通过但不健康，Err 表示探测本身出错
    async fn health_check(&self) -> Result<bool, String> {
        Ok(true)
    }

    fn validate_parameters(&self, _params: &Value) -> Result<(), String> {
        Ok(())
    }

    /// 具体参数下是否可与其他调用并发
    fn is_concurrency_safe(&self, _params: &Value) -> bool {
        self.definition().is_concurrency_safe
    }

    fn estimate_execution_time(&self, _params: &Value) -> Duration {
        Duration::from_secs(1)
    }
}

/// 从参数对象里取字符串字段
pub fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}
