//! 分解草稿与计划修改
//!
//! 判定器返回的步骤是 `TodoDraft`：依赖可以写成步骤下标，也可以写成步骤 key。
//! `into_todos` 统一分配 uuid 并把引用解析为 TodoItem id；越界或未知引用是 GraphError。

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::EngineError;
use crate::model::graph::{validate_todos, GraphError};
use crate::model::{Task, TaskStatus, TodoItem};

/// 对其它步骤的引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum DraftDependency {
    /// 步骤下标（从 0 开始）
    Index(usize),
    /// 步骤 key 或已有 TodoItem id
    Key(String),
}

/// 判定器给出的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TodoDraft {
    /// 可选的步骤 key，供其它步骤引用
    #[serde(default, alias = "id")]
    pub key: Option<String>,
    pub content: String,
    #[serde(default)]
    pub tools_needed: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    /// 预估耗时（秒）
    #[serde(default)]
    pub estimated_duration: Option<u64>,
    #[serde(default)]
    pub dependencies: Vec<DraftDependency>,
}

impl TodoDraft {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            key: None,
            content: content.into(),
            tools_needed: Vec::new(),
            priority: 0,
            estimated_duration: None,
            dependencies: Vec::new(),
        }
    }

    pub fn tools(mut self, tools: &[&str]) -> Self {
        self.tools_needed = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, indices: &[usize]) -> Self {
        self.dependencies = indices.iter().map(|i| DraftDependency::Index(*i)).collect();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// 把一组草稿转成 TodoItem；`existing` 是允许直接引用的已有 TodoItem id
    pub fn into_todos(drafts: Vec<TodoDraft>, existing: &[String]) -> Result<Vec<TodoItem>, GraphError> {
        let todos: Vec<TodoItem> = drafts
            .iter()
            .map(|d| {
                let mut t = TodoItem::new(d.content.clone()).with_priority(d.priority);
                t.tools_needed = d.tools_needed.clone();
                t.estimated_duration = d.estimated_duration;
                if let Some(key) = &d.key {
                    t.metadata
                        .insert("step_key".into(), serde_json::Value::String(key.clone()));
                }
                t
            })
            .collect();

        let keys: HashMap<&str, usize> = drafts
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.key.as_deref().map(|k| (k, i)))
            .collect();

        let mut resolved = Vec::with_capacity(todos.len());
        for (i, (draft, mut todo)) in drafts.iter().zip(todos.iter().cloned()).enumerate() {
            let mut deps = Vec::with_capacity(draft.dependencies.len());
            for dep in &draft.dependencies {
                let id = match dep {
                    DraftDependency::Index(idx) => todos.get(*idx).map(|t| t.id.clone()),
                    DraftDependency::Key(key) => match keys.get(key.as_str()) {
                        Some(idx) => Some(todos[*idx].id.clone()),
                        None => existing.iter().find(|e| *e == key).cloned(),
                    },
                };
                match id {
                    Some(id) => {
                        if !deps.contains(&id) {
                            deps.push(id);
                        }
                    }
                    None => {
                        return Err(GraphError::UnknownStepReference {
                            step: i,
                            reference: match dep {
                                DraftDependency::Index(idx) => idx.to_string(),
                                DraftDependency::Key(key) => key.clone(),
                            },
                        })
                    }
                }
            }
            todo.dependencies = deps;
            resolved.push(todo);
        }
        Ok(resolved)
    }
}

/// 对已有步骤的修改（只能修改仍为 Pending 的步骤）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepModification {
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub tools_needed: Option<Vec<String>>,
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
}

/// 用户 modify 响应中携带的计划修改
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanEdit {
    #[serde(default)]
    pub add_steps: Vec<TodoDraft>,
    #[serde(default)]
    pub modify_steps: Vec<StepModification>,
    #[serde(default)]
    pub remove_steps: Vec<String>,
}

impl PlanEdit {
    pub fn is_empty(&self) -> bool {
        self.add_steps.is_empty() && self.modify_steps.is_empty() && self.remove_steps.is_empty()
    }
}

impl Task {
    /// 应用计划修改；任何一步不合法则整体不生效
    pub fn apply_plan_edit(&mut self, edit: PlanEdit) -> Result<(), EngineError> {
        let mut todos = self.todo_list.clone();

        for id in &edit.remove_steps {
            let Some(pos) = todos.iter().position(|t| &t.id == id) else {
                return Err(EngineError::Validation(format!("Unknown step: {id}")));
            };
            if todos[pos].status != TaskStatus::Pending {
                return Err(EngineError::Validation(format!(
                    "Step {id} is {} and cannot be removed",
                    todos[pos].status
                )));
            }
            todos.remove(pos);
            for t in todos.iter_mut() {
                t.dependencies.retain(|d| d != id);
            }
        }

        for m in edit.modify_steps {
            let Some(todo) = todos.iter_mut().find(|t| t.id == m.id) else {
                return Err(EngineError::Validation(format!("Unknown step: {}", m.id)));
            };
            if todo.status != TaskStatus::Pending {
                return Err(EngineError::Validation(format!(
                    "Step {} is {} and cannot be modified",
                    m.id, todo.status
                )));
            }
            if let Some(content) = m.content {
                todo.content = content;
            }
            if let Some(priority) = m.priority {
                todo.priority = priority;
            }
            if let Some(tools) = m.tools_needed {
                todo.tools_needed = tools;
            }
            if let Some(deps) = m.dependencies {
                todo.dependencies = deps;
            }
        }

        if !edit.add_steps.is_empty() {
            let existing: Vec<String> = todos.iter().map(|t| t.id.clone()).collect();
            todos.extend(TodoDraft::into_todos(edit.add_steps, &existing)?);
        }

        validate_todos(&todos)?;
        self.todo_list = todos;
        self.update_status();
        Ok(())
    }
}
