//! TodoItem 依赖图校验
//!
//! 在分解阶段校验：id 唯一、依赖都指向同一任务内的 TodoItem、不存在环。
//! 环用 DFS 检测并带出环路径；`topological_order` 用 Kahn 算法，同层按插入顺序稳定输出。

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::model::TodoItem;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate todo id: {0}")]
    DuplicateTodoId(String),

    #[error("Todo '{todo}' depends on unknown todo '{dependency}'")]
    DanglingDependency { todo: String, dependency: String },

    #[error("Cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Step {step} references unknown step '{reference}'")]
    UnknownStepReference { step: usize, reference: String },

    #[error("Plan has {count} steps, limit is {max}")]
    TooManySteps { count: usize, max: usize },
}

/// 校验整份 TodoList
pub fn validate_todos(todos: &[TodoItem]) -> Result<(), GraphError> {
    let mut ids = HashSet::new();
    for todo in todos {
        if !ids.insert(todo.id.as_str()) {
            return Err(GraphError::DuplicateTodoId(todo.id.clone()));
        }
    }

    for todo in todos {
        for dep in &todo.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(GraphError::DanglingDependency {
                    todo: todo.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(todos) {
        return Err(GraphError::CyclicDependency(cycle));
    }
    Ok(())
}

/// 第一个检测到的环，按插入顺序遍历保证结果确定
pub fn find_cycle(todos: &[TodoItem]) -> Option<Vec<String>> {
    let edges: HashMap<&str, &[String]> = todos
        .iter()
        .map(|t| (t.id.as_str(), t.dependencies.as_slice()))
        .collect();

    let mut visited = HashSet::new();
    let mut stack = Vec::new();
    for todo in todos {
        if !visited.contains(todo.id.as_str()) {
            if let Some(cycle) = dfs_cycle(todo.id.as_str(), &edges, &mut visited, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    stack.push(node);

    if let Some(&deps) = edges.get(node) {
        for dep in deps {
            let dep = dep.as_str();
            if let Some(pos) = stack.iter().position(|n| *n == dep) {
                let mut cycle: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
            // 悬空依赖由 validate_todos 单独报告
            if edges.contains_key(dep) && !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, edges, visited, stack) {
                    return Some(cycle);
                }
            }
        }
    }

    stack.pop();
    None
}

/// 依赖优先的执行顺序（Kahn），同层保持插入顺序
pub fn topological_order(todos: &[TodoItem]) -> Result<Vec<String>, GraphError> {
    validate_todos(todos)?;

    let position: HashMap<&str, usize> = todos
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let mut in_degree: HashMap<&str, usize> = todos
        .iter()
        .map(|t| (t.id.as_str(), t.dependencies.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for t in todos {
        for dep in &t.dependencies {
            dependents.entry(dep.as_str()).or_default().push(t.id.as_str());
        }
    }

    let mut current: Vec<&str> = todos
        .iter()
        .filter(|t| t.dependencies.is_empty())
        .map(|t| t.id.as_str())
        .collect();
    let mut order = Vec::with_capacity(todos.len());

    while !current.is_empty() {
        let mut next = Vec::new();
        for id in &current {
            order.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        next.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
        current = next;
    }

    if order.len() != todos.len() {
        let stuck = todos
            .iter()
            .filter(|t| !order.contains(&t.id))
            .map(|t| t.id.clone())
            .collect();
        return Err(GraphError::CyclicDependency(stuck));
    }
    Ok(order)
}
