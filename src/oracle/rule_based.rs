//! 规则判定器
//!
//! 不依赖外部服务：关键词加权打分，按任务类型套用三步模板，再用工具类别推断依赖与优先级。
//! 也是 OracleAdapter 分解失败时的兜底。
//!
//! 打分规则：
//! - 基础分 1
//! - analyze/research +2，generate/create +2，multiple/batch +3，complex/detailed +2，automate/workflow +3
//! - 超过 20 个词 +2，超过 10 个词 +1
//! - 每种连接词 +1
//! - 收敛到 1..=10，达到阈值即需要分解

use std::collections::HashSet;

use async_trait::async_trait;

use crate::config::TaskSection;
use crate::model::{Complexity, ExecutionContext, Task, TodoDraft};
use crate::oracle::ComplexityOracle;
use crate::tools::{extract_file_path, infer_capabilities, GENERAL_CAPABILITY};

const SCORE_RULES: &[(&[&str], u8)] = &[
    (&["analyze", "analyse", "research", "分析", "研究"], 2),
    (&["generate", "create", "生成", "创建"], 2),
    (&["multiple", "batch", "多个", "批量"], 3),
    (&["complex", "detailed", "复杂", "详细"], 2),
    (&["automate", "workflow", "自动化", "工作流"], 3),
];

const CONNECTORS: &[&str] = &["and", "then", "after", "然后", "接着", "之后", "并且", "同时"];

const ACTION_WORDS: &[&str] = &[
    "analyze", "create", "generate", "search", "download", "upload", "process", "convert",
    "分析", "创建", "生成", "搜索", "下载", "上传", "处理", "转换",
];

/// 任务类型，决定分解模板
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Analysis,
    Creation,
    InformationGathering,
    DataProcessing,
    General,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Analysis => "analysis",
            TaskType::Creation => "creation",
            TaskType::InformationGathering => "information_gathering",
            TaskType::DataProcessing => "data_processing",
            TaskType::General => "general",
        }
    }
}

/// 小写文本 + 分词，用于关键词匹配
struct Lexicon {
    lower: String,
    words: HashSet<String>,
}

impl Lexicon {
    fn new(text: &str) -> Self {
        let lower = text.to_lowercase();
        let words = lower
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        Self { lower, words }
    }

    /// 英文按词（允许 analyzed / creating 这类变形），中文按子串
    fn mentions(&self, keyword: &str) -> bool {
        if keyword.is_ascii() {
            self.words.contains(keyword)
                || self
                    .words
                    .iter()
                    .any(|w| w.starts_with(keyword) && w.len() <= keyword.len() + 4)
        } else {
            self.lower.contains(keyword)
        }
    }

    fn mentions_any(&self, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| self.mentions(k))
    }
}

/// 规则判定器
#[derive(Debug, Clone)]
pub struct RuleBasedOracle {
    threshold: u8,
    max_steps: usize,
}

impl RuleBasedOracle {
    pub fn new(cfg: &TaskSection) -> Self {
        Self {
            threshold: cfg.complexity_threshold.clamp(1, 10),
            max_steps: cfg.max_todo_items.max(1),
        }
    }

    pub fn score(&self, query: &str) -> u8 {
        let lex = Lexicon::new(query);
        let mut score: u32 = 1;
        for (keywords, weight) in SCORE_RULES {
            if lex.mentions_any(keywords) {
                score += *weight as u32;
            }
        }

        let word_count = query.split_whitespace().count();
        if word_count > 20 {
            score += 2;
        } else if word_count > 10 {
            score += 1;
        }

        score += CONNECTORS.iter().filter(|c| lex.mentions(c)).count() as u32;
        score.clamp(1, 10) as u8
    }

    fn estimate_steps(&self, query: &str, score: u8) -> u32 {
        let lex = Lexicon::new(query);
        let actions = ACTION_WORDS.iter().filter(|w| lex.mentions(w)).count() as u32;
        let steps = (score as u32 / 2).max(1) + actions;
        steps.min(self.max_steps as u32)
    }

    pub fn classify_type(query: &str) -> TaskType {
        let lex = Lexicon::new(query);
        if lex.mentions_any(&["analyze", "analyse", "research", "compare", "分析", "研究", "对比"]) {
            TaskType::Analysis
        } else if lex.mentions_any(&["create", "generate", "write", "build", "创建", "生成", "编写"]) {
            TaskType::Creation
        } else if lex.mentions_any(&["search", "find", "collect", "lookup", "搜索", "查找", "收集"]) {
            TaskType::InformationGathering
        } else if lex.mentions_any(&["process", "convert", "transform", "clean", "处理", "转换", "清洗"]) {
            TaskType::DataProcessing
        } else {
            TaskType::General
        }
    }

    pub fn complexity(&self, query: &str) -> Complexity {
        let score = self.score(query);
        let estimated_steps = self.estimate_steps(query, score);
        let level = match score {
            0..=2 => "simple",
            3..=5 => "medium",
            _ => "high",
        };
        Complexity {
            score,
            needs_decomposition: score >= self.threshold,
            estimated_steps,
            required_capabilities: infer_capabilities(query),
            reasoning: format!(
                "Rule-based estimate: {} complexity (score {}), about {} step(s)",
                level, score, estimated_steps
            ),
        }
        .clamped()
    }

    /// 模板：(内容, 工具, 基础优先级, 预估秒数)
    fn template(kind: TaskType, query: &str) -> Vec<(String, Vec<&'static str>, i32, u64)> {
        match kind {
            TaskType::Analysis => {
                let first = match extract_file_path(query) {
                    Some(path) => (format!("Read {}", path), vec!["file_read"], 10, 60),
                    None => (
                        format!("Collect information related to \"{}\"", query),
                        vec!["web_search"],
                        10,
                        120,
                    ),
                };
                vec![
                    first,
                    ("Analyze the collected data".to_string(), vec!["data_processor"], 5, 180),
                    ("Write the analysis report".to_string(), vec!["file_write"], 0, 60),
                ]
            }
            TaskType::Creation => vec![
                (format!("Design the structure of \"{}\"", query), vec!["data_processor"], 10, 90),
                ("Create the base framework".to_string(), vec!["file_write"], 5, 120),
                ("Refine and save the final content".to_string(), vec!["file_write"], 0, 150),
            ],
            TaskType::InformationGathering => vec![
                (format!("Search for information about \"{}\"", query), vec!["web_search"], 10, 90),
                ("Organize and filter the information".to_string(), vec!["data_processor"], 5, 60),
                ("Save the organized information".to_string(), vec!["file_write"], 0, 30),
            ],
            TaskType::DataProcessing | TaskType::General => vec![
                (format!("Prepare to execute \"{}\"", query), vec!["data_processor"], 5, 60),
                ("Execute the main task".to_string(), vec!["system_command"], 10, 120),
                ("Finish and output the result".to_string(), vec!["file_write"], 0, 30),
            ],
        }
    }

    /// 写步骤依赖此前的读步骤，处理步骤依赖此前的读取/搜索步骤；没有命中的步骤依赖上一步
    fn infer_dependencies(steps: &[Vec<&str>]) -> Vec<Vec<usize>> {
        steps
            .iter()
            .enumerate()
            .map(|(i, tools)| {
                let mut deps: Vec<usize> = (0..i)
                    .filter(|&j| {
                        let earlier = &steps[j];
                        (tools.contains(&"file_write") && earlier.contains(&"file_read"))
                            || (tools.contains(&"data_processor")
                                && (earlier.contains(&"web_search") || earlier.contains(&"file_read")))
                    })
                    .collect();
                if deps.is_empty() && i > 0 {
                    deps.push(i - 1);
                }
                deps
            })
            .collect()
    }

    /// 只保留当前可用的能力；都不可用时退回 general_processor（可用时）
    fn available_tools(tools: &[&str], capabilities: &[String]) -> Vec<String> {
        let kept: Vec<String> = tools
            .iter()
            .filter(|t| capabilities.iter().any(|c| c == *t))
            .map(|t| t.to_string())
            .collect();
        if !kept.is_empty() {
            kept
        } else if capabilities.iter().any(|c| c == GENERAL_CAPABILITY) {
            vec![GENERAL_CAPABILITY.to_string()]
        } else {
            Vec::new()
        }
    }

    pub fn plan(&self, task: &Task, capabilities: &[String]) -> Vec<TodoDraft> {
        let kind = Self::classify_type(&task.query);
        let mut template = Self::template(kind, &task.query);
        template.truncate(self.max_steps);

        let tool_sets: Vec<Vec<&str>> = template.iter().map(|(_, tools, _, _)| tools.clone()).collect();
        let deps = Self::infer_dependencies(&tool_sets);

        template
            .into_iter()
            .zip(deps)
            .enumerate()
            .map(|(i, ((content, tools, base, secs), deps))| {
                let mut priority = base;
                if deps.is_empty() {
                    priority += 10;
                }
                if tools.iter().any(|t| *t == "file_read" || *t == "web_search") {
                    priority += 5;
                }
                if tools.contains(&"file_write") {
                    priority -= 5;
                }
                let mut draft = TodoDraft::new(content)
                    .depends_on(&deps)
                    .priority(priority);
                draft.key = Some(format!("step_{}", i + 1));
                draft.tools_needed = Self::available_tools(&tools, capabilities);
                draft.estimated_duration = Some(secs);
                draft
            })
            .collect()
    }
}

#[async_trait]
impl ComplexityOracle for RuleBasedOracle {
    async fn classify(&self, query: &str, _ctx: &ExecutionContext) -> Complexity {
        self.complexity(query)
    }

    async fn decompose(&self, task: &Task, capabilities: &[String], _ctx: &ExecutionContext) -> Vec<TodoDraft> {
        let drafts = self.plan(task, capabilities);
        tracing::debug!(
            task_id = %task.id,
            task_type = Self::classify_type(&task.query).as_str(),
            steps = drafts.len(),
            "rule-based decomposition"
        );
        drafts
    }

    fn name(&self) -> &str {
        "rule_based"
    }
}
