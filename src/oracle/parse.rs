//! 从判定器回复中提取 JSON
//!
//! 回复常混有解释文字：优先取 ```json 代码块，否则从第一个 `{` 或 `[` 开始做括号配对，
//! 配对时跳过字符串字面量里的括号与转义。

use serde::de::DeserializeOwned;

use crate::oracle::OracleError;

/// 提取第一段完整的 JSON 文本；找不到时返回 None
pub fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        if let Some(end) = body.find("```") {
            let inner = body[..end].trim();
            if !inner.is_empty() {
                return Some(inner);
            }
        }
    }

    let start = text.find(['{', '['])?;
    balanced_end(&text[start..]).map(|end| &text[start..start + end])
}

/// 返回与开头括号配对的结束位置（不含），未闭合时为 None
fn balanced_end(text: &str) -> Option<usize> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// 提取并反序列化
pub fn parse_block<T: DeserializeOwned>(text: &str) -> Result<T, OracleError> {
    let block = extract_json_block(text)
        .ok_or_else(|| OracleError::Malformed("no JSON block in reply".to_string()))?;
    serde_json::from_str(block).map_err(|e| OracleError::Malformed(e.to_string()))
}
