//! 沙箱文件读写工具
//!
//! SafeFs 绑定根目录（每次调用取 ExecutionContext.working_directory），所有路径必须落在根下，禁止 ../ 逃逸；
//! FileReadTool / FileWriteTool 基于 SafeFs 提供 file_read / file_write 能力。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::EngineError;
use crate::model::ExecutionContext;
use crate::tools::schema::schema_value;
use crate::tools::{Tool, ToolDefinition};

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 已存在路径：规范化后必须在根下
    pub fn resolve(&self, path: &str) -> Result<PathBuf, EngineError> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| EngineError::FileSystem(format!("file not found: {}", path)))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(EngineError::PermissionDenied(format!("path escapes workspace: {}", path))) // 如 ../../etc/passwd
        }
    }

    /// 待写入路径：可以不存在，但不能是绝对路径或含 `..`
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, EngineError> {
        let rel = Path::new(path.trim_start_matches("./"));
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || rel.as_os_str().is_empty() {
            return Err(EngineError::PermissionDenied(format!(
                "path escapes workspace: {}",
                path
            )));
        }
        Ok(self.root_dir.join(rel))
    }

    pub async fn read_file(&self, path: &str, max_bytes: Option<usize>) -> Result<String, EngineError> {
        let resolved = self.resolve(path)?;
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| EngineError::FileSystem(format!("read failed: {}", e)))?;
        let limit = max_bytes.unwrap_or(bytes.len()).min(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..limit]).into_owned())
    }

    pub async fn write_file(&self, path: &str, content: &str, append: bool) -> Result<PathBuf, EngineError> {
        let target = self.resolve_for_write(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::FileSystem(format!("create directory failed: {}", e)))?;
        }
        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .await
                .map_err(|e| EngineError::FileSystem(format!("open failed: {}", e)))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| EngineError::FileSystem(format!("write failed: {}", e)))?;
        } else {
            tokio::fs::write(&target, content)
                .await
                .map_err(|e| EngineError::FileSystem(format!("write failed: {}", e)))?;
        }
        Ok(target)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FileReadParams {
    /// 相对工作目录的文件路径
    file_path: String,
    /// 最多读取的字节数
    #[serde(default)]
    max_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FileWriteParams {
    /// 相对工作目录的输出路径
    file_path: String,
    content: String,
    #[serde(default)]
    append: bool,
}

/// 读取工作目录下的文件
pub struct FileReadTool {
    def: ToolDefinition,
}

impl FileReadTool {
    pub fn new() -> Self {
        Self {
            def: ToolDefinition::new("file_read", "Read a text file from the working directory")
                .capabilities(["file_read", "read"])
                .parameters(schema_value::<FileReadParams>()),
        }
    }
}

impl Default for FileReadTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    fn validate_parameters(&self, params: &Value) -> Result<(), String> {
        serde_json::from_value::<FileReadParams>(params.clone())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<Value, String> {
        let args: FileReadParams = serde_json::from_value(params).map_err(|e| e.to_string())?;
        tracing::info!(path = %args.file_path, "file_read tool execute");
        let fs = SafeFs::new(&ctx.working_directory);
        let content = fs
            .read_file(&args.file_path, args.max_bytes)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({
            "file_path": args.file_path,
            "size": content.len(),
            "content": content,
        }))
    }
}

/// 写入工作目录下的文件；需要 file_write 权限，不可并发
pub struct FileWriteTool {
    def: ToolDefinition,
}

impl FileWriteTool {
    pub fn new() -> Self {
        Self {
            def: ToolDefinition::new("file_write", "Write or append text to a file in the working directory")
                .capabilities(["file_write", "write", "save"])
                .concurrency_safe(false)
                .read_only(false)
                .permissions(["file_write"])
                .parameters(schema_value::<FileWriteParams>()),
        }
    }
}

impl Default for FileWriteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    fn validate_parameters(&self, params: &Value) -> Result<(), String> {
        serde_json::from_value::<FileWriteParams>(params.clone())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> Result<Value, String> {
        let args: FileWriteParams = serde_json::from_value(params).map_err(|e| e.to_string())?;
        tracing::info!(path = %args.file_path, append = args.append, "file_write tool execute");
        let fs = SafeFs::new(&ctx.working_directory);
        fs.write_file(&args.file_path, &args.content, args.append)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({
            "file_path": args.file_path,
            "bytes_written": args.content.len(),
        }))
    }
}
