//! Taskforge 命令行演示
//!
//! 用法：
//!   taskforge "<query>"            提交任务并打印事件流
//!   taskforge --resume <task_id>   从持久化状态恢复任务
//!   taskforge --status             打印引擎状态
//! 可用 --config <path> 追加配置文件。Ctrl+C 会暂停运行中的任务，之后可用 --resume 继续。

use std::path::PathBuf;

use anyhow::Context;
use futures_util::StreamExt;
use taskforge::{load_config, observability, TaskEngine, TaskResultStream};

enum Command {
    Run(String),
    Resume(String),
    Status,
}

fn parse_args() -> anyhow::Result<(Command, Option<PathBuf>)> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut command = None;
    let mut words = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(PathBuf::from(args.next().context("--config needs a path")?));
            }
            "--resume" => {
                command = Some(Command::Resume(args.next().context("--resume needs a task id")?));
            }
            "--status" => command = Some(Command::Status),
            _ => words.push(arg),
        }
    }

    let command = match command {
        Some(c) => c,
        None if !words.is_empty() => Command::Run(words.join(" ")),
        None => anyhow::bail!("usage: taskforge \"<query>\" | --resume <task_id> | --status"),
    };
    Ok((command, config_path))
}

async fn print_events(mut events: TaskResultStream) -> anyhow::Result<()> {
    while let Some(ev) = events.next().await {
        println!("{}", serde_json::to_string(&ev)?);
        if ev.is_terminal() {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let (command, config_path) = parse_args()?;
    let config = load_config(config_path).context("Failed to load config")?;
    let engine = TaskEngine::builder(config)
        .with_auto_flush(true)
        .build()
        .await
        .context("Failed to build task engine")?;
    engine.shutdown_manager().install_signal_handlers();

    match command {
        Command::Run(query) => print_events(engine.execute_task(&query, None).await).await?,
        Command::Resume(task_id) => print_events(engine.resume_task(&task_id).await).await?,
        Command::Status => {
            let status = engine.system_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    engine.shutdown().await;
    Ok(())
}
