//! relay-runner - タスクサービスから起動され、1 つの instance を実行する
//!
//! 設定はすべて環境変数（`TASK_INSTANCE_ID`, `TASK_FUNCTION_NAME`,
//! `TASK_MANIFEST_PATH`, `SERVICE_API_URL`, `SERVICE_ACCESS_TOKEN`, ...）。
//! 実行できるタスクはこのバイナリの TaskRegistry に登録されたものだけ。

use std::convert::Infallible;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use relay_core::task_builder;
use relay_core::{Control, Runner, TaskError, TaskRegistry};

#[derive(Debug, Deserialize)]
struct AddArgs {
    a: f64,
    b: f64,
}

fn add(args: AddArgs) -> Result<f64, Infallible> {
    Ok(args.a + args.b)
}

#[derive(Debug, Deserialize)]
struct CountdownArgs {
    from: u32,
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    100
}

/// 1 ずつ数えながら progress を報告する。停止要求が来たら途中で止まる
fn countdown(tc: &Control, args: CountdownArgs) -> Result<u32, TaskError> {
    let total = args.from.max(1);
    for remaining in (0..args.from).rev() {
        if tc.should_stop() {
            tc.info("stop requested, giving up")?;
            return Err(TaskError::Cancelled {
                instance_id: tc.instance_id().to_string(),
            });
        }
        thread::sleep(Duration::from_millis(args.interval_ms));
        let done = args.from - remaining;
        tc.update_progress(
            f64::from(done) * 100.0 / f64::from(total),
            Some(&format!("{remaining} left")),
        )?;
    }
    tc.info("countdown finished")?;
    Ok(args.from)
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ValueError(String);

#[derive(Debug, Deserialize)]
struct FailArgs {
    #[serde(default)]
    message: Option<String>,
}

fn always_fail(args: FailArgs) -> Result<(), ValueError> {
    Err(ValueError(args.message.unwrap_or_else(|| "bad".into())))
}

fn registry() -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry.register(
        "demo::add",
        task_builder!(add)
            .doc("Adds two numbers.")
            .param::<f64>("a")
            .param::<f64>("b")
            .build(add)?,
    )?;
    registry.register(
        "demo::countdown",
        task_builder!(countdown)
            .doc("Counts down, reporting progress.")
            .param::<u32>("from")
            .param_with_default("interval_ms", default_interval_ms())
            .build_with_control(countdown)?,
    )?;
    registry.register(
        "demo::always_fail",
        task_builder!(always_fail)
            .param_with_default("message", None::<String>)
            .build(always_fail)?,
    )?;
    Ok(registry)
}

fn run() -> Result<i32> {
    let registry = registry().context("failed to register tasks")?;
    tracing::debug!(tasks = ?registry.symbols(), "task registry ready");

    // 設定の誤りも Runner が configuration エラーとして扱う
    let report = Runner::from_env(registry).run();
    Ok(report.exit_code())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("relay_core=info,relay_runner=info")),
        )
        .init();

    let code = run()?;
    std::process::exit(code);
}
