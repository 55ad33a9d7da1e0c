//! 图片上传入队服务
//!
//! 读取一份存储事件文档（文件或标准输入），处理后把结果 JSON 打印到标准输出。

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use image_ingest::orchestrator::{IngestOrchestrator, IngestResult, status};
use image_ingest::storage::S3ObjectStore;
use relay_shared::config::AppConfig;
use relay_shared::observability;
use relay_shared::queue::SqsQueue;
use tracing::{error, info};

const SERVICE_NAME: &str = "image-ingest";

#[derive(Debug, Parser)]
#[command(name = SERVICE_NAME, about = "Publish image upload notifications to the durable queue")]
struct Args {
    /// 存储事件文档路径，省略时从标准输入读取
    #[arg(short, long)]
    event: Option<PathBuf>,

    /// 以缩进格式输出结果
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let result = match run(&args).await {
        Ok(result) => result,
        Err(e) => failure_result(&e),
    };

    let output = if args.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{output}");

    Ok(if result.status == status::INVOCATION_FAILED {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// 调用失败时的结果
///
/// 配置加载可能早于日志初始化，错误同时写到标准错误。
fn failure_result(e: &anyhow::Error) -> IngestResult {
    eprintln!("{SERVICE_NAME}: {e:#}");
    error!(error = %e, "入队调用失败");
    IngestResult::invocation_failure(format!("Ingest execution failed: {e:#}"))
}

async fn run(args: &Args) -> Result<IngestResult> {
    let config = AppConfig::load(SERVICE_NAME)?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;
    config.validate()?;

    info!(environment = %config.environment, queue_url = %config.queue.url, "Starting image-ingest...");

    let raw = read_event(args.event.as_ref())?;

    let sdk_config = aws_config::load_from_env().await;
    let store = Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(&sdk_config)));
    let queue = Arc::new(SqsQueue::new(
        aws_sdk_sqs::Client::new(&sdk_config),
        config.queue.url.clone(),
    ));

    let orchestrator = IngestOrchestrator::from_config(&config, store, queue);
    Ok(orchestrator.handle_document(&raw).await)
}

fn read_event(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("无法读取事件文件 {}", path.display())),
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("无法从标准输入读取事件")?;
            Ok(raw)
        }
    }
}
