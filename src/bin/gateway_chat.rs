//! gateway-chat — 用网关配置对单个 provider 跑一轮对话，逐行输出 JSON 事件
//!
//! Usage:
//!   gateway-chat --config <path> --provider <identity> [OPTIONS] <prompt>
//!
//! Each `StreamEvent` is printed to stdout as one JSON line, followed by a
//! summary line for the final outcome. Ctrl-C cancels the turn.

use std::path::PathBuf;

use ai_lib_gateway::{ChatTurnRequest, FinalOutcome, Gateway, Message};
use anyhow::{anyhow, bail, Context};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

struct Args {
    config: PathBuf,
    provider: String,
    conversation: String,
    caller: String,
    system: Option<String>,
    model: Option<String>,
    no_stream: bool,
    prompt: String,
}

fn print_usage() {
    println!(
        r#"gateway-chat — run one chat turn through the gateway

USAGE:
    gateway-chat --config <path> --provider <identity> [OPTIONS] <prompt>

OPTIONS:
    --config <path>           Gateway config file (YAML or JSON)
    --provider <identity>     Provider identity from the config
    --conversation <id>       Conversation id (default: random)
    --caller <key>            Caller key for rate limiting (default: cli)
    --system <text>           System prompt
    --model <name>            Model override
    --no-stream               Use a non-streaming turn
    -h, --help                Show this help message

ENVIRONMENT:
    RUST_LOG                  Log filter (default: warn)"#
    );
}

fn parse_args(raw: &[String]) -> anyhow::Result<Option<Args>> {
    let mut config = None;
    let mut provider = None;
    let mut conversation = None;
    let mut caller = None;
    let mut system = None;
    let mut model = None;
    let mut no_stream = false;
    let mut prompt = Vec::new();

    let mut it = raw.iter();
    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next()
                .cloned()
                .ok_or_else(|| anyhow!("{name} needs a value"))
        };
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--config" => config = Some(PathBuf::from(value("--config")?)),
            "--provider" => provider = Some(value("--provider")?),
            "--conversation" => conversation = Some(value("--conversation")?),
            "--caller" => caller = Some(value("--caller")?),
            "--system" => system = Some(value("--system")?),
            "--model" => model = Some(value("--model")?),
            "--no-stream" => no_stream = true,
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            word => prompt.push(word.to_string()),
        }
    }

    if prompt.is_empty() {
        bail!("missing prompt");
    }
    Ok(Some(Args {
        config: config.ok_or_else(|| anyhow!("--config is required"))?,
        provider: provider.ok_or_else(|| anyhow!("--provider is required"))?,
        conversation: conversation.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        caller: caller.unwrap_or_else(|| "cli".to_string()),
        system,
        model,
        no_stream,
        prompt: prompt.join(" "),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(Some(args)) => args,
        Ok(None) => {
            print_usage();
            return Ok(());
        }
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            print_usage();
            std::process::exit(2);
        }
    };

    let gateway = Gateway::builder()
        .config_path(&args.config)
        .build()
        .with_context(|| format!("loading {}", args.config.display()))?;

    let mut messages = Vec::new();
    if let Some(system) = args.system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(args.prompt));

    let mut request = ChatTurnRequest::new(args.conversation, args.caller, args.provider, messages)
        .streaming(!args.no_stream);
    if let Some(model) = args.model {
        request = request.model(model);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (mut events, turn) = gateway.spawn_turn(request, cancel, 64);
    while let Some(event) = events.recv().await {
        println!("{}", serde_json::to_string(&event)?);
    }
    let outcome = turn.await.context("turn task failed")?;

    let summary = match &outcome {
        FinalOutcome::Completed(message) => json!({
            "outcome": "completed",
            "finish_reason": message.finish_reason,
            "chars": message.content.chars().count(),
            "provider_session_id": message.provider_session_id,
        }),
        FinalOutcome::Interrupted { message, cause } => json!({
            "outcome": "interrupted",
            "chars": message.content.chars().count(),
            "cause": cause.to_string(),
        }),
        FinalOutcome::Rejected(rejection) => json!({
            "outcome": "rejected",
            "rejection": rejection,
        }),
        FinalOutcome::Failed(err) => json!({
            "outcome": "failed",
            "kind": err.kind(),
            "error": err.to_string(),
        }),
    };
    println!("{summary}");

    if !outcome.is_completed() {
        std::process::exit(1);
    }
    Ok(())
}
