use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use switchyard_contracts::events::EventWriter;
use switchyard_engine::{
    encode_reference_png, supported_upload_extension, AgentRuntimeClient, BearerTokenSigner,
    BedrockRuntimeClient, DispatchConfig, Dispatcher, DryrunInvoker, DryrunTextEndpoint,
    FalconEndpointClient, HttpObjectStore, MemoryObjectStore, ObjectStore, RequestSigner,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "switchyard", version, about = "Model dispatch and agent stream tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dispatch one action event and print the response envelope.
    Invoke(InvokeArgs),
    /// Ask the conversational agent a question and decode the stream.
    Ask(AskArgs),
    /// Store a local image as the reference image.
    Upload(UploadArgs),
    /// Delete the stored reference image.
    Wipe,
}

#[derive(Debug, Parser)]
struct InvokeArgs {
    /// Path to the action event JSON; read from stdin when omitted.
    #[arg(long)]
    event: Option<PathBuf>,
    /// Use the offline invoker and in-memory store.
    #[arg(long)]
    dry_run: bool,
    /// Append dispatch events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(long)]
    question: String,
    /// Session identifier; a fresh UUID when omitted.
    #[arg(long)]
    session: Option<String>,
    /// Tell the agent this is the last turn of the session.
    #[arg(long)]
    end_session: bool,
    /// Print the decoded trace channel to stderr.
    #[arg(long)]
    trace: bool,
}

#[derive(Debug, Parser)]
struct UploadArgs {
    #[arg(long)]
    file: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("switchyard error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Invoke(args) => run_invoke(args),
        Command::Ask(args) => run_ask(args),
        Command::Upload(args) => run_upload(args),
        Command::Wipe => run_wipe(),
    }
}

fn run_invoke(args: InvokeArgs) -> Result<i32> {
    let raw = match &args.event {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed reading event from stdin")?;
            buffer
        }
    };
    let event: Value = serde_json::from_str(&raw).context("event is not valid JSON")?;

    let config = DispatchConfig::from_env();
    let mut dispatcher = if args.dry_run {
        Dispatcher::new(
            config.clone(),
            Arc::new(MemoryObjectStore::new(config.bucket.clone())),
            Arc::new(DryrunInvoker),
        )
        .with_endpoint(Arc::new(DryrunTextEndpoint))
    } else {
        let signer = require_signer()?;
        let store = Arc::new(HttpObjectStore::for_region(
            &config.region,
            &config.bucket,
            signer.clone(),
        ));
        let invoker = Arc::new(BedrockRuntimeClient::for_region(&config.region, signer.clone()));
        let mut dispatcher = Dispatcher::new(config.clone(), store, invoker);
        if let Some(endpoint_name) = &config.falcon_endpoint {
            dispatcher = dispatcher.with_endpoint(Arc::new(FalconEndpointClient::for_region(
                &config.region,
                endpoint_name,
                signer,
            )));
        }
        dispatcher
    };
    if let Some(path) = &args.events {
        dispatcher = dispatcher.with_events(EventWriter::new(path, Uuid::new_v4().to_string()));
    }

    let envelope = dispatcher.handle(&event);
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(0)
}

fn run_ask(args: AskArgs) -> Result<i32> {
    let config = DispatchConfig::from_env();
    let signer = require_signer()?;
    let client = AgentRuntimeClient::from_env(&config.region, signer)?;
    let session = args
        .session
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let reply = client.ask(&session, &args.question, args.end_session)?;
    if args.trace && !reply.trace.is_empty() {
        eprintln!("{}", reply.trace);
    }
    println!("{}", reply.answer);
    Ok(0)
}

fn run_upload(args: UploadArgs) -> Result<i32> {
    let extension = args
        .file
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    if !supported_upload_extension(extension) {
        bail!("File must be jpg, jpeg, or png.");
    }
    let bytes =
        fs::read(&args.file).with_context(|| format!("failed reading {}", args.file.display()))?;
    let png = encode_reference_png(&bytes)?;

    let config = DispatchConfig::from_env();
    let signer = require_signer()?;
    let store = HttpObjectStore::for_region(&config.region, &config.bucket, signer);
    store.put(&config.reference_key, &png)?;
    println!(
        "Image successfully uploaded to {}/{}.",
        config.bucket, config.reference_key
    );
    Ok(0)
}

fn run_wipe() -> Result<i32> {
    let config = DispatchConfig::from_env();
    let signer = require_signer()?;
    let store = HttpObjectStore::for_region(&config.region, &config.bucket, signer);
    store.delete(&config.reference_key)?;
    println!(
        "Deleted {} from bucket {}.",
        config.reference_key, config.bucket
    );
    Ok(0)
}

fn require_signer() -> Result<Arc<dyn RequestSigner>> {
    let Some(signer) = BearerTokenSigner::from_env() else {
        bail!("BEDROCK_API_TOKEN not set");
    };
    Ok(Arc::new(signer))
}
