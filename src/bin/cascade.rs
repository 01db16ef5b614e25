//! Send one prompt through a configured fallback router.
//!
//! ```text
//! RUST_LOG=debug cascade --config router.json --system "Answer in JSON" "Is 7 prime?"
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use llm_cascade::{CompletionClient, FallbackRouter, Message, RouterConfig};

#[derive(Parser, Debug)]
#[command(name = "cascade", about = "Resilient completion client")]
struct Cli
{   /// Router configuration (JSON)
    #[arg(short, long, env = "LLM_CASCADE_CONFIG")]
    config: PathBuf
  , /// Optional system prompt
    #[arg(short, long)]
    system: Option<String>
  , /// Attempts per endpoint; overrides the configured value
    #[arg(short, long)]
    retries: Option<usize>
  , /// Print only the structured payload found in the response
    #[arg(long)]
    json: bool
  , /// Print circuit status after the request
    #[arg(long)]
    status: bool
  , /// User prompt
    prompt: String
}

#[tokio::main]
async fn main() -> ExitCode
{   env_logger::init();
    let cli = Cli::parse();

    match run(cli).await
    {   Ok(()) => ExitCode::SUCCESS
      , Err(e) => {
          error!("{}", e);
          eprintln!("error: {}", e);
          ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> llm_cascade::Result<()>
{   let config = RouterConfig::from_file(&cli.config)?;
    let max_retries = cli.retries.unwrap_or(config.retry.max_retries);
    let router = FallbackRouter::from_config(config)?;
    info!("Routing across {:?}", router.endpoint_names());

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok()
      {   info!("Interrupted, cancelling request");
          ctrl_c.cancel();
      }
    });

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = cli.system
    {   messages.push(Message::system(system));
    }
    messages.push(Message::user(cli.prompt));

    let outcome = router
      .complete_with_retry(&messages, max_retries, &cancel)
      .await;

    if cli.status
    {   let status = router.get_circuit_status();
        match serde_json::to_string_pretty(&status)
        {   Ok(json) => eprintln!("{}", json)
          , Err(e) => error!("Failed to render circuit status: {}", e)
        }
    }

    let result = outcome?;
    info!(
      "Answered by {} ({}; {} in / {} out tokens)",
      result.backend,
      result.model,
      result.usage.input_tokens,
      result.usage.output_tokens
    );
    let text = result.text().unwrap_or_default();

    if cli.json
    {   let payload = router.extract_json(text)?;
        match serde_json::to_string_pretty(&payload)
        {   Ok(json) => println!("{}", json)
          , Err(e) => return Err(llm_cascade::Error::Decode(e.to_string()))
        }
    } else
    {   println!("{}", text);
    }
    Ok(())
}
