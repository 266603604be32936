use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chathub::logging::{self, LogConfig};
use chathub::render::PlainText;
use chathub::{ChatClient, ClientConfig, ConversationStyle};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "chathub", version, about = "Ask the chat service and stream the answer")]
struct Cli {
    /// Config file (defaults to ~/.chathub/config.toml)
    #[arg(long, value_name = "PATH", env = "CHATHUB_CONFIG")]
    config: Option<PathBuf>,
    /// Conversation style: creative, balanced or precise
    #[arg(long, short)]
    style: Option<ConversationStyle>,
    /// Continue an existing conversation instead of creating one
    #[arg(long, value_name = "ID")]
    conversation: Option<String>,
    /// Print web search results as they arrive
    #[arg(long)]
    search: bool,
    /// Instructions sent as context on the first turn
    #[arg(long, value_name = "TEXT")]
    personality: Option<String>,
    /// Attach an image file to the prompt
    #[arg(long, value_name = "PATH")]
    image: Option<PathBuf>,
    /// Verbose logging
    #[arg(long, short)]
    verbose: bool,
    /// The question to ask
    #[arg(required = true, num_args = 1..)]
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let logged = if cli.verbose {
        logging::init(LogConfig::debug())
    } else {
        logging::init_from_env()
    };
    if let Err(e) = logged {
        eprintln!("chathub: logging not initialized: {e}");
    }

    let config = ClientConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let client = ChatClient::new(config).context("building client")?;

    let handle = match &cli.conversation {
        Some(id) => {
            client.init().await.context("loading conversations")?;
            let handle = client
                .store()
                .get(id)
                .with_context(|| format!("conversation {id} not found"))?;
            Some(handle)
        }
        None => None,
    };

    let mut turn = client.turn(cli.prompt.join(" "));
    if let Some(style) = cli.style {
        turn = turn.with_style(style);
    }
    if let Some(personality) = cli.personality {
        turn = turn.with_personality(personality);
    }

    if let Some(path) = &cli.image {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading image {}", path.display()))?;
        turn = turn.with_image(STANDARD.encode(bytes));
    }

    let mut plain = PlainText::new(cli.search);
    let mut events = client.ask_stream(handle, turn);
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        let event = event?;
        if let Some(text) = plain.push(&event) {
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
        }
    }
    writeln!(stdout, "{}", plain.finish())?;
    Ok(())
}
