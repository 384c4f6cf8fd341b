use anyhow::Context;
use clap::Parser;
use faq_chat::{
    doc_processor, telemetry, ChatConfig, ChatError, ChatWidget, StreamingChatClient,
    WidgetControl,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::info;

/// Ask the FAQ assistant from the terminal
#[derive(Parser, Debug)]
#[command(name = "faq-chat", version)]
struct Cli {
    /// Directory holding the knowledge base (.txt, .md, .pdf)
    #[arg(short, long)]
    docs: Option<PathBuf>,

    /// Backend base URL, overrides FAQ_CHAT_URL
    #[arg(long)]
    url: Option<String>,

    /// Access key, overrides FAQ_CHAT_KEY
    #[arg(long)]
    key: Option<String>,

    /// Edge function name, overrides FAQ_CHAT_FUNCTION
    #[arg(long)]
    function: Option<String>,

    /// Ask one question and exit
    #[arg(short, long)]
    question: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);

    let mut config = ChatConfig::from_env();
    if let Some(url) = cli.url {
        config.base_url = Some(url);
    }
    if let Some(key) = cli.key {
        config.api_key = Some(key);
    }
    if let Some(function) = cli.function {
        config.function = function;
    }

    let documents = match &cli.docs {
        Some(dir) => doc_processor::load_dir(dir)
            .with_context(|| format!("Failed to load knowledge base from {}", dir.display()))?,
        None => Vec::new(),
    };

    let client = StreamingChatClient::new(config);
    info!(
        function = %client.config().function,
        documents = documents.len(),
        "Starting FAQ chat"
    );
    let (widget, handle) = ChatWidget::new(client);
    widget.start(documents.clone())?;
    handle.open();
    widget.apply_pending_commands();

    if let Some(question) = cli.question {
        ask(&widget, &question).await?;
        return Ok(());
    }

    prompt();
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        match line.trim() {
            "" => {}
            "/quit" | "/exit" => break,
            "/reset" => widget.start(documents.clone())?,
            question => {
                if let Err(e) = ask(&widget, question).await {
                    eprintln!("error: {}", e);
                }
            }
        }
        prompt();
    }

    handle.close();
    widget.apply_pending_commands();
    Ok(())
}

async fn ask(widget: &ChatWidget, question: &str) -> Result<(), ChatError> {
    widget
        .submit(question, |chunk| {
            let mut out = std::io::stdout().lock();
            if chunk.done {
                let _ = writeln!(out);
            } else {
                let _ = write!(out, "{}", chunk.delta);
            }
            let _ = out.flush();
        })
        .await
        .map(|_| ())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
