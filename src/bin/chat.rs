//! Line-oriented chat REPL over the supervised inference worker.

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use wren::conversation::Role;
use wren::{ChatConfig, ChatController};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Suppress noisy dependency logs by default; override with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("wren=info,hf_hub=warn,mistralrs=warn")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map_or_else(ChatConfig::default_path, PathBuf::from);
    let config = ChatConfig::load_or_default(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let mut controller = ChatController::new(config).context("initializing chat controller")?;

    for message in controller.conversation().messages() {
        print_message(message.role, &message.text);
    }
    if controller.skip_loading_ui() {
        println!("(model has loaded before; downloads should hit the cache)");
    }
    println!("Type a message and press enter. /quit to exit.");

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }

        if let Err(e) = controller.send(text) {
            eprintln!("Error: {e}");
            continue;
        }

        let bar = load_bar(controller.skip_loading_ui());
        let reply = controller
            .await_reply(|status| {
                if let Some(bar) = &bar {
                    bar.set_position(status.overall.clamp(0.0, 100.0) as u64);
                    bar.set_message(status.file.clone());
                    if status.ready {
                        bar.finish_and_clear();
                    }
                }
            })
            .await;
        if let Some(bar) = &bar {
            bar.finish_and_clear();
        }

        match reply {
            Ok(text) => print_message(Role::Bot, &text),
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    Ok(())
}

fn print_message(role: Role, text: &str) {
    let who = match role {
        Role::User => "You",
        Role::Bot => "Bot",
    };
    println!("{who}: {}", wren::controller::render_plain(text));
}

/// Overall-percentage bar for the first model load. Suppressed on a
/// returning visit, matching the persisted `model_loaded` flag.
fn load_bar(skip: bool) -> Option<ProgressBar> {
    if skip {
        return None;
    }
    let bar = ProgressBar::new(100);
    if let Ok(style) =
        ProgressStyle::with_template("  loading model [{bar:30}] {pos}%  {msg}")
    {
        bar.set_style(style);
    }
    Some(bar)
}
