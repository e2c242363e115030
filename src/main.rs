use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::warn;
use tokio::io::{AsyncBufReadExt, BufReader};

mod config;
mod demux;
mod message;
mod ollama;
mod session;
mod source;
mod store;

use config::Config;
use message::{Attachment, DocumentRef};
use ollama::OllamaSource;
use session::ChatSession;
use store::ChatStore;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Config::load().unwrap_or_default();
    let store = Arc::new(ChatStore::new());
    let source = Arc::new(OllamaSource::new(&config.base_url, &config.model));
    let mut session = ChatSession::new(Arc::clone(&store), source)
        .with_publish_interval(Duration::from_millis(config.publish_interval_ms));

    // Echo streamed output. Render views are prefix-monotone within one
    // generation, so printing the unseen suffix is enough.
    let mut live = store.subscribe_live_answer();
    let echo_store = Arc::clone(&store);
    let printer = tokio::spawn(async move {
        let mut printed = String::new();
        while live.changed().await.is_ok() {
            let text = live.borrow_and_update().clone();
            if text.is_empty() {
                if !printed.is_empty() {
                    // The committed message may carry a withheld tail the
                    // throttled publisher never showed; print the rest
                    if let Some(last) = echo_store.messages().last() {
                        if let Some(tail) = last.content.strip_prefix(printed.as_str()) {
                            print!("{tail}");
                        }
                    }
                    println!();
                    printed.clear();
                }
                continue;
            }
            // A view that does not extend what we already printed belongs
            // to a new generation; start over on a fresh line
            if !text.starts_with(printed.as_str()) {
                println!();
                printed.clear();
            }
            print!("{}", &text[printed.len()..]);
            let _ = std::io::stdout().flush();
            printed = text;
        }
    });

    println!("charla — {} via {}", config.model, config.base_url);
    println!("/stop cancels, /attach <path> attaches a file, /clear <n> removes one, /quit exits");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        match line.as_str() {
            "/quit" => break,
            "/stop" => session.stop(),
            _ if line.starts_with("/attach ") => {
                attach_file(&session, line["/attach ".len()..].trim());
            }
            _ if line.starts_with("/clear ") => {
                if let Ok(idx) = line["/clear ".len()..].trim().parse() {
                    session.clear_attachment(idx);
                }
            }
            _ => session.send(&line),
        }
    }

    session.stop();
    session.join().await;
    printer.abort();
    Ok(())
}

/// Register a file attachment and resolve its preview in the background.
fn attach_file(session: &ChatSession, path: &str) {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_string();
    let attachment = Attachment::new(DocumentRef {
        name,
        path: path.to_string(),
        mime: String::new(),
    });
    let id = attachment.id.clone();
    session.attach(attachment);

    let store = session.store();
    let path = path.to_string();
    tokio::spawn(async move {
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let preview: String = content.chars().take(80).collect();
                store.mark_attachment_loaded(&id, preview);
            }
            Err(e) => warn!("could not read attachment {path}: {e}"),
        }
    });
}
