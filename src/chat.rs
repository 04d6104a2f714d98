//! CLI front-ends for a chat session: `docent ask`, `docent chat` and
//! `docent extract`.
//!
//! Answers go to stdout; errors go to stderr as one line each. A failed
//! turn in the REPL is reported and the session carries on.

use anyhow::Result;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Config;
use crate::extract::{DocumentLoader, DocumentSource};
use crate::models::{Message, Role};
use crate::session::{ChatServices, ChatSession};

async fn open_session(config: &Config, pdf: Option<PathBuf>) -> Result<ChatSession> {
    let services = Arc::new(ChatServices::from_config(config.clone())?);
    let mut session = ChatSession::new(services);
    if let Some(path) = pdf {
        session.set_document(DocumentSource::File(path)).await?;
    }
    Ok(session)
}

fn print_fragment(fragment: &str) {
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(fragment.as_bytes());
    let _ = stdout.flush();
}

fn print_message(message: &Message) {
    let label = match message.role {
        Role::User => "you",
        Role::Assistant => "docent",
    };
    println!("[{}] {}", label, message.content);
}

/// `docent ask`: one turn, answer printed to stdout.
pub async fn run_ask(
    config: &Config,
    question: &str,
    stream: bool,
    pdf: Option<PathBuf>,
) -> Result<()> {
    let mut session = open_session(config, pdf).await?;

    if stream {
        session.ask_streaming(question, print_fragment).await?;
        println!();
    } else {
        let answer = session.ask(question).await?;
        println!("{}", answer.content);
    }
    Ok(())
}

/// `docent chat`: interactive session on stdin.
///
/// Each line is one question. `/history` reprints the conversation,
/// `/quit` (or end of input) leaves.
pub async fn run_chat(config: &Config, pdf: Option<PathBuf>) -> Result<()> {
    let mut session = open_session(config, pdf).await?;
    let stream = config.generation.stream;

    println!(
        "docent: {} (type /history or /quit)",
        session.document().display_name()
    );
    for message in session.messages() {
        print_message(message);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_fragment("> ");
        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/history" => {
                for message in session.messages() {
                    print_message(message);
                }
                continue;
            }
            _ => {}
        }

        let result = if stream {
            let result = session.ask_streaming(&line, print_fragment).await;
            println!();
            result
        } else {
            session.ask(&line).await.map(|answer| {
                println!("{}", answer.content);
                answer
            })
        };
        if let Err(e) = result {
            eprintln!("error: {}", e);
        }
    }

    Ok(())
}

/// `docent extract`: prints the extracted document text and its size.
pub async fn run_extract(config: &Config, pdf: Option<PathBuf>) -> Result<()> {
    let source = DocumentSource::File(pdf.unwrap_or_else(|| config.document.path.clone()));
    let text = DocumentLoader::new().load(&source).await?;

    println!("{}", text);
    eprintln!(
        "{}: {} chars, {} bytes",
        source.display_name(),
        text.chars().count(),
        text.len()
    );
    Ok(())
}
