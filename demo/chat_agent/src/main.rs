mod config;

use config::ChatDemoConfig;
use skein_core::llm::HttpLlmClient;
use skein_core::retrieval::{ChromaVectorIndex, HttpReranker, RedisKeywordIndex, RerankClient};
use skein_core::tokens::default_tokenizer;
use skein_core::{Agent, AgentBackends, TurnOutput, TurnRequest};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,skein_core=info,chat_agent=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(target = "chat_agent", "Starting chat agent demo");

    let cfg = ChatDemoConfig::load();

    let llm = Arc::new(HttpLlmClient::new(cfg.llm.clone())?);
    let vector = Arc::new(ChromaVectorIndex::new(cfg.chroma.clone())?);
    let keyword = Arc::new(RedisKeywordIndex::connect(cfg.redis.clone()).await?);
    let rerank: Option<Arc<dyn RerankClient>> = if cfg.use_reranker {
        Some(Arc::new(HttpReranker::new(cfg.reranker.clone())?))
    } else {
        None
    };

    let mut agent = Agent::new(
        cfg.agent.clone(),
        AgentBackends {
            llm,
            tokenizer: default_tokenizer(),
            vector,
            keyword,
            rerank,
        },
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    let user_id = prompt(&mut lines, "User id (empty for the shared corpus): ").await?;
    let search_mode: u8 = prompt(&mut lines, "Search mode (0 shared / 1 own files / 2 both): ")
        .await?
        .parse()
        .unwrap_or(0);
    let files: Vec<String> = if search_mode != 0 {
        prompt(&mut lines, "File names (comma separated): ")
            .await?
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect()
    } else {
        Vec::new()
    };

    loop {
        println!("{}", "*".repeat(10));
        let query = match prompt(&mut lines, "Enter your query: ").await {
            Ok(q) if !q.is_empty() => q,
            Ok(_) => continue,
            Err(_) => break,
        };

        let request = TurnRequest::new(query)
            .with_user(user_id.clone())
            .with_search_mode(search_mode, files.clone());

        let started = Instant::now();
        match agent.turn(request).await {
            Ok(TurnOutput::Stream(mut stream)) => {
                let mut first_chunk = true;
                println!("Response:");
                while let Some(chunk) = stream.next_chunk().await {
                    if first_chunk {
                        info!(
                            target = "chat_agent",
                            first_token_ms = started.elapsed().as_millis() as u64,
                            "First token"
                        );
                        first_chunk = false;
                    }
                    print!("{}", chunk);
                    let _ = std::io::stdout().flush();
                }
                println!();
            }
            Ok(TurnOutput::Answer(answer)) => {
                println!("Response:\n{}", answer);
            }
            Err(e) => {
                error!(target = "chat_agent", error = %e, "Turn failed");
                println!("Sorry, something went wrong: {}", e);
            }
        }
    }

    Ok(())
}

async fn prompt(
    lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
    label: &str,
) -> Result<String, std::io::Error> {
    print!("{}", label);
    let _ = std::io::stdout().flush();
    match lines.next_line().await? {
        Some(line) => Ok(line.trim().to_string()),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stdin closed",
        )),
    }
}
