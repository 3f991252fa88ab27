mod audio;
mod capacity;
mod completion;
mod config;
mod pipeline;
mod prompts;
mod queue;
mod segment;
mod subs;
mod transcript;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;

use crate::audio::TtsRenderer;
use crate::capacity::CapacityProbe;
use crate::completion::HttpLmClient;
use crate::config::load_lm_config;
use crate::pipeline::Summarizer;
use crate::prompts::PromptSet;
use crate::queue::{DeliveryError, DeliverySink, QueueRegistry, SummarizationJob};
use crate::subs::{spawn_watcher, SubscriptionStore};
use crate::transcript::{TranscriptSource, YoutubeCaptionSource};

/// Conversation id used for everything typed at the console
const CONSOLE_CONVERSATION: &str = "console";

type ConsoleQueue = QueueRegistry<Summarizer<HttpLmClient>, ConsoleSink>;

/// Prints summaries to stdout and optionally reads them out loud
struct ConsoleSink {
    tts: Option<TtsRenderer>,
}

#[async_trait::async_trait]
impl DeliverySink for ConsoleSink {
    async fn deliver(&self, conversation_id: &str, text: &str) -> Result<(), DeliveryError> {
        if text.trim().is_empty() {
            return Err(DeliveryError::Permanent("empty summary".to_string()));
        }

        println!("\n📋 Résumé pour '{}':\n{}\n", conversation_id, text);

        if let Some(tts) = &self.tts {
            match tts.render(text) {
                Ok(path) => println!("🔊 Audio: {}", path.display()),
                Err(e) => eprintln!("⚠️ Audio rendering failed: {}", e),
            }
        }
        Ok(())
    }
}

/// A file path reads as a raw transcript; anything else goes through YouTube
async fn resolve_input(
    captions: &YoutubeCaptionSource,
    input: &str,
) -> Result<String, String> {
    if Path::new(input).is_file() {
        return fs::read_to_string(input).map_err(|e| format!("unreadable file: {}", e));
    }
    captions
        .fetch_transcript(input)
        .await
        .map_err(|e| e.to_string())
}

async fn handle_command_line(
    queue: Arc<ConsoleQueue>,
    store: Arc<SubscriptionStore>,
    captions: Arc<YoutubeCaptionSource>,
    summarizer: Arc<Summarizer<HttpLmClient>>,
    probe: Arc<CapacityProbe<HttpLmClient>>,
    shutdown_tx: mpsc::Sender<String>,
) {
    println!("📝 Command line interface active. Type 'help' for available commands.");

    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin).lines();
    let mut stdout = io::stdout();

    if stdout.write_all(b"\n> ").await.is_err() || stdout.flush().await.is_err() {
        eprintln!("❌ Failed to write initial prompt");
        return;
    }

    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                let (command, arg) = match line.split_once(char::is_whitespace) {
                    Some((command, arg)) => (command.to_lowercase(), arg.trim().to_string()),
                    None => (line.to_lowercase(), String::new()),
                };

                match command.as_str() {
                    "quit" | "q" | "exit" => {
                        println!("⏹️ Shutting down...");
                        if shutdown_tx.send("quit".to_string()).await.is_err() {
                            eprintln!("❌ Failed to send shutdown signal");
                        }
                        break;
                    }
                    "help" | "h" => {
                        println!("🤖 Available commands:");
                        println!("  sum <url|file>   - Queue a video URL or transcript file for summarization");
                        println!("  ask <url|file> ? <question> - Answer a question about a video's transcript");
                        println!("  sub <channel>    - Watch a YouTube channel id for new uploads");
                        println!("  unsub <channel>  - Stop watching a channel");
                        println!("  subs             - List watched channels");
                        println!("  clear            - Drop queued (not running) console jobs");
                        println!("  reprobe          - Forget the probed capacity (use after swapping models)");
                        println!("  status           - Show queue depth per conversation");
                        println!("  quit, q, exit    - Stop gracefully");
                    }
                    "status" => {
                        let counts = queue.pending_counts().await;
                        if counts.is_empty() {
                            println!("💤 No active conversations");
                        } else {
                            for (conversation, pending) in counts {
                                println!("⚙️ '{}': {} job(s) pending", conversation, pending);
                            }
                        }
                    }
                    "sum" | "s" => {
                        if arg.is_empty() {
                            println!("❓ Usage: sum <youtube-url | transcript-file>");
                        } else {
                            match resolve_input(&captions, &arg).await {
                                Ok(text) => {
                                    println!("📥 Queued ({} chars of transcript)", text.len());
                                    queue
                                        .enqueue(SummarizationJob::new(CONSOLE_CONVERSATION, text))
                                        .await;
                                }
                                Err(e) => println!("❌ Could not get a transcript: {}", e),
                            }
                        }
                    }
                    "ask" => {
                        // The " ? " separator keeps the '?' inside watch URLs intact
                        match arg.split_once(" ? ") {
                            Some((source, question)) if !question.trim().is_empty() => {
                                match resolve_input(&captions, source.trim()).await {
                                    Ok(text) => {
                                        let answer =
                                            summarizer.answer(&text, question.trim()).await;
                                        println!("\n💬 {}\n", answer);
                                    }
                                    Err(e) => println!("❌ Could not get a transcript: {}", e),
                                }
                            }
                            _ => println!("❓ Usage: ask <youtube-url | transcript-file> ? <question>"),
                        }
                    }
                    "sub" => {
                        if arg.is_empty() {
                            println!("❓ Usage: sub <channel-id>");
                        } else if store.add(&arg, CONSOLE_CONVERSATION).await {
                            println!("👀 Now watching channel {}", arg);
                        } else {
                            println!("❓ Channel {} is already watched", arg);
                        }
                    }
                    "unsub" => {
                        if arg.is_empty() {
                            println!("❓ Usage: unsub <channel-id>");
                        } else if store.remove(&arg).await {
                            println!("🗑️ Stopped watching channel {}", arg);
                        } else {
                            println!("❓ Channel {} was not watched", arg);
                        }
                    }
                    "subs" => {
                        let subscriptions = store.list().await;
                        if subscriptions.is_empty() {
                            println!("💤 No channels watched");
                        } else {
                            for (channel_id, subscription) in subscriptions {
                                println!(
                                    "👀 {} (since {}, last seen: {})",
                                    channel_id,
                                    subscription.added_at.format("%Y-%m-%d"),
                                    subscription.last_video_id.as_deref().unwrap_or("never")
                                );
                            }
                        }
                    }
                    "clear" => {
                        let dropped = queue.clear_pending(CONSOLE_CONVERSATION).await;
                        println!("🗑️ Dropped {} pending job(s)", dropped);
                    }
                    "reprobe" => {
                        probe.invalidate().await;
                        println!("📐 Capacity profile cleared; the next job re-probes the backend");
                    }
                    "" => {}
                    _ => {
                        println!("❓ Unknown command: '{}'. Type 'help' for available commands.", command);
                    }
                }

                if !matches!(command.as_str(), "quit" | "q" | "exit") {
                    if stdout.write_all(b"> ").await.is_err() || stdout.flush().await.is_err() {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("❌ Error reading command line: {}", e);
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize logger - must be done before any logging calls
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("error"))
        .format_timestamp_secs()
        .init();

    let config = match load_lm_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("❌ Failed to load lmapiconf.txt: {}", e);
            eprintln!("❌ Failed to load lmapiconf.txt: {}", e);
            eprintln!("Create a lmapiconf.txt in the project root; see example_lmapiconf.txt");
            return;
        }
    };
    println!("✅ Configuration loaded (backend: {})", config.base_url);

    let backend = Arc::new(HttpLmClient::new(&config));
    let probe = match (config.context_tokens_override, config.max_output_tokens_override) {
        (Some(context), Some(output)) => Arc::new(CapacityProbe::with_override(
            backend.clone(),
            &config.default_model,
            context,
            output,
        )),
        _ => Arc::new(CapacityProbe::new(backend.clone())),
    };

    let summarizer = Arc::new(Summarizer::new(
        backend,
        probe.clone(),
        PromptSet::load(),
        &config,
    ));

    let sink = Arc::new(ConsoleSink {
        tts: config.tts_command.as_deref().map(TtsRenderer::new),
    });
    let queue = Arc::new(QueueRegistry::new(summarizer.clone(), sink, &config));

    let store = Arc::new(SubscriptionStore::load(&config.subscriptions_file));

    let captions = match YoutubeCaptionSource::new() {
        Ok(captions) => Arc::new(captions),
        Err(e) => {
            eprintln!("❌ Failed to build the HTTP client: {}", e);
            return;
        }
    };

    // Channel watcher: new uploads turn into queued jobs for their conversation
    let (video_tx, mut video_rx) = mpsc::unbounded_channel();
    let watcher_task = spawn_watcher(
        store.clone(),
        reqwest::Client::new(),
        Duration::from_secs(config.watch_interval_secs),
        video_tx,
    );
    let watcher_queue = queue.clone();
    let watcher_captions = captions.clone();
    let feed_task = tokio::spawn(async move {
        while let Some(video) = video_rx.recv().await {
            println!("🆕 New upload for '{}': {}", video.conversation_id, video.video_url);
            match watcher_captions.fetch_transcript(&video.video_url).await {
                Ok(text) => {
                    watcher_queue
                        .enqueue(SummarizationJob::new(video.conversation_id, text))
                        .await;
                }
                Err(e) => eprintln!("⚠️ Transcript for {} unavailable: {}", video.video_url, e),
            }
        }
    });

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<String>(1);
    let cmd_task = tokio::spawn(handle_command_line(
        queue,
        store,
        captions,
        summarizer,
        probe,
        shutdown_tx,
    ));

    println!("🚀 Summarizer is running...");
    println!("💡 Use 'quit' to stop gracefully, or press Ctrl+C");
    tokio::select! {
        _ = signal::ctrl_c() => {
            println!("\n⏹️ Stopping gracefully...");
        }
        shutdown_signal = shutdown_rx.recv() => {
            if let Some(signal) = shutdown_signal {
                println!("📡 Received '{}' command, stopping gracefully...", signal);
            }
        }
    }

    watcher_task.abort();
    feed_task.abort();
    cmd_task.abort();
    println!("👋 Goodbye!");
}
