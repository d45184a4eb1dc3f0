// Quiz proctor relay CLI
// Inspects and validates a running signaling relay, and scores answer sheets offline

use std::path::Path;

use clap::{Parser, Subcommand};
use colored::*;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use quiz_proctor::attempt::{is_correct, score_answers, AnswerMap, Question};
use quiz_proctor::signaling::{
    IceCandidate, SessionDescription, SignalEnvelope, SignalKind, SignalingMessage,
};

#[derive(Parser)]
#[command(name = "proctor-cli")]
#[command(about = "Quiz proctor relay CLI", long_about = None)]
struct Cli {
    /// Relay address (default: 127.0.0.1:8080)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check relay health endpoint
    Health,

    /// Get client configuration
    Config,

    /// Print every signal relayed for a quiz (press Ctrl+C to exit)
    Watch {
        /// Quiz ID
        #[arg(short, long)]
        quiz: String,
    },

    /// Publish one signal to a quiz topic
    Send {
        /// Quiz ID
        #[arg(short, long)]
        quiz: String,

        /// Sender peer ID
        #[arg(short, long)]
        from: String,

        /// Receiver peer ID
        #[arg(short, long)]
        to: String,

        /// offer, answer or ice-candidate
        #[arg(short, long)]
        kind: String,

        /// SDP text or ICE candidate line
        #[arg(short, long, default_value = "v=0")]
        payload: String,
    },

    /// Score an answer sheet against a question file
    Score {
        /// JSON array of questions
        #[arg(short, long)]
        questions: String,

        /// JSON object mapping question ID to selected option indices
        #[arg(short, long)]
        answers: String,
    },

    /// Run relay validation scenarios
    Validate {
        /// Run all validation tests
        #[arg(short, long)]
        all: bool,

        /// Test specific scenario
        #[arg(long)]
        scenario: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Health => {
            check_health(&cli.server).await;
        }
        Commands::Config => {
            check_config(&cli.server).await;
        }
        Commands::Watch { quiz } => {
            watch_quiz(&cli.server, quiz).await;
        }
        Commands::Send {
            quiz,
            from,
            to,
            kind,
            payload,
        } => {
            send_signal(&cli.server, quiz, from, to, kind, payload).await;
        }
        Commands::Score { questions, answers } => {
            score_sheet(Path::new(questions), Path::new(answers));
        }
        Commands::Validate { all, scenario } => {
            if *all {
                run_all_validations(&cli.server).await;
            } else if let Some(s) = scenario {
                run_scenario(&cli.server, s).await;
            } else {
                println!("{}", "Use --all or --scenario <name>".yellow());
                list_scenarios();
            }
        }
    }
}

fn signal_url(server: &str, quiz_id: &str) -> String {
    format!("ws://{}/signal/{}", server, urlencoding::encode(quiz_id))
}

async fn check_health(server: &str) {
    println!("{}", "Checking relay health...".cyan());

    let url = format!("http://{}/health", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                println!("{} Health check passed", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
                    println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
                }
            } else {
                println!("{} Health check failed: {}", "✗".red(), status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to relay: {}", "✗".red(), e);
            println!("  Make sure the relay is running on {}", server);
        }
    }
}

async fn check_config(server: &str) {
    println!("{}", "Fetching client configuration...".cyan());

    let url = format!("http://{}/config", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            if resp.status().is_success() {
                println!("{} Config endpoint accessible", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("\nConfiguration:");
                    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
                }
            } else {
                println!("{} Config fetch failed: {}", "✗".red(), resp.status());
            }
        }
        Err(e) => {
            println!("{} Cannot connect to relay: {}", "✗".red(), e);
        }
    }
}

async fn watch_quiz(server: &str, quiz_id: &str) {
    let url = signal_url(server, quiz_id);
    println!("{} {}", "Watching".cyan(), url);

    let (ws_stream, _) = match connect_async(&url).await {
        Ok(conn) => conn,
        Err(e) => {
            println!("{} WebSocket connection failed: {}", "✗".red(), e);
            return;
        }
    };
    let (_write, mut read) = ws_stream.split();

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalEnvelope>(&text) {
                Ok(envelope) => print_signal(&envelope.payload),
                Err(_) => println!("{} {}", "?".yellow(), text),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                println!("{} WebSocket error: {}", "✗".red(), e);
                break;
            }
        }
    }

    println!("{}", "Connection closed".yellow());
}

fn print_signal(message: &SignalingMessage) {
    let kind = match message.kind {
        SignalKind::Offer => "offer".green(),
        SignalKind::Answer => "answer".blue(),
        SignalKind::IceCandidate => "ice-candidate".magenta(),
    };
    println!(
        "{} {} {} -> {}",
        message.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
        kind,
        message.sender.bold(),
        message.receiver.bold()
    );
}

fn build_signal(quiz_id: &str, from: &str, to: &str, kind: &str, payload: &str) -> Result<SignalingMessage, String> {
    let built = match kind {
        "offer" => SignalingMessage::description(quiz_id, from, to, &SessionDescription::offer(payload)),
        "answer" => SignalingMessage::description(quiz_id, from, to, &SessionDescription::answer(payload)),
        "ice-candidate" => SignalingMessage::ice_candidate(
            quiz_id,
            from,
            to,
            &IceCandidate {
                candidate: payload.to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        ),
        other => return Err(format!("unknown signal kind {}", other)),
    };
    built.map_err(|e| e.to_string())
}

async fn send_signal(server: &str, quiz_id: &str, from: &str, to: &str, kind: &str, payload: &str) {
    let message = match build_signal(quiz_id, from, to, kind, payload) {
        Ok(message) => message,
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            println!("  Kinds: offer, answer, ice-candidate");
            return;
        }
    };

    let url = signal_url(server, quiz_id);
    let (ws_stream, _) = match connect_async(&url).await {
        Ok(conn) => conn,
        Err(e) => {
            println!("{} WebSocket connection failed: {}", "✗".red(), e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let text = match serde_json::to_string(&SignalEnvelope::wrap(message)) {
        Ok(text) => text,
        Err(e) => {
            println!("{} Failed to serialize signal: {}", "✗".red(), e);
            return;
        }
    };
    if let Err(e) = write.send(Message::Text(text)).await {
        println!("{} Failed to send: {}", "✗".red(), e);
        return;
    }

    // The relay echoes to the sender once the signal is on the topic.
    match timeout(Duration::from_secs(3), read.next()).await {
        Ok(Some(Ok(Message::Text(_)))) => println!("{} Signal relayed", "✓".green()),
        _ => println!("{} No echo from relay; signal may have been rejected", "○".yellow()),
    }
}

fn score_sheet(questions_path: &Path, answers_path: &Path) {
    let questions: Vec<Question> = match read_json(questions_path) {
        Ok(q) => q,
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            return;
        }
    };
    let answers: AnswerMap = match read_json(answers_path) {
        Ok(a) => a,
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            return;
        }
    };

    println!("\n{}", "Answer sheet".bold());
    println!("{}", "─".repeat(60));
    for question in &questions {
        let selected = answers.get(&question.id).map(Vec::as_slice).unwrap_or(&[]);
        let mark = if is_correct(question, selected) {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("  {} {} ({} pts) {:?}", mark, question.id, question.points, selected);
    }

    let score = score_answers(&questions, &answers);
    println!("{}", "─".repeat(60));
    println!("  Score: {}", format!("{}%", score).bold());
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON in {}: {}", path.display(), e))
}

fn list_scenarios() {
    println!("\n{}", "Available Validation Scenarios:".bold());
    println!("  {} - HTTP health endpoint", "health".cyan());
    println!("  {} - Basic WebSocket connection test", "connection".cyan());
    println!("  {} - Signal reaches sender and peer", "relay-echo".cyan());
    println!("  {} - Signals stay within their quiz", "quiz-isolation".cyan());
    println!("  {} - Frames for another quiz are dropped", "invalid-frame".cyan());
    println!("\nExample: proctor-cli validate --scenario relay-echo");
}

const SCENARIOS: [&str; 5] = ["health", "connection", "relay-echo", "quiz-isolation", "invalid-frame"];

async fn run_validation(server: &str, scenario: &str) -> Option<bool> {
    let result = match scenario {
        "health" => validate_health(server).await,
        "connection" => validate_connection(server).await,
        "relay-echo" => validate_relay_echo(server).await,
        "quiz-isolation" => validate_quiz_isolation(server).await,
        "invalid-frame" => validate_invalid_frame(server).await,
        _ => return None,
    };
    Some(result)
}

async fn run_scenario(server: &str, scenario: &str) {
    println!("\n{} {}", "Running scenario:".bold(), scenario.cyan());
    println!("{}", "─".repeat(60));

    match run_validation(server, scenario).await {
        Some(true) => println!("\n{} Scenario passed", "✓".green().bold()),
        Some(false) => println!("\n{} Scenario failed", "✗".red().bold()),
        None => {
            println!("{} Unknown scenario: {}", "✗".red(), scenario);
            list_scenarios();
        }
    }
}

async fn run_all_validations(server: &str) {
    println!("\n{}", "Running All Validation Tests".bold().green());
    println!("{}\n", "═".repeat(60).green());

    let mut passed = 0;
    let mut failed = 0;

    for scenario in SCENARIOS {
        println!("\n{} Testing: {}", "▶".cyan(), scenario.bold());
        println!("{}", "─".repeat(60));

        if run_validation(server, scenario).await == Some(true) {
            passed += 1;
        } else {
            failed += 1;
        }

        sleep(Duration::from_millis(200)).await;
    }

    println!("\n{}", "═".repeat(60).green());
    println!("{}", "Validation Summary".bold());
    println!("{}", "═".repeat(60).green());
    println!("  {} Passed: {}", "✓".green(), passed.to_string().green());
    println!("  {} Failed: {}", "✗".red(), failed.to_string().red());
    println!("  Total: {}", passed + failed);

    if failed == 0 {
        println!("\n{}", "All validations passed!".green().bold());
    } else {
        println!("\n{}", "Some validations failed. Check output above.".yellow());
    }
}

async fn validate_health(server: &str) -> bool {
    let url = format!("http://{}/health", server);
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => match resp.json::<serde_json::Value>().await {
            Ok(body) if body["status"] == "healthy" => {
                println!("{} Relay reports healthy", "✓".green());
                true
            }
            _ => {
                println!("{} Unexpected health payload", "✗".red());
                false
            }
        },
        Ok(resp) => {
            println!("{} Health returned {}", "✗".red(), resp.status());
            false
        }
        Err(e) => {
            println!("{} Cannot connect to relay: {}", "✗".red(), e);
            false
        }
    }
}

async fn validate_connection(server: &str) -> bool {
    let url = signal_url(server, "validator-quiz");

    match connect_async(&url).await {
        Ok((ws_stream, _)) => {
            println!("{} WebSocket connection successful", "✓".green());
            drop(ws_stream);
            true
        }
        Err(e) => {
            println!("{} Connection failed: {}", "✗".red(), e);
            false
        }
    }
}

fn candidate_frame(quiz_id: &str, from: &str, to: &str) -> Option<String> {
    let message = SignalingMessage::new(
        SignalKind::IceCandidate,
        quiz_id,
        from,
        to,
        json!({ "candidate": "candidate:1 1 udp 1 127.0.0.1 9 typ host" }),
    );
    serde_json::to_string(&SignalEnvelope::wrap(message)).ok()
}

async fn next_signal<S>(read: &mut S, wait: Duration) -> Option<SignalingMessage>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(wait, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str::<SignalEnvelope>(&text).ok().map(|e| e.payload);
            }
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

async fn validate_relay_echo(server: &str) -> bool {
    let url = signal_url(server, "validator-echo");
    let (Ok((prof, _)), Ok((student, _))) = (connect_async(&url).await, connect_async(&url).await) else {
        println!("{} Connection failed", "✗".red());
        return false;
    };
    let (mut prof_write, mut prof_read) = prof.split();
    let (_student_write, mut student_read) = student.split();
    sleep(Duration::from_millis(100)).await;

    let Some(frame) = candidate_frame("validator-echo", "prof", "student") else {
        return false;
    };
    if prof_write.send(Message::Text(frame)).await.is_err() {
        println!("{} Failed to send signal", "✗".red());
        return false;
    }

    let echoed = next_signal(&mut prof_read, Duration::from_secs(3)).await;
    let delivered = next_signal(&mut student_read, Duration::from_secs(3)).await;

    match (echoed, delivered) {
        (Some(_), Some(msg)) if msg.receiver == "student" => {
            println!("{} Signal echoed to sender and delivered to peer", "✓".green());
            true
        }
        (None, _) => {
            println!("{} Sender did not receive its echo", "✗".red());
            false
        }
        _ => {
            println!("{} Peer did not receive the signal", "✗".red());
            false
        }
    }
}

async fn validate_quiz_isolation(server: &str) -> bool {
    let (Ok((a, _)), Ok((b, _))) = (
        connect_async(signal_url(server, "validator-a")).await,
        connect_async(signal_url(server, "validator-b")).await,
    ) else {
        println!("{} Connection failed", "✗".red());
        return false;
    };
    let (mut a_write, _a_read) = a.split();
    let (_b_write, mut b_read) = b.split();
    sleep(Duration::from_millis(100)).await;

    let Some(frame) = candidate_frame("validator-a", "prof", "student") else {
        return false;
    };
    if a_write.send(Message::Text(frame)).await.is_err() {
        return false;
    }

    match next_signal(&mut b_read, Duration::from_secs(1)).await {
        None => {
            println!("{} Other quiz received nothing", "✓".green());
            true
        }
        Some(_) => {
            println!("{} Signal leaked across quizzes", "✗".red());
            false
        }
    }
}

async fn validate_invalid_frame(server: &str) -> bool {
    let Ok((ws, _)) = connect_async(signal_url(server, "validator-invalid")).await else {
        println!("{} Connection failed", "✗".red());
        return false;
    };
    let (mut write, mut read) = ws.split();
    sleep(Duration::from_millis(100)).await;

    let Some(foreign) = candidate_frame("some-other-quiz", "prof", "student") else {
        return false;
    };
    if write.send(Message::Text(foreign)).await.is_err() {
        return false;
    }

    match next_signal(&mut read, Duration::from_secs(1)).await {
        None => {
            println!("{} Mismatched quiz frame was dropped", "✓".green());
            true
        }
        Some(_) => {
            println!("{} Mismatched quiz frame was relayed", "✗".red());
            false
        }
    }
}
