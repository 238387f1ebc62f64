use crate::api::ApiClient;
use crate::audio::{AudioFormat, CpalInput};
use crate::config::{self, Config};
use crate::error::ClientError;
use crate::messages::{CaptureState, ViewState};
use crate::services::{
    CancelHandle, DeliveryMode, Recorder, VoiceMode, VoiceOrchestrator, VoiceSettings,
};

use anyhow::{Context, Result};
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::watch;

const HELP: &str = "\
Commands:
  ask <question>                 ask a question
  prompt <text>                  set the prompt without sending
  send                           send the current prompt
  clear                          clear prompt and answer
  record                         start recording from the microphone
  stop                           stop recording
  voice                          process the last recording
  mode transcribe|respond        what `voice` does with a recording
  delivery stream|immediate      how answers are delivered
  url <base-url>                 change the service address
  cancel                         cancel the answer being streamed
  status                         show current settings
  help                           show this help
  quit                           exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ask(String),
    Prompt(String),
    Send,
    Clear,
    Record,
    Stop,
    Voice,
    Mode(VoiceMode),
    Delivery(DeliveryMode),
    Url(String),
    Cancel,
    Status,
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match (word.to_ascii_lowercase().as_str(), rest) {
        ("ask", "") => return Err("usage: ask <question>".to_string()),
        ("ask", q) => Command::Ask(q.to_string()),
        ("prompt", text) => Command::Prompt(text.to_string()),
        ("send", _) => Command::Send,
        ("clear", _) => Command::Clear,
        ("record", _) => Command::Record,
        ("stop", _) => Command::Stop,
        ("voice", _) => Command::Voice,
        ("mode", "transcribe") => Command::Mode(VoiceMode::TranscribeOnly),
        ("mode", "respond") => Command::Mode(VoiceMode::TranscribeAndRespond),
        ("mode", _) => return Err("usage: mode transcribe|respond".to_string()),
        ("delivery", "stream") => Command::Delivery(DeliveryMode::Streamed),
        ("delivery", "immediate") => Command::Delivery(DeliveryMode::Immediate),
        ("delivery", _) => return Err("usage: delivery stream|immediate".to_string()),
        ("url", "") => return Err("usage: url <base-url>".to_string()),
        ("url", url) => Command::Url(url.to_string()),
        ("cancel", _) => Command::Cancel,
        ("status", _) => Command::Status,
        ("help", _) | ("?", _) => Command::Help,
        ("quit", _) | ("exit", _) => Command::Quit,
        (other, _) => return Err(format!("unknown command `{}` (try `help`)", other)),
    };

    Ok(Some(command))
}

pub struct App {
    config_path: PathBuf,
    base_url_tx: watch::Sender<String>,
    orchestrator: VoiceOrchestrator<ApiClient>,
    view_rx: watch::Receiver<ViewState>,
}

impl App {
    /// Must be called on a `LocalSet`; the recorder runs there.
    pub fn new(config: Config, config_path: PathBuf) -> Result<Self> {
        let (base_url_tx, base_url_rx) = watch::channel(config.api.base_url.clone());
        let api = ApiClient::new(base_url_rx, Duration::from_secs(config.timeout))
            .context("Failed to create HTTP client")?;

        let recordings_dir = config.recordings_dir();
        std::fs::create_dir_all(&recordings_dir).with_context(|| {
            format!("Failed to create recordings directory: {:?}", recordings_dir)
        })?;
        let recorder = Recorder::spawn(AudioFormat::default(), recordings_dir, Box::new(CpalInput));

        let (view_tx, view_rx) = watch::channel(ViewState::default());
        let settings = VoiceSettings {
            mode: config.voice_mode,
            delivery: config.delivery,
        };
        let orchestrator = VoiceOrchestrator::new(api, recorder, view_tx, settings);

        tracing::info!("Using API at {}", config.api.base_url);

        Ok(Self {
            config_path,
            base_url_tx,
            orchestrator,
            view_rx,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        tokio::task::spawn_local(render(self.view_rx.clone()));

        println!("voxask ready. Type `help` for commands.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line.context("Failed to read stdin")?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, shutting down");
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };

            let command = match parse_command(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(msg) => {
                    println!("{}", msg);
                    continue;
                }
            };

            tracing::debug!("Command: {:?}", command);
            if command == Command::Quit {
                break;
            }
            self.handle(command, &mut lines).await?;
        }

        if self.view_rx.borrow().capture == CaptureState::Recording {
            if let Err(e) = self.orchestrator.stop_recording().await {
                tracing::warn!("Failed to stop recording on exit: {}", e);
            }
        }

        tracing::info!("voxask shutdown complete");
        Ok(())
    }

    async fn handle(
        &mut self,
        command: Command,
        lines: &mut Lines<BufReader<Stdin>>,
    ) -> Result<()> {
        let cancel = self.orchestrator.cancel_handle();

        match command {
            Command::Ask(question) => {
                self.orchestrator.set_prompt(&question);
                drive(self.orchestrator.send_prompt(), &cancel, lines).await?;
            }
            Command::Prompt(text) => self.orchestrator.set_prompt(&text),
            Command::Send => drive(self.orchestrator.send_prompt(), &cancel, lines).await?,
            Command::Clear => self.orchestrator.clear_prompt(),
            Command::Record => log_failure(self.orchestrator.start_recording().await),
            Command::Stop => log_failure(self.orchestrator.stop_recording().await),
            Command::Voice => drive(self.orchestrator.process_voice(), &cancel, lines).await?,
            Command::Mode(mode) => {
                self.orchestrator.set_voice_mode(mode);
                println!("Voice mode: {:?}", mode);
            }
            Command::Delivery(delivery) => {
                self.orchestrator
                    .set_streamed(delivery == DeliveryMode::Streamed);
                println!("Delivery: {:?}", self.orchestrator.settings().delivery);
            }
            Command::Url(url) => self.update_base_url(&url),
            Command::Cancel => println!("Nothing to cancel."),
            Command::Status => self.print_status(),
            Command::Help => println!("{}", HELP),
            Command::Quit => {}
        }

        Ok(())
    }

    fn update_base_url(&self, url: &str) {
        let url = url.trim().trim_end_matches('/');
        if let Err(e) = config::validate_base_url(url) {
            println!("{}", e);
            return;
        }

        match Config::update_base_url(&self.config_path, url) {
            Ok(()) => {
                self.base_url_tx.send_replace(url.to_string());
                println!("API URL updated to {}", url);
            }
            Err(e) => {
                tracing::error!("Failed to save API URL: {:#}", e);
                println!("Error saving API URL: {}", e);
            }
        }
    }

    fn print_status(&self) {
        let settings = self.orchestrator.settings();
        let view = self.view_rx.borrow();
        println!("API URL:    {}", self.base_url_tx.borrow().as_str());
        println!("Voice mode: {:?}", settings.mode);
        println!("Delivery:   {:?}", settings.delivery);
        println!("Capture:    {:?}", view.capture);
        println!("Busy:       {}", view.busy);
        match &view.recording {
            Some(path) => println!("Recording:  {}", path.display()),
            None => println!("Recording:  none"),
        }
        if !view.prompt.is_empty() {
            println!("Prompt:     {}", view.prompt);
        }
    }
}

fn log_failure(result: Result<(), ClientError>) {
    if let Err(e) = result {
        tracing::debug!("Command failed: {}", e);
    }
}

/// Run a workflow to completion while still reading stdin, so `cancel` can
/// interrupt a stream. Other commands are refused until the workflow ends.
async fn drive<F>(
    workflow: F,
    cancel: &CancelHandle,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<()>
where
    F: Future<Output = Result<(), ClientError>>,
{
    tokio::pin!(workflow);
    let mut stdin_open = true;

    loop {
        tokio::select! {
            result = &mut workflow => {
                log_failure(result);
                return Ok(());
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) => match parse_command(&line) {
                        Ok(None) => {}
                        Ok(Some(Command::Cancel)) => {
                            if !cancel.cancel() {
                                println!("Nothing to cancel.");
                            }
                        }
                        _ => println!("Busy. Only `cancel` is accepted until the request finishes."),
                    },
                    None => {
                        stdin_open = false;
                        cancel.cancel();
                    }
                }
            }
        }
    }
}

async fn render(mut view: watch::Receiver<ViewState>) {
    let mut renderer = Renderer::default();
    let mut shown = view.borrow_and_update().clone();

    while view.changed().await.is_ok() {
        let next = view.borrow_and_update().clone();
        let out = renderer.update(&shown, &next);
        if !out.is_empty() {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(out.as_bytes());
            let _ = stdout.flush();
        }
        shown = next;
    }
}

/// Turns successive view snapshots into terminal output.
///
/// A streamed answer is printed on one line that grows as chunks arrive.
#[derive(Default)]
struct Renderer {
    /// Answer text already written on the open stream line
    streamed: Option<String>,
}

impl Renderer {
    fn update(&mut self, prev: &ViewState, next: &ViewState) -> String {
        let mut out = String::new();

        if next.notice != prev.notice && !next.notice.is_empty() {
            self.close_line(&mut out);
            out.push_str(&format!("[{}]\n", next.notice));
        }

        if next.transcript != prev.transcript && !next.transcript.is_empty() {
            self.close_line(&mut out);
            out.push_str(&format!("Transcript: {}\n", next.transcript));
        }

        if next.answer != prev.answer && !next.answer.is_empty() {
            let extends = self
                .streamed
                .as_deref()
                .filter(|shown| next.answer.starts_with(shown))
                .map(str::len);

            match extends {
                Some(len) => {
                    out.push_str(&next.answer[len..]);
                    self.streamed = Some(next.answer.clone());
                }
                None if next.currently_streaming && !next.waiting_for_first_chunk => {
                    self.close_line(&mut out);
                    out.push_str("Answer: ");
                    out.push_str(&next.answer);
                    self.streamed = Some(next.answer.clone());
                }
                None => {
                    self.close_line(&mut out);
                    out.push_str(&next.answer);
                    out.push('\n');
                }
            }
        }

        if !next.currently_streaming {
            self.close_line(&mut out);
        }

        out
    }

    fn close_line(&mut self, out: &mut String) {
        if self.streamed.take().is_some() {
            out.push('\n');
        }
    }
}
