pub mod audio;
pub mod controller;
pub mod credentials;
pub mod live;
pub mod progress;
pub mod settings;
pub mod state_machine;

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use audio::{CpalMicrophone, CpalSpeaker};
use controller::{ControllerHandle, Devices, SessionController, StatusUpdate};
use live::{GeminiLiveTransport, LiveError};
use progress::{ProgressStore, ACHIEVEMENT_INTERVIEW};
use state_machine::SessionState;

/// Topic used when none is given on the command line
pub const DEFAULT_TOPIC: &str = "Rust ownership and borrowing";

const COMMANDS_HELP: &str = "\
Commands:
  start    begin a live interview
  stop     end the current interview
  status   show the current status
  quit     stop and exit";

/// Practice a technical interview out loud with a live voice model
#[derive(Debug, Parser)]
#[command(name = "live-interview", version, after_help = COMMANDS_HELP)]
pub struct Cli {
    /// Interview topic
    #[arg(value_name = "TOPIC")]
    pub topic: Vec<String>,

    /// Store the Gemini API key in the system keyring and exit
    #[arg(long, value_name = "KEY", conflicts_with_all = ["clear_key", "topic"])]
    pub set_key: Option<String>,

    /// Remove the stored API key and exit
    #[arg(long, conflicts_with = "topic")]
    pub clear_key: bool,
}

/// What the command line asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliAction {
    Interview { topic: String },
    SetKey(String),
    ClearKey,
}

impl Cli {
    pub fn action(self) -> CliAction {
        if let Some(key) = self.set_key {
            return CliAction::SetKey(key);
        }
        if self.clear_key {
            return CliAction::ClearKey;
        }

        let topic = self.topic.join(" ");
        CliAction::Interview {
            topic: if topic.trim().is_empty() {
                DEFAULT_TOPIC.to_string()
            } else {
                topic
            },
        }
    }
}

/// Stdin command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Status,
    Quit,
    Help,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "start" | "s" => Some(Command::Start),
            "stop" | "x" => Some(Command::Stop),
            "status" | "?" => Some(Command::Status),
            "quit" | "exit" | "q" => Some(Command::Quit),
            "help" | "h" => Some(Command::Help),
            _ => None,
        }
    }
}

fn print_status(update: &StatusUpdate) {
    match &update.detail {
        Some(detail) => println!("[{}] {}", update.message, detail),
        None => println!("[{}]", update.message),
    }
}

/// Entry point for the CLI
pub async fn run(cli: Cli) -> Result<(), String> {
    let topic = match cli.action() {
        CliAction::SetKey(key) => {
            credentials::set_stored_api_key(Some(&key))?;
            println!("API key stored ({})", credentials::mask_key(key.trim()));
            return Ok(());
        }
        CliAction::ClearKey => {
            credentials::set_stored_api_key(None)?;
            println!("API key removed");
            return Ok(());
        }
        CliAction::Interview { topic } => topic,
    };

    let settings = settings::load_settings();
    match settings::settings_path() {
        // First run: write the defaults out so they can be edited
        Ok(path) if !path.exists() => {
            if let Err(e) = settings::save_settings(&settings) {
                log::warn!("Settings: could not write defaults: {}", e);
            }
        }
        Ok(_) => {}
        Err(e) => log::debug!("Settings: {}", e),
    }
    let api_key = credentials::resolve_api_key().ok_or_else(|| LiveError::MissingApiKey.to_string())?;
    log::info!("Using API key {} from {:?}", api_key.masked(), api_key.source());

    let transport = GeminiLiveTransport::new(api_key.value())
        .with_timeouts(settings.connect_timeout(), settings.setup_timeout());

    let devices = Devices {
        microphone: Arc::new(CpalMicrophone::new()),
        speaker: Arc::new(CpalSpeaker::new()),
        transport: Arc::new(transport),
    };

    let mut controller = SessionController::new(devices, settings.session_options(&topic));
    let updates = controller.subscribe();
    let handle = controller.handle();
    let controller_task = tokio::spawn(controller.run());

    let mut progress = match ProgressStore::default_path() {
        Ok(path) => Some(ProgressStore::load(path)),
        Err(e) => {
            log::warn!("Progress tracking disabled: {}", e);
            None
        }
    };

    println!("Interview topic: {}", topic);
    println!("Type 'start' to begin, 'quit' to exit.");

    let result = command_loop(&handle, updates, progress.as_mut()).await;

    // The loop exits on its own once the handle is gone
    drop(handle);
    if let Err(e) = controller_task.await {
        log::error!("Session controller task failed: {}", e);
    }

    result
}

async fn command_loop(
    handle: &ControllerHandle,
    mut updates: tokio::sync::mpsc::UnboundedReceiver<StatusUpdate>,
    mut progress: Option<&mut ProgressStore>,
) -> Result<(), String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut was_active = false;

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    return Ok(());
                };
                print_status(&update);

                if update.status == SessionState::Ended && was_active {
                    if let Some(store) = progress.as_deref_mut() {
                        if store.unlock(ACHIEVEMENT_INTERVIEW) {
                            println!("Achievement unlocked: Pro Orator");
                        }
                        if let Err(e) = store.save() {
                            log::warn!("Failed to save progress: {}", e);
                        }
                    }
                }
                was_active = update.status == SessionState::Active;
            }
            line = lines.next_line() => {
                let line = line.map_err(|e| format!("Failed to read stdin: {}", e))?;
                let Some(line) = line else {
                    // EOF behaves like quit
                    let _ = handle.exit().await;
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }

                let sent = match Command::parse(&line) {
                    Some(Command::Start) => handle.start().await,
                    Some(Command::Stop) => handle.stop().await,
                    Some(Command::Status) => {
                        print_status(&handle.status());
                        Ok(())
                    }
                    Some(Command::Quit) => {
                        let _ = handle.exit().await;
                        return Ok(());
                    }
                    Some(Command::Help) => {
                        println!("{}", COMMANDS_HELP);
                        Ok(())
                    }
                    None => {
                        println!("Unknown command '{}', try 'help'", line.trim());
                        Ok(())
                    }
                };
                sent.map_err(|e| e.to_string())?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(list: &[&str]) -> Result<CliAction, clap::Error> {
        let argv = std::iter::once("live-interview").chain(list.iter().copied());
        Cli::try_parse_from(argv).map(Cli::action)
    }

    #[test]
    fn test_parse_topic() {
        assert_eq!(
            parse(&["React", "hooks"]).unwrap(),
            CliAction::Interview {
                topic: "React hooks".to_string()
            }
        );
    }

    #[test]
    fn test_parse_default_topic() {
        assert_eq!(
            parse(&[]).unwrap(),
            CliAction::Interview {
                topic: DEFAULT_TOPIC.to_string()
            }
        );
    }

    #[test]
    fn test_parse_key_flags() {
        assert_eq!(
            parse(&["--set-key", "abc"]).unwrap(),
            CliAction::SetKey("abc".to_string())
        );
        assert_eq!(parse(&["--clear-key"]).unwrap(), CliAction::ClearKey);
        assert!(parse(&["--set-key"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["--clear-key", "Traits"]).is_err());
        assert!(parse(&["--set-key", "abc", "--clear-key"]).is_err());
    }

    #[test]
    fn test_help_is_handled_by_clap() {
        let err = Cli::try_parse_from(["live-interview", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse(" START "), Some(Command::Start));
        assert_eq!(Command::parse("stop"), Some(Command::Stop));
        assert_eq!(Command::parse("status"), Some(Command::Status));
        assert_eq!(Command::parse("q"), Some(Command::Quit));
        assert_eq!(Command::parse("dance"), None);
    }
}
