#[cfg(test)]
#[path = "cli_test.rs"]
mod tests;

use std::io;
use std::path;

use anyhow::bail;
use anyhow::Result;
use clap::value_parser;
use clap::Arg;
use clap::ArgAction;
use clap::ArgMatches;
use clap::Command;
use clap_complete::generate;
use clap_complete::Generator;
use clap_complete::Shell;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use yansi::Paint;

use crate::application::terminal::help_text;
use crate::configuration::Config;
use crate::configuration::ConfigKey;

/// What the binary should run once arguments and config are loaded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Chat,
}

fn print_completions<G: Generator>(gen: G, cmd: &mut Command) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut io::stdout());
}

async fn create_config_file() -> Result<()> {
    let config_file_path_str = Config::default(ConfigKey::ConfigFile);
    let config_file_path = path::PathBuf::from(&config_file_path_str);
    if config_file_path.exists() {
        bail!(format!(
            "Config file already exists at {config_file_path_str}"
        ));
    }

    if let Some(parent) = config_file_path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut file = fs::File::create(&config_file_path).await?;
    file.write_all(Config::serialize_default(all_arguments()).as_bytes())
        .await?;

    println!("Created default config file at {config_file_path_str}");
    return Ok(());
}

fn subcommand_completions() -> Command {
    return Command::new("completions")
        .about("Generates shell completions.")
        .arg(
            clap::Arg::new("shell")
                .short('s')
                .long("shell")
                .help("Which shell to generate completions for.")
                .action(ArgAction::Set)
                .value_parser(value_parser!(Shell))
                .required(true),
        );
}

fn subcommand_config() -> Command {
    return Command::new("config")
        .about("Configuration file options.")
        .subcommand(
            Command::new("create").about("Saves the default config file to the configuration file path. This command will fail if the file exists already.")
        )
        .subcommand(
            Command::new("default").about("Outputs the default configuration file to stdout.")
        )
        .subcommand(
            Command::new("path").about("Returns the default path for the configuration file.")
        );
}

fn arg_model() -> Arg {
    return Arg::new(ConfigKey::Model.to_string())
        .short('m')
        .long(ConfigKey::Model.to_string())
        .env("CHATRELAY_MODEL")
        .num_args(1)
        .help(format!(
            "The upstream model to request completions from. [default: {}]",
            Config::default(ConfigKey::Model)
        ));
}

fn subcommand_serve() -> Command {
    return Command::new("serve")
        .about("Start the relay server, forwarding POST /chat to the upstream completion API.")
        .arg(
            Arg::new(ConfigKey::ListenAddress.to_string())
                .short('l')
                .long(ConfigKey::ListenAddress.to_string())
                .env("CHATRELAY_LISTEN_ADDRESS")
                .num_args(1)
                .help(format!(
                    "Address the relay listens on. [default: {}]",
                    Config::default(ConfigKey::ListenAddress)
                )),
        )
        .arg(
            Arg::new(ConfigKey::MaxRequestBytes.to_string())
                .long(ConfigKey::MaxRequestBytes.to_string())
                .env("CHATRELAY_MAX_REQUEST_BYTES")
                .num_args(1)
                .help(format!(
                    "Largest request body the relay accepts, in bytes. [default: {}]",
                    Config::default(ConfigKey::MaxRequestBytes)
                )),
        )
        .arg(
            Arg::new(ConfigKey::OpenAiURL.to_string())
                .long(ConfigKey::OpenAiURL.to_string())
                .env("CHATRELAY_OPENAI_URL")
                .num_args(1)
                .help(format!(
                    "OpenAI API URL. Can be swapped to a compatible proxy. [default: {}]",
                    Config::default(ConfigKey::OpenAiURL)
                )),
        )
        .arg(
            Arg::new(ConfigKey::OpenAiToken.to_string())
                .long(ConfigKey::OpenAiToken.to_string())
                .env("OPENAI_API_KEY")
                .hide_env_values(true)
                .num_args(1)
                .help("OpenAI API token sent upstream as a bearer credential."),
        );
}

fn subcommand_chat() -> Command {
    return Command::new("chat")
        .about("Start a chat session against a running relay.")
        .arg(arg_model())
        .arg(
            Arg::new(ConfigKey::RelayURL.to_string())
                .short('r')
                .long(ConfigKey::RelayURL.to_string())
                .env("CHATRELAY_RELAY_URL")
                .num_args(1)
                .help(format!(
                    "Base URL of the relay server. [default: {}]",
                    Config::default(ConfigKey::RelayURL)
                )),
        )
        .arg(
            Arg::new(ConfigKey::SystemPrompt.to_string())
                .long(ConfigKey::SystemPrompt.to_string())
                .env("CHATRELAY_SYSTEM_PROMPT")
                .num_args(1)
                .help(format!(
                    "System prompt sent ahead of every chat request. [default: {}]",
                    Config::default(ConfigKey::SystemPrompt)
                )),
        );
}

pub fn build() -> Command {
    let commands_text = help_text()
        .split('\n')
        .map(|line| {
            if line.starts_with('-') {
                return format!("  {line}");
            }
            if line.starts_with("COMMANDS:") || line.starts_with("HOTKEYS:") {
                return Paint::new(format!("CHAT {line}"))
                    .underline()
                    .bold()
                    .to_string();
            }
            return line.to_string();
        })
        .collect::<Vec<String>>()
        .join("\n");

    let about = format!(
        "{}\n\nVersion: {}\nCommit: {}",
        env!("CARGO_PKG_DESCRIPTION"),
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_GIT_DESCRIBE")
    );

    return Command::new("chatrelay")
        .about(about)
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .after_help(commands_text)
        .arg_required_else_help(true)
        .subcommand(subcommand_serve())
        .subcommand(subcommand_chat())
        .subcommand(subcommand_completions())
        .subcommand(subcommand_config())
        .arg(
            Arg::new(ConfigKey::ConfigFile.to_string())
                .short('c')
                .long(ConfigKey::ConfigFile.to_string())
                .env("CHATRELAY_CONFIG_FILE")
                .num_args(1)
                .help(format!("Path to configuration file [default: {}]", Config::default(ConfigKey::ConfigFile)))
                .global(true)
        );
}

/// Every argument across subcommands, used to validate config file values.
pub fn all_arguments() -> Command {
    let mut cmd = build();
    for subcommand in [subcommand_serve(), subcommand_chat()] {
        for arg in subcommand.get_arguments() {
            if cmd.get_arguments().any(|e| return e.get_id() == arg.get_id()) {
                continue;
            }
            cmd = cmd.arg(arg.clone());
        }
    }

    return cmd;
}

pub async fn handle(matches: ArgMatches) -> Result<Option<Mode>> {
    match matches.subcommand() {
        Some(("serve", subcmd_matches)) => {
            Config::load(all_arguments(), vec![&matches, subcmd_matches]).await?;
            return Ok(Some(Mode::Serve));
        }
        Some(("chat", subcmd_matches)) => {
            Config::load(all_arguments(), vec![&matches, subcmd_matches]).await?;
            return Ok(Some(Mode::Chat));
        }
        Some(("completions", subcmd_matches)) => {
            if let Some(completions) = subcmd_matches.get_one::<Shell>("shell").copied() {
                let mut app = build();
                print_completions(completions, &mut app);
            }
        }
        Some(("config", subcmd_matches)) => match subcmd_matches.subcommand() {
            Some(("create", _)) => {
                create_config_file().await?;
            }
            Some(("default", _)) => {
                println!("{}", Config::serialize_default(all_arguments()));
            }
            Some(("path", _)) => {
                println!("{}", Config::default(ConfigKey::ConfigFile));
            }
            _ => {
                subcommand_config().print_long_help()?;
            }
        },
        _ => {
            build().print_long_help()?;
        }
    }

    return Ok(None);
}

pub async fn parse() -> Result<Option<Mode>> {
    return handle(build().get_matches()).await;
}
