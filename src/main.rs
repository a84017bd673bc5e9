use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voice_relay::api::ApiServerBuilder;
use voice_relay::{Config, Providers};

/// Voice Relay - real-time voice conversations with an LLM
#[derive(Parser)]
#[command(name = "voice-relay", version, about)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(long, env = "VOICE_RELAY_PORT")]
    port: Option<u16>,

    /// Config file (default: ~/.config/voice-relay/config.toml)
    #[arg(short, long, env = "VOICE_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory with a web client to serve
    #[arg(long, env = "VOICE_RELAY_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Synthesize text with the configured voice
    Say {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Where to write the audio
        #[arg(short, long, default_value = "say.wav")]
        output: PathBuf,
    },
    /// List voices offered by the synthesis backend
    Voices,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voice_relay=info",
        1 => "info,voice_relay=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Say { text, output } => say(&config, &text, &output).await,
            Command::Voices => list_voices(&config).await,
        };
    }

    let mut builder = ApiServerBuilder::new(config);
    if let Some(port) = cli.port {
        builder = builder.port(port);
    }
    if cli.static_dir.is_some() {
        builder = builder.static_dir(cli.static_dir);
    }
    let server = builder.build();

    tracing::info!("voice relay ready");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}

/// Synthesize one line of text to a file
async fn say(config: &Config, text: &str, output: &std::path::Path) -> anyhow::Result<()> {
    let speech = Providers::from_config(config)
        .speech
        .ok_or_else(|| anyhow::anyhow!("MURF_API_KEY is not set"))?;

    println!("Synthesizing: \"{text}\"");
    let audio = speech.synthesize(text).await?;
    tokio::fs::write(output, &audio).await?;
    println!("Wrote {} bytes to {}", audio.len(), output.display());

    Ok(())
}

/// Print the available voices
async fn list_voices(config: &Config) -> anyhow::Result<()> {
    let speech = Providers::from_config(config)
        .speech
        .ok_or_else(|| anyhow::anyhow!("MURF_API_KEY is not set"))?;

    let voices = speech.voices().await?;
    for voice in &voices {
        println!(
            "{:<24} {:<20} {:<8} {}",
            voice.voice_id,
            voice.display_name,
            voice.locale,
            voice.styles.join(", ")
        );
    }
    println!("\n{} voices", voices.len());

    Ok(())
}
