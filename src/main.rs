use gator::commands::{Command, Commands, State};
use gator::config::Config;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output stays on stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let command = Command::from_argv(std::env::args())?;

    let config = Config::read()?;
    debug!("Loaded configuration from {}", config.path().display());

    let mut state = State::new(config).await?;
    let commands = Commands::with_defaults();

    commands.run(&mut state, &command).await?;

    Ok(())
}
