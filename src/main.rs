use anyhow::{bail, Context, Result};
use webcard::{logging, platform, AppConfig, Service};

#[derive(Debug)]
struct Cli {
    config_path: String,
}

impl Cli {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut config_path: Option<String> = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                    config_path = Some(value);
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: webcard [--config <path>]\n\
                         --config <path>   Path to TOML configuration (default: config/webcard.toml)\n\
                         RUST_LOG overrides the configured log level."
                    );
                    std::process::exit(0);
                }
                other => {
                    if config_path.is_none() {
                        config_path = Some(other.to_string());
                    } else {
                        bail!("unknown argument '{other}'");
                    }
                }
            }
        }

        Ok(Self {
            config_path: config_path.unwrap_or_else(|| AppConfig::default_path().into()),
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse()?;

    let config = AppConfig::load(&cli.config_path)
        .with_context(|| format!("unable to load configuration from {}", cli.config_path))?;

    let _log_guard = logging::init(&config)?;
    platform::log_platform_guidance();

    Service::new(config).run().await
}
