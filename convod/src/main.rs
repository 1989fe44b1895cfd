use convod::daemon::{DaemonConfig, DaemonRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: convod [--once]");
        println!("  --once   Sync the lookback window once and exit");
        println!();
        println!("Without arguments, reads JSON tool calls from stdin, one per line.");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("convod=info".parse()?),
        )
        .init();

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Once => daemon.sync_once().await,
        _ => daemon.run().await,
    }
}
