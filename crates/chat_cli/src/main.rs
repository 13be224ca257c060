use std::io::{self, Write};
use std::sync::Arc;

use agent_chat::{init_logging, EnvConfig, RunOrchestrator};
use agent_protocol::{StaticResolver, Transport};
use agent_protocol_mock::ScriptedTransport;
use chat_cli::app::{ChatApp, Control, Output, HELP_TEXT};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

fn main() -> io::Result<()> {
    let config = EnvConfig::from_env();
    init_logging(&config.log_config());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: EnvConfig) -> io::Result<()> {
    let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::trip_planner());
    let resolver = Arc::new(StaticResolver::new(config.platform_fulfillments()));
    let orchestrator =
        RunOrchestrator::with_config(transport, resolver, config.orchestrator_config());

    let (output_tx, mut output_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(output) = output_rx.recv().await {
            let written = match output {
                Output::Chunk(chunk) => write!(stdout, "{chunk}"),
                Output::Line(line) => writeln!(stdout, "{line}"),
            };
            if written.and_then(|()| stdout.flush()).is_err() {
                break;
            }
        }
    });

    let mut app = ChatApp::new(orchestrator, output_tx);
    println!("{HELP_TEXT}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if app.on_line(&line).await == Control::Quit {
            break;
        }
    }

    app.wait_idle().await;
    drop(app);
    printer.await.map_err(io::Error::other)
}
