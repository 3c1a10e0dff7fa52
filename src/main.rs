use clap::{Parser, Subcommand};
use color_eyre::Result;
use pinpoint_tui::{
    api::{GeoProvider, ProxyClient},
    app::App,
    config::Config,
    events::EventHandler,
    location::{GpsdProvider, PositionProvider},
    logging, server, ui,
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{io, path::PathBuf, sync::Arc};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pinpoint", version, about = "Your live location on a terminal map")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Run the proxy in the background and show the live map (default)
    View,
    /// Run only the /api/ip geolocation proxy
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::View);

    // Instrumentation and safety
    let _log_guard = logging::initialize_logging(matches!(command, Command::Serve));
    color_eyre::install()?;

    let config = Config::load_from(&cli.config);
    let geo = GeoProvider::new(&config.services)?;
    let listener = server::bind(&config.server.bind).await?;

    match command {
        Command::Serve => {
            tokio::select! {
                res = server::serve(listener, geo) => res?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down proxy."),
            }
        }
        Command::View => {
            tokio::spawn(async move {
                if let Err(e) = server::serve(listener, geo).await {
                    error!("{}", e);
                }
            });
            run_view(&config).await?;
        }
    }

    Ok(())
}

async fn run_view(config: &Config) -> Result<()> {
    let proxy = ProxyClient::new(format!("http://{}", config.server.bind))?;
    let positions: Arc<dyn PositionProvider> =
        Arc::new(GpsdProvider::new(config.tracking.gpsd_addr.clone()));

    install_panic_hook();
    let mut terminal = setup_terminal()?;
    let mut events = EventHandler::new(50); // Fast enough for a smooth fly-to

    let mut app = App::new(config);
    app.mount(positions, proxy, events.tx.clone());

    while !app.should_quit {
        terminal.draw(|f| ui::render(f, &app))?;

        match events.next().await {
            Some(event) => app.handle_event(event),
            None => break,
        }
    }

    app.unmount();
    restore_terminal(terminal)?;
    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    crossterm::execute!(
        stdout,
        crossterm::terminal::EnterAlternateScreen,
        crossterm::cursor::Hide
    )?;
    Ok(Terminal::new(CrosstermBackend::new(stdout))?)
}

fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen,
        crossterm::cursor::Show
    )?;
    Ok(())
}

fn install_panic_hook() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        // Force terminal cleanup!
        crossterm::terminal::disable_raw_mode().ok();
        crossterm::execute!(
            std::io::stdout(),
            crossterm::terminal::LeaveAlternateScreen,
            crossterm::cursor::Show
        )
        .ok();
        original_hook(panic_info);
    }));
}
