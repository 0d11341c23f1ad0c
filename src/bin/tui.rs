//! Speedwatch TUI - Live dashboard for the speed monitor
//!
//! Runs the monitor in-process against the configured source and displays:
//! - Current speed with overspeed highlight
//! - Speed vs limit gauge
//! - Limit selector (keys 1-5)
//! - Permission and source status

use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use speedwatch::domain::{MonitorCommand, PermissionStatus, RenderFrame, LIMIT_OPTIONS_KMH};
use speedwatch::infra::{Config, Metrics};
use speedwatch::io::build_source;
use speedwatch::services::{check_and_request, Monitor};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Speedwatch live dashboard
#[derive(Parser, Debug)]
#[command(name = "speedwatch-tui", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

struct App {
    unit_id: String,
    source_kind: &'static str,
    frame_rx: watch::Receiver<RenderFrame>,
    cmd_tx: mpsc::Sender<MonitorCommand>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    let metrics = Arc::new(Metrics::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Wire the monitor before touching the terminal so an early failure
    // leaves a readable error on stderr
    let source = build_source(&config, metrics.clone());
    let source_kind = source.kind();
    let (mut monitor, frame_rx) = Monitor::new(&config, metrics.clone());

    let status = check_and_request(source.as_ref()).await;
    monitor.set_permission(status);

    let subscription = if status == PermissionStatus::Granted {
        match source.subscribe(config.subscribe_config()).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                eprintln!("subscribe failed: {e:#}");
                None
            }
        }
    } else {
        None
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let monitor_handle = tokio::spawn(monitor.run(subscription, cmd_rx, shutdown_rx));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App { unit_id: config.unit_id().to_string(), source_kind, frame_rx, cmd_tx };

    let result = run_ui(&mut terminal, &mut app).await;

    // Graceful monitor shutdown releases the subscription
    let _ = shutdown_tx.send(true);
    let _ = monitor_handle.await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    result
}

async fn run_ui(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<(), Box<dyn std::error::Error>> {
    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    loop {
        let frame = *app.frame_rx.borrow();
        terminal.draw(|f| draw_ui(f, &frame, &app.unit_id, app.source_kind))?;

        let timeout = tick_rate.saturating_sub(last_tick.elapsed());
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                        KeyCode::Char(c @ '1'..='5') => {
                            let idx = (c as u8 - b'1') as usize;
                            let _ = app
                                .cmd_tx
                                .try_send(MonitorCommand::SetLimit(LIMIT_OPTIONS_KMH[idx]));
                        }
                        _ => {}
                    }
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            last_tick = Instant::now();
        }
    }
}

fn draw_ui(f: &mut Frame, frame: &RenderFrame, unit: &str, source: &str) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(7), // Speed readout
            Constraint::Length(3), // Speed vs limit gauge
            Constraint::Length(3), // Limit selector
            Constraint::Min(0),    // Status
        ])
        .split(f.area());

    draw_header(f, chunks[0], frame, unit);
    draw_speed_panel(f, chunks[1], frame);
    draw_speed_gauge(f, chunks[2], frame);
    draw_limit_selector(f, chunks[3], frame);
    draw_status_panel(f, chunks[4], frame, source);
}

fn draw_header(f: &mut Frame, area: Rect, frame: &RenderFrame, unit: &str) {
    let (status_text, status_color) = match frame.status {
        PermissionStatus::Granted => ("GRANTED", Color::Green),
        PermissionStatus::Unknown => ("UNKNOWN", Color::DarkGray),
        PermissionStatus::ServiceDisabled => ("SERVICE DISABLED", Color::Yellow),
        PermissionStatus::Denied => ("DENIED", Color::Red),
        PermissionStatus::DeniedForever => ("DENIED FOREVER", Color::Red),
    };

    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            "Speedwatch ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("| {} | Location: ", unit)),
        Span::styled(status_text, Style::default().fg(status_color)),
        Span::raw(" | 1-5 set limit | 'q' quit"),
    ]))
    .block(Block::default().borders(Borders::ALL));

    f.render_widget(header, area);
}

fn draw_speed_panel(f: &mut Frame, area: Rect, frame: &RenderFrame) {
    let speed_color = if frame.state.speeding { Color::Red } else { Color::Green };

    let over_line = if frame.state.speeding {
        Line::from(Span::styled(
            "OVER LIMIT",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ))
    } else {
        Line::from("")
    };

    let text = vec![
        Line::from(""),
        Line::from(Span::styled(
            format!("{:.1}", frame.state.speed_kmh),
            Style::default().fg(speed_color).add_modifier(Modifier::BOLD),
        )),
        Line::from("km/h"),
        Line::from(""),
        over_line,
    ];

    let panel = Paragraph::new(text).alignment(Alignment::Center).block(
        Block::default()
            .title(" Speed ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(speed_color)),
    );

    f.render_widget(panel, area);
}

fn draw_speed_gauge(f: &mut Frame, area: Rect, frame: &RenderFrame) {
    let ratio = if frame.limit_kmh > 0.0 {
        (frame.state.speed_kmh / frame.limit_kmh).min(1.0)
    } else {
        0.0
    };
    let color = if frame.state.speeding { Color::Red } else { Color::Green };

    let gauge = Gauge::default()
        .block(Block::default().title(" Speed vs Limit ").borders(Borders::ALL))
        .gauge_style(Style::default().fg(color))
        .ratio(ratio)
        .label(format!("{:.1} / {:.0} km/h", frame.state.speed_kmh, frame.limit_kmh));
    f.render_widget(gauge, area);
}

fn draw_limit_selector(f: &mut Frame, area: Rect, frame: &RenderFrame) {
    let mut spans: Vec<Span> = Vec::new();
    for (i, &option) in LIMIT_OPTIONS_KMH.iter().enumerate() {
        let selected = option == frame.limit_kmh;
        let style = if selected {
            Style::default().fg(Color::Black).bg(Color::Cyan).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        spans.push(Span::styled(format!(" {}:{:.0} ", i + 1, option), style));
        spans.push(Span::raw(" "));
    }

    let selector = Paragraph::new(Line::from(spans)).alignment(Alignment::Center).block(
        Block::default()
            .title(" Limit ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Blue)),
    );

    f.render_widget(selector, area);
}

fn draw_status_panel(f: &mut Frame, area: Rect, frame: &RenderFrame, source: &str) {
    let speeding_text =
        if frame.state.speeding { "over the limit" } else { "within the limit" };

    let stats = Paragraph::new(vec![
        Line::from(format!("Source:   {}", source)),
        Line::from(format!("Limit:    {:.0} km/h", frame.limit_kmh)),
        Line::from(format!("Current:  {:.1} km/h ({})", frame.state.speed_kmh, speeding_text)),
        Line::from(format!("Location: {}", frame.status.as_str())),
    ])
    .block(
        Block::default()
            .title(" Status ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Green)),
    );

    f.render_widget(stats, area);
}
