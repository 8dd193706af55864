//! Terminal status view.
//!
//! Renders the daemon's snapshot on a fixed refresh interval: monitored
//! repositories with their PRs and status tags, and the live Claude
//! sessions with the tail of their output. Renders to stderr so stdout
//! stays clean for shell pipelines.
//!
//! `q`, `Esc`, or `Ctrl-C` request daemon shutdown.

use std::io::Stderr;
use std::sync::Arc;
use std::time::Duration;

use autoclaude_core::classify::StatusTag;
use autoclaude_core::snapshot::{SessionStatus, Snapshot};
use crossterm::event::{Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use tokio_util::sync::CancellationToken;

use crate::daemon::Daemon;

/// Interval between input polls; redraws also happen at this cadence so
/// session output feels live between snapshot refreshes.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Output lines shown for the most recent session.
const SESSION_TAIL_LINES: usize = 8;

type Tui = Terminal<CrosstermBackend<Stderr>>;

/// Runs the status view until the user quits or `shutdown` fires.
/// Quitting cancels `shutdown` so the daemon winds down with it.
///
/// # Errors
///
/// Returns an error when the terminal cannot be initialized or drawn to.
pub async fn run(
    daemon: Arc<Daemon>,
    refresh_interval: Duration,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    install_panic_hook();
    let mut terminal = init_terminal()?;
    let result = event_loop(&daemon, refresh_interval, &shutdown, &mut terminal).await;
    restore_terminal()?;
    result
}

async fn event_loop(
    daemon: &Arc<Daemon>,
    refresh_interval: Duration,
    shutdown: &CancellationToken,
    terminal: &mut Tui,
) -> std::io::Result<()> {
    let mut snapshot = daemon.snapshot();
    let mut refresh = tokio::time::interval(refresh_interval);
    let mut input = tokio::time::interval(INPUT_POLL_INTERVAL);

    loop {
        terminal.draw(|frame| draw(frame, &snapshot, refresh_interval))?;

        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            _ = refresh.tick() => {
                snapshot = daemon.snapshot();
            }
            _ = input.tick() => {
                if drain_input()? {
                    shutdown.cancel();
                    return Ok(());
                }
            }
        }
    }
}

/// Consumes pending terminal events; true when the user asked to quit.
fn drain_input() -> std::io::Result<bool> {
    while crossterm::event::poll(Duration::ZERO)? {
        if let Event::Key(key) = crossterm::event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            let quit = matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
                || (key.code == KeyCode::Char('c')
                    && key.modifiers.contains(KeyModifiers::CONTROL));
            if quit {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn draw(frame: &mut ratatui::Frame<'_>, snapshot: &Snapshot, refresh_interval: Duration) {
    let [header_area, repos_area, sessions_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(5),
        Constraint::Percentage(40),
        Constraint::Length(1),
    ])
    .areas(frame.area());

    draw_header(frame, header_area, snapshot);
    draw_repos(frame, repos_area, snapshot);
    draw_sessions(frame, sessions_area, snapshot);
    draw_footer(frame, footer_area, snapshot, refresh_interval);
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: Rect, snapshot: &Snapshot) {
    let header = format!(
        "auto-claude │ {} repos │ {} PRs │ {} workers",
        snapshot.repos.len(),
        snapshot.pr_count(),
        snapshot.worker_count,
    );
    frame.render_widget(
        Paragraph::new(header).style(Style::new().add_modifier(Modifier::BOLD).fg(Color::Cyan)),
        area,
    );
}

fn draw_repos(frame: &mut ratatui::Frame<'_>, area: Rect, snapshot: &Snapshot) {
    let mut lines = Vec::new();

    if snapshot.repos.is_empty() {
        lines.push(Line::styled("  (no repos configured)", dim()));
    }

    for repo in &snapshot.repos {
        let mut heading = format!(
            "{} [{} workers │ {} PRs",
            repo.full_name(),
            repo.workers,
            repo.prs.len(),
        );
        if repo.blocked_prs > 0 {
            heading.push_str(&format!(" │ {} blocked", repo.blocked_prs));
        }
        heading.push(']');
        lines.push(Line::styled(heading, Style::new().add_modifier(Modifier::BOLD)));

        if repo.prs.is_empty() {
            lines.push(Line::styled("    (no open PRs)", dim()));
            continue;
        }

        for pr in &repo.prs {
            let mut spans = vec![Span::raw(format!(
                "  #{} {} ({})",
                pr.number,
                truncate(&pr.title, 60),
                pr.author
            ))];
            for tag in &pr.states {
                spans.push(Span::raw(" "));
                spans.push(Span::styled(
                    format!("[{tag}]"),
                    Style::new().fg(tag_color(*tag)),
                ));
            }
            if pr.has_worker {
                spans.push(Span::styled(" (Claude)", Style::new().fg(Color::Cyan)));
            }
            lines.push(Line::from(spans));
        }
    }

    frame.render_widget(
        Paragraph::new(lines).block(Block::new().borders(Borders::TOP).title("Repositories")),
        area,
    );
}

fn draw_sessions(frame: &mut ratatui::Frame<'_>, area: Rect, snapshot: &Snapshot) {
    let mut lines = Vec::new();

    if snapshot.claude_sessions.is_empty() {
        lines.push(Line::styled("  (no active Claude sessions)", dim()));
    }

    for session in &snapshot.claude_sessions {
        lines.push(Line::from(vec![
            Span::styled("• ", Style::new().fg(Color::Green)),
            Span::raw(format!(
                "{} #{} - {} ({})",
                session.repo,
                session.pr_number,
                session.action,
                format_elapsed(session)
            )),
        ]));
    }

    if let Some(session) = snapshot.claude_sessions.first() {
        let start = session.output.len().saturating_sub(SESSION_TAIL_LINES);
        for line in &session.output[start..] {
            lines.push(Line::styled(format!("    {}", truncate(line, 120)), dim()));
        }
    }

    let title = format!("Claude Sessions ({})", snapshot.claude_sessions.len());
    frame.render_widget(
        Paragraph::new(lines).block(Block::new().borders(Borders::TOP).title(title)),
        area,
    );
}

fn draw_footer(
    frame: &mut ratatui::Frame<'_>,
    area: Rect,
    snapshot: &Snapshot,
    refresh_interval: Duration,
) {
    let footer = format!(
        "q:quit │ updated {} │ refresh {}",
        snapshot.timestamp.format("%H:%M:%S"),
        humantime::format_duration(refresh_interval),
    );
    frame.render_widget(Paragraph::new(footer).style(dim()), area);
}

fn dim() -> Style {
    Style::new().fg(Color::DarkGray)
}

const fn tag_color(tag: StatusTag) -> Color {
    match tag {
        StatusTag::Ready => Color::Green,
        StatusTag::ChecksFailing => Color::Red,
        StatusTag::Conflicting => Color::Magenta,
        StatusTag::ChecksPending | StatusTag::CopilotPending | StatusTag::ReviewsPending => {
            Color::Yellow
        },
        StatusTag::FixingReviews => Color::Cyan,
        StatusTag::Draft => Color::DarkGray,
    }
}

fn format_elapsed(session: &SessionStatus) -> String {
    let rounded = Duration::from_secs(session.elapsed.as_secs());
    humantime::format_duration(rounded).to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

fn init_terminal() -> std::io::Result<Tui> {
    enable_raw_mode()?;
    let mut out = std::io::stderr();
    execute!(out, EnterAlternateScreen)?;
    Terminal::new(CrosstermBackend::new(std::io::stderr()))
}

fn restore_terminal() -> std::io::Result<()> {
    disable_raw_mode()?;
    execute!(std::io::stderr(), LeaveAlternateScreen)?;
    Ok(())
}

/// Restores the terminal before the panic message prints, chaining onto
/// the previous hook. Without this a panic leaves the terminal in raw
/// mode with the alternate screen active.
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = restore_terminal();
        previous(info);
    }));
}
