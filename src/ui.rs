use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Bar, BarChart, BarGroup, Block, Borders, Paragraph, Sparkline},
    Terminal,
};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::queue::{QueueCounts, QueueStats};
use crate::status::{StatusHandle, StatusState};

const HISTORY_LEN: usize = 60;

/// Terminal view over the status state and queue counters.
pub struct Dashboard {
    status: StatusHandle,
    queue: Arc<QueueStats>,
    started: Instant,
    completions: VecDeque<u64>,
    last_completed: usize,
}

impl Dashboard {
    pub fn new(status: StatusHandle, queue: Arc<QueueStats>) -> Self {
        Self {
            status,
            queue,
            started: Instant::now(),
            completions: VecDeque::with_capacity(HISTORY_LEN),
            last_completed: 0,
        }
    }

    /// Records jobs completed since the previous sample.
    fn sample(&mut self, counts: &QueueCounts) {
        let done = counts.completed.saturating_sub(self.last_completed);
        self.last_completed = counts.completed;
        if self.completions.len() >= HISTORY_LEN {
            self.completions.pop_front();
        }
        self.completions.push_back(done as u64);
    }
}

/// Records held per page, in page order.
fn page_bars(state: &StatusState) -> Vec<(String, u64)> {
    state
        .data
        .iter()
        .map(|(page, records)| (format!("p{page}"), records.len() as u64))
        .collect()
}

/// Draws until 'q' is pressed.
pub async fn run_ui(dashboard: Dashboard) -> io::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_ui_loop(&mut terminal, dashboard).await;

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    result
}

async fn run_ui_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    mut dashboard: Dashboard,
) -> io::Result<()> {
    let mut animation_frame = 0u8;
    let spinner_frames = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
    let mut last_sample = Instant::now();

    loop {
        let counts = dashboard.queue.counts();
        let state = dashboard.status.snapshot();
        let elapsed = dashboard.started.elapsed();

        if last_sample.elapsed() >= Duration::from_secs(1) {
            dashboard.sample(&counts);
            last_sample = Instant::now();
        }

        animation_frame = (animation_frame + 1) % (spinner_frames.len() as u8);
        let spinner = spinner_frames[animation_frame as usize];

        terminal.draw(|f| {
            let vertical_chunks = Layout::default()
                .direction(Direction::Vertical)
                .margin(1)
                .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
                .split(f.area());

            let top_chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
                .split(vertical_chunks[0]);

            let bottom_chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
                .split(vertical_chunks[1]);

            let elapsed_secs = elapsed.as_secs();
            let hours = elapsed_secs / 3600;
            let minutes = (elapsed_secs % 3600) / 60;
            let seconds = elapsed_secs % 60;

            let worker_status = if counts.active > 0 {
                Span::styled(
                    format!("{} / {} Active", counts.active, counts.concurrency),
                    Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
                )
            } else {
                Span::styled(
                    "Idle",
                    Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                )
            };

            let label = |text: &'static str| Span::styled(text, Style::default().fg(Color::Cyan));
            let value = |text: String| Span::styled(text, Style::default().fg(Color::White));

            let system_info = vec![
                Line::from(""),
                Line::from(vec![
                    Span::styled("  ", Style::default()),
                    Span::styled(
                        format!("{} ", spinner),
                        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                    ),
                    Span::styled(
                        "hncrawler",
                        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                    ),
                ]),
                Line::from("  ─────────────────"),
                Line::from(vec![
                    label("  Uptime    : "),
                    value(format!("{:02}:{:02}:{:02}", hours, minutes, seconds)),
                ]),
                Line::from(vec![label("  Workers   : "), worker_status]),
                Line::from(vec![label("  Waiting   : "), value(counts.waiting.to_string())]),
                Line::from(vec![label("  Completed : "), value(counts.completed.to_string())]),
                Line::from(vec![label("  Retried   : "), value(counts.retried.to_string())]),
                Line::from(vec![
                    label("  Failed    : "),
                    Span::styled(
                        counts.failed.to_string(),
                        Style::default().fg(if counts.failed > 0 { Color::Red } else { Color::White }),
                    ),
                ]),
                Line::from(vec![label("  Stalled   : "), value(counts.stalled.to_string())]),
            ];

            let system_block = Paragraph::new(system_info)
                .block(Block::default().borders(Borders::ALL).title("System"));
            f.render_widget(system_block, top_chunks[0]);

            let mut log_lines: Vec<Line> = state
                .log
                .iter()
                .map(|line| Line::from(Span::styled(line.as_str(), Style::default().fg(Color::White))))
                .collect();
            if log_lines.is_empty() {
                log_lines.push(Line::from(Span::styled(
                    "Waiting for the first page",
                    Style::default().fg(Color::Yellow),
                )));
            }
            let log_block =
                Paragraph::new(log_lines).block(Block::default().borders(Borders::ALL).title("Log"));
            f.render_widget(log_block, top_chunks[1]);

            let bars: Vec<Bar> = page_bars(&state)
                .into_iter()
                .map(|(page, count)| {
                    Bar::default()
                        .value(count)
                        .label(Line::from(page))
                        .style(Style::default().fg(Color::Cyan))
                })
                .collect();
            let chart = BarChart::default()
                .block(Block::default().borders(Borders::ALL).title("Records per page"))
                .data(BarGroup::default().bars(&bars))
                .bar_width(4)
                .bar_gap(1);
            f.render_widget(chart, bottom_chunks[0]);

            let history: Vec<u64> = dashboard.completions.iter().copied().collect();
            let max_rate = history.iter().max().copied().unwrap_or(1).max(1);
            let sparkline = Sparkline::default()
                .block(
                    Block::default()
                        .borders(Borders::ALL)
                        .title("Completed jobs (per sec, 60s)"),
                )
                .data(&history)
                .style(Style::default().fg(Color::Cyan))
                .max(max_rate);
            f.render_widget(sparkline, bottom_chunks[1]);
        })?;

        if event::poll(Duration::from_millis(100))?
            && let Event::Key(key) = event::read()?
            && let KeyCode::Char('q') = key.code {
            break;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(())
}
