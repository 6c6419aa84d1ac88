use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use engine::{job::load_all_jobs, EngineConfig, Job, JobStatus};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use sysinfo::System;
use humansize::{format_size, DECIMAL};

const REFRESH_EVERY: Duration = Duration::from_secs(1);

struct App {
    jobs: Vec<Job>,
    load_error: Option<String>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    jobs_root: PathBuf,
    last_refresh: Option<Instant>,
}

impl App {
    fn new(jobs_root: PathBuf) -> Self {
        Self {
            jobs: Vec::new(),
            load_error: None,
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            jobs_root,
            last_refresh: None,
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        match load_all_jobs(&self.jobs_root) {
            Ok(mut jobs) => {
                jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                self.jobs = jobs;
                self.load_error = None;
            }
            Err(e) => {
                self.jobs = Vec::new();
                self.load_error = Some(format!("{:#}", e));
            }
        }
        self.last_refresh = Some(Instant::now());
    }

    fn refresh_due(&self) -> bool {
        self.last_refresh.map_or(true, |at| at.elapsed() >= REFRESH_EVERY)
    }

    fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

/// Terminal monitor for talk pipeline jobs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = EngineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(cfg.jobs_root.clone());

    loop {
        if app.refresh_due() {
            app.refresh();
        }

        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => app.should_quit = true,
                    crossterm::event::KeyCode::Char('r') => app.refresh(),
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(size);

    render_top_bar(f, app, main_chunks[0]);
    render_job_table(f, app, main_chunks[1]);
    render_status_bar(f, app, main_chunks[2]);
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);

    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);
}

fn render_job_table(f: &mut Frame, app: &mut App, area: Rect) {
    let max_data_rows = (area.height as usize).saturating_sub(3);

    let header = Row::new(vec!["ST", "MEDIA", "SIZE", "PROG", "CHUNKS", "THUMB", "TIME", "MESSAGE"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let now = Utc::now();
    let rows: Vec<Row> = if app.jobs.is_empty() {
        let note = match &app.load_error {
            Some(e) => truncate_string(e, 60),
            None => format!("Dir: {}", app.jobs_root.display()),
        };
        vec![Row::new(vec![
            "-".to_string(),
            "No jobs".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            note,
        ])]
    } else {
        app.jobs
            .iter()
            .take(max_data_rows)
            .map(|job| {
                let media = job
                    .media
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("?");
                let size = std::fs::metadata(&job.media)
                    .map(|m| format_size(m.len(), DECIMAL))
                    .unwrap_or_else(|_| "-".to_string());
                let chunks = format!(
                    "{}/{}",
                    job.tracking.transcribed_chunks,
                    job.tracking
                        .total_chunks
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "?".to_string())
                );
                let thumb = if job.thumbnail.thumbnail_exists {
                    "yes"
                } else if job.thumbnail.thumbnail_error.is_some() {
                    "err"
                } else {
                    "-"
                };
                let message = job
                    .error
                    .as_deref()
                    .or(job.tracking.progress_message.as_deref())
                    .unwrap_or("-");

                Row::new(vec![
                    status_label(job.status).to_string(),
                    truncate_string(media, 40),
                    size,
                    format!("{}%", job.progress()),
                    chunks,
                    thumb.to_string(),
                    elapsed(job, now),
                    truncate_string(message, 30),
                ])
                .style(Style::default().fg(status_color(job.status)))
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Percentage(35),
        Constraint::Length(9),
        Constraint::Length(5),
        Constraint::Length(7),
        Constraint::Length(5),
        Constraint::Length(9),
        Constraint::Percentage(25),
    ];

    let title = format!("Jobs ({}/{})", max_data_rows.min(app.jobs.len()), app.jobs.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let dir_display = app.jobs_root.display().to_string();
    let status_text = format!(
        "Total: {} | Queued: {} | Running: {} | Done: {} | Failed: {} | Error: {} | Dir: {} | q=quit r=refresh",
        app.jobs.len(),
        app.count_by_status(JobStatus::Queued),
        app.count_by_status(JobStatus::Running),
        app.count_by_status(JobStatus::Done),
        app.count_by_status(JobStatus::Failed),
        app.count_by_status(JobStatus::Error),
        truncate_string(&dir_display, 35)
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "QUE",
        JobStatus::Running => "RUN",
        JobStatus::Done => "OK",
        JobStatus::Failed => "FAIL",
        JobStatus::Error => "ERR",
    }
}

fn status_color(status: JobStatus) -> Color {
    match status {
        JobStatus::Queued => Color::Gray,
        JobStatus::Running => Color::Yellow,
        JobStatus::Done => Color::Green,
        JobStatus::Failed | JobStatus::Error => Color::Red,
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Run time so far, or total run time once finished
fn elapsed(job: &Job, now: DateTime<Utc>) -> String {
    let Some(started) = job.started_at else {
        return "-".to_string();
    };
    let secs = (job.finished_at.unwrap_or(now) - started).num_seconds().max(0);
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
