//! TUI for batch link checks with progress display

use crate::proxy::{LinkCheckReport, LinkChecker, ProbeConfig};
use crate::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Duration;

/// Maximum number of recent reports to keep per list
const MAX_RECENT_REPORTS: usize = 100;

/// Which list has focus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pane {
    Working,
    Failed,
}

impl Pane {
    fn toggle(self) -> Self {
        match self {
            Pane::Working => Pane::Failed,
            Pane::Failed => Pane::Working,
        }
    }
}

/// Batch link checker TUI application state
pub struct LinkCheckerApp {
    links: Vec<String>,
    config: ProbeConfig,
    good_output: Option<PathBuf>,
    bad_output: Option<PathBuf>,
    total: usize,
    checked: usize,
    good_count: usize,
    bad_count: usize,
    recent_good: VecDeque<LinkCheckReport>,
    recent_bad: VecDeque<LinkCheckReport>,
    pane: Pane,
    list_state: ListState,
    status_message: String,
    is_complete: bool,
    should_quit: bool,
}

impl LinkCheckerApp {
    pub fn new(
        links: Vec<String>,
        config: ProbeConfig,
        good_output: Option<PathBuf>,
        bad_output: Option<PathBuf>,
    ) -> Self {
        let total = links.len();
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            links,
            config,
            good_output,
            bad_output,
            total,
            checked: 0,
            good_count: 0,
            bad_count: 0,
            recent_good: VecDeque::new(),
            recent_bad: VecDeque::new(),
            pane: Pane::Working,
            list_state,
            status_message: "Starting link check... Press 'q' to quit.".to_string(),
            is_complete: false,
            should_quit: false,
        }
    }

    /// Run the TUI application
    pub async fn run(&mut self) -> Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        result
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        let mut good_file = open_output(self.good_output.as_deref())?;
        let mut bad_file = open_output(self.bad_output.as_deref())?;

        let checker = LinkChecker::with_config(self.config.clone());
        let mut rx = checker.check_links_stream(self.links.clone());

        loop {
            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                        if self.should_quit {
                            break;
                        }
                    }
                }
            }

            match rx.try_recv() {
                Ok(report) => {
                    let file = if report.is_working() {
                        good_file.as_mut()
                    } else {
                        bad_file.as_mut()
                    };
                    if let Some(file) = file {
                        writeln!(file, "{}", report.link)?;
                        file.flush()?;
                    }
                    self.record(report);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    if !self.is_complete {
                        self.is_complete = true;
                        self.status_message = format!(
                            "Complete! Checked: {} | Working: {} | Failed: {} | Press 'q' to quit",
                            self.total, self.good_count, self.bad_count
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Account for one finished report
    fn record(&mut self, report: LinkCheckReport) {
        self.checked += 1;

        let recent = if report.is_working() {
            self.good_count += 1;
            &mut self.recent_good
        } else {
            self.bad_count += 1;
            &mut self.recent_bad
        };
        recent.push_back(report);
        if recent.len() > MAX_RECENT_REPORTS {
            recent.pop_front();
        }

        self.status_message = format!(
            "Checking... {}% ({}/{}) | Working: {} | Failed: {}",
            self.progress(),
            self.checked,
            self.total,
            self.good_count,
            self.bad_count
        );
    }

    fn progress(&self) -> u16 {
        if self.total > 0 {
            (self.checked as f64 / self.total as f64 * 100.0) as u16
        } else {
            0
        }
    }

    fn focused_len(&self) -> usize {
        match self.pane {
            Pane::Working => self.recent_good.len(),
            Pane::Failed => self.recent_bad.len(),
        }
    }

    fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Tab => {
                self.pane = self.pane.toggle();
                self.list_state.select(Some(0));
            }
            KeyCode::Down => {
                let len = self.focused_len();
                let i = match self.list_state.selected() {
                    Some(i) if i + 1 < len => i + 1,
                    _ => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let len = self.focused_len();
                let i = match self.list_state.selected() {
                    Some(0) | None => len.saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Min(0),    // Report lists
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let title = Paragraph::new("Link Probe")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let progress = self.progress();
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(progress.min(100))
            .label(format!("{}/{} ({}%)", self.checked, self.total, progress));
        f.render_widget(gauge, chunks[1]);

        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);

        let focused = self.pane;
        render_report_list(
            f,
            columns[0],
            ReportList {
                title: "Working",
                reports: &self.recent_good,
                total: self.good_count,
                color: Color::Green,
            },
            (focused == Pane::Working).then_some(&mut self.list_state),
        );
        render_report_list(
            f,
            columns[1],
            ReportList {
                title: "Failed",
                reports: &self.recent_bad,
                total: self.bad_count,
                color: Color::Red,
            },
            (focused == Pane::Failed).then_some(&mut self.list_state),
        );

        let status = Paragraph::new(self.status_message.clone())
            .style(if self.is_complete {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }
}

struct ReportList<'a> {
    title: &'a str,
    reports: &'a VecDeque<LinkCheckReport>,
    total: usize,
    color: Color,
}

/// One line of a report list
fn report_line(report: &LinkCheckReport) -> String {
    match report.result.latency() {
        Some(ms) => format!("{} ({}ms)", report.label(), ms),
        None => format!("{} - {}", report.label(), report.result.message),
    }
}

fn render_report_list(f: &mut Frame, area: Rect, list: ReportList<'_>, state: Option<&mut ListState>) {
    let items: Vec<ListItem> = list
        .reports
        .iter()
        .rev() // newest first
        .map(|report| ListItem::new(report_line(report)).style(Style::default().fg(list.color)))
        .collect();

    let border_style = if state.is_some() {
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };

    let widget = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("{} ({})", list.title, list.total))
                .border_style(border_style),
        )
        .highlight_style(Style::default().bg(Color::DarkGray))
        .highlight_symbol(">> ");

    match state {
        Some(state) => f.render_stateful_widget(widget, area, state),
        None => f.render_widget(widget, area),
    }
}

fn open_output(path: Option<&Path>) -> io::Result<Option<File>> {
    path.map(|p| {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(p)
    })
    .transpose()
}
