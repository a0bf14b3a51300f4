use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState, Wrap},
    Frame, Terminal,
};
use slip_renewal::{decode, LogEntry, MemberRecord, MonthToken};
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Members,
    TransactionLog,
}

impl Page {
    pub fn next(&self) -> Self {
        match self {
            Page::Members => Page::TransactionLog,
            Page::TransactionLog => Page::Members,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Page::Members => "Members",
            Page::TransactionLog => "Transaction Log",
        }
    }
}

/// Which log rows are shown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFilter {
    All,
    Success,
    NotFound,
}

impl LogFilter {
    fn accepts(&self, entry: &LogEntry) -> bool {
        match self {
            LogFilter::All => true,
            LogFilter::Success => entry.status.starts_with("Success"),
            LogFilter::NotFound => !entry.status.starts_with("Success"),
        }
    }

    fn label(&self) -> &str {
        match self {
            LogFilter::All => "ALL",
            LogFilter::Success => "SUCCESS",
            LogFilter::NotFound => "NOT FOUND",
        }
    }
}

pub struct App {
    pub members: Vec<MemberRecord>,
    pub log: Vec<LogEntry>,
    pub filtered_log: Vec<LogEntry>,
    pub current_month: MonthToken,
    pub member_state: TableState,
    pub log_state: TableState,
    pub current_page: Page,
    pub show_detail: bool,
    pub log_filter: LogFilter,
}

impl App {
    pub fn new(members: Vec<MemberRecord>, mut log: Vec<LogEntry>, current_month: MonthToken) -> Self {
        // Newest first on screen
        log.reverse();

        let mut member_state = TableState::default();
        if !members.is_empty() {
            member_state.select(Some(0));
        }

        let mut log_state = TableState::default();
        if !log.is_empty() {
            log_state.select(Some(0));
        }

        let filtered_log = log.clone();

        Self {
            members,
            log,
            filtered_log,
            current_month,
            member_state,
            log_state,
            current_page: Page::Members,
            show_detail: false,
            log_filter: LogFilter::All,
        }
    }

    pub fn toggle_detail(&mut self) {
        self.show_detail = !self.show_detail;
    }

    pub fn next_page(&mut self) {
        self.current_page = self.current_page.next();
    }

    /// True if the member's entitlement covers the current month
    pub fn is_active(&self, member: &MemberRecord) -> bool {
        decode(&member.entitlement).contains(&self.current_month)
    }

    pub fn active_count(&self) -> usize {
        self.members.iter().filter(|m| self.is_active(m)).count()
    }

    pub fn apply_log_filter(&mut self, filter: LogFilter) {
        self.log_filter = filter;
        self.filtered_log = self
            .log
            .iter()
            .filter(|e| filter.accepts(e))
            .cloned()
            .collect();

        if self.filtered_log.is_empty() {
            self.log_state.select(None);
        } else {
            self.log_state.select(Some(0));
        }
    }

    fn active_len_and_state(&mut self) -> (usize, &mut TableState) {
        match self.current_page {
            Page::Members => (self.members.len(), &mut self.member_state),
            Page::TransactionLog => (self.filtered_log.len(), &mut self.log_state),
        }
    }

    pub fn next(&mut self) {
        let (len, state) = self.active_len_and_state();
        if len == 0 {
            return;
        }
        let i = match state.selected() {
            Some(i) if i + 1 < len => i + 1,
            _ => 0,
        };
        state.select(Some(i));
    }

    pub fn previous(&mut self) {
        let (len, state) = self.active_len_and_state();
        if len == 0 {
            return;
        }
        let i = match state.selected() {
            Some(0) | None => len - 1,
            Some(i) => i - 1,
        };
        state.select(Some(i));
    }

    pub fn page_down(&mut self) {
        let (len, state) = self.active_len_and_state();
        if len == 0 {
            return;
        }
        let i = state.selected().map_or(0, |i| (i + 20).min(len - 1));
        state.select(Some(i));
    }

    pub fn page_up(&mut self) {
        let (_, state) = self.active_len_and_state();
        let i = state.selected().map_or(0, |i| i.saturating_sub(20));
        state.select(Some(i));
    }

    pub fn selected_member(&self) -> Option<&MemberRecord> {
        self.member_state.selected().and_then(|i| self.members.get(i))
    }

    pub fn selected_log_entry(&self) -> Option<&LogEntry> {
        self.log_state.selected().and_then(|i| self.filtered_log.get(i))
    }
}

pub fn run_ui(app: &mut App) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Run the app
    let res = run_app(&mut terminal, app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {:?}", err);
    }

    Ok(())
}

fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
) -> io::Result<()> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        if let Event::Key(key) = event::read()? {
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return Ok(()),
                KeyCode::Enter => app.toggle_detail(),
                KeyCode::Tab | KeyCode::BackTab => app.next_page(),
                KeyCode::Char('1') if app.current_page == Page::TransactionLog => {
                    app.apply_log_filter(LogFilter::All)
                }
                KeyCode::Char('2') if app.current_page == Page::TransactionLog => {
                    app.apply_log_filter(LogFilter::Success)
                }
                KeyCode::Char('3') if app.current_page == Page::TransactionLog => {
                    app.apply_log_filter(LogFilter::NotFound)
                }
                KeyCode::Down | KeyCode::Char('j') => app.next(),
                KeyCode::Up | KeyCode::Char('k') => app.previous(),
                KeyCode::PageDown => app.page_down(),
                KeyCode::PageUp => app.page_up(),
                _ => {}
            }
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header with navigation
            Constraint::Min(0),    // Content area
            Constraint::Length(3), // Status bar
        ])
        .split(f.size());

    render_header(f, chunks[0], app);

    let content = if app.show_detail {
        let content_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(chunks[1]);
        render_detail_panel(f, content_chunks[1], app);
        content_chunks[0]
    } else {
        chunks[1]
    };

    match app.current_page {
        Page::Members => render_members(f, content, app),
        Page::TransactionLog => render_log(f, content, app),
    }

    render_status_bar(f, chunks[2], app);
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let mut spans = vec![];
    for (i, page) in [Page::Members, Page::TransactionLog].iter().enumerate() {
        if i > 0 {
            spans.push(Span::raw(" │ "));
        }

        let style = if *page == app.current_page {
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD | Modifier::UNDERLINED)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        spans.push(Span::styled(page.title().to_string(), style));
    }

    spans.push(Span::raw("  |  "));
    spans.push(Span::styled(
        format!("Members: {}", app.members.len()),
        Style::default().fg(Color::White),
    ));
    spans.push(Span::raw("  "));
    spans.push(Span::styled(
        format!("Active {}: {}", app.current_month, app.active_count()),
        Style::default().fg(Color::Green),
    ));
    spans.push(Span::raw("  |  "));
    spans.push(Span::styled(
        format!("Log rows: {}", app.log.len()),
        Style::default().fg(Color::Cyan),
    ));

    let header = Paragraph::new(vec![Line::from(spans)])
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::Cyan)));

    f.render_widget(header, area);
}

fn header_row(titles: &[&'static str]) -> Row<'static> {
    let cells = titles.iter().map(|h| {
        Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    });
    Row::new(cells).style(Style::default().bg(Color::DarkGray)).height(1)
}

fn render_members(f: &mut Frame, area: Rect, app: &mut App) {
    let rows: Vec<Row> = app
        .members
        .iter()
        .map(|m| {
            let color = if app.is_active(m) { Color::Green } else { Color::Red };
            Row::new(vec![
                Cell::from(m.member_id.clone()),
                Cell::from(truncate(&m.name, 24)),
                Cell::from(truncate(&m.aliases, 24)),
                Cell::from(m.entitlement.clone()).style(Style::default().fg(color)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(10),
            Constraint::Length(26),
            Constraint::Length(26),
            Constraint::Min(20),
        ],
    )
    .header(header_row(&["ID", "Name", "Aliases", "Entitlement"]))
    .block(Block::default().borders(Borders::ALL).title(" Members "))
    .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut app.member_state);
}

fn render_log(f: &mut Frame, area: Rect, app: &mut App) {
    let rows: Vec<Row> = app
        .filtered_log
        .iter()
        .map(|e| {
            let color = if e.status.starts_with("Success") { Color::Green } else { Color::Yellow };
            Row::new(vec![
                Cell::from(e.record.timestamp.clone()),
                Cell::from(truncate(&e.record.sender_name, 24)),
                Cell::from(e.record.amount.clone()),
                Cell::from(e.record.transfer_time.clone()),
                Cell::from(e.status.clone()).style(Style::default().fg(color)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(20),
            Constraint::Length(26),
            Constraint::Length(8),
            Constraint::Length(10),
            Constraint::Min(20),
        ],
    )
    .header(header_row(&["Timestamp", "Sender", "Amount", "Time", "Status"]))
    .block(Block::default().borders(Borders::ALL).title(" Transaction Log "))
    .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut app.log_state);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &mut App) {
    let (len, state) = app.active_len_and_state();
    let selected = state.selected().map(|i| i + 1).unwrap_or(0);

    let mut spans = vec![Span::styled(
        format!(" Row: {}/{} ", selected, len),
        Style::default().fg(Color::Cyan),
    )];

    if app.current_page == Page::TransactionLog {
        spans.push(Span::raw(" | "));
        spans.push(Span::styled(
            format!("Filter: {}", app.log_filter.label()),
            Style::default().fg(Color::Green),
        ));
        spans.push(Span::raw(" ("));
        spans.push(Span::styled("1/2/3", Style::default().fg(Color::Yellow)));
        spans.push(Span::raw(")"));
    }

    spans.push(Span::raw(" | "));
    spans.push(Span::styled("Enter", Style::default().fg(Color::Yellow)));
    spans.push(Span::raw(" Details | "));
    spans.push(Span::styled("Tab", Style::default().fg(Color::Yellow)));
    spans.push(Span::raw(" Page | "));
    spans.push(Span::styled("↑/↓", Style::default().fg(Color::Yellow)));
    spans.push(Span::raw(" Nav | "));
    spans.push(Span::styled("q", Style::default().fg(Color::Red)));
    spans.push(Span::raw(" Quit"));

    let status_bar = Paragraph::new(vec![Line::from(spans)])
        .block(Block::default().borders(Borders::ALL));

    f.render_widget(status_bar, area);
}

fn render_detail_panel(f: &mut Frame, area: Rect, app: &App) {
    let label = Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD);
    let mut lines: Vec<Line> = Vec::new();

    match app.current_page {
        Page::Members => {
            if let Some(m) = app.selected_member() {
                let covered = decode(&m.entitlement);
                lines.push(Line::from(vec![Span::styled("ID: ", label), Span::raw(m.member_id.clone())]));
                lines.push(Line::from(vec![Span::styled("Name: ", label), Span::raw(m.name.clone())]));
                lines.push(Line::from(vec![Span::styled("Aliases: ", label), Span::raw(m.aliases.clone())]));
                lines.push(Line::from(""));
                lines.push(Line::from(vec![Span::styled("Stored: ", label), Span::raw(m.entitlement.clone())]));
                lines.push(Line::from(vec![
                    Span::styled("Canonical: ", label),
                    Span::raw(covered.to_string()),
                ]));
                lines.push(Line::from(vec![
                    Span::styled("Months covered: ", label),
                    Span::raw(covered.len().to_string()),
                ]));
                let latest = covered
                    .latest()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string());
                lines.push(Line::from(vec![Span::styled("Paid through: ", label), Span::raw(latest)]));
                let status = if app.is_active(m) {
                    Span::styled("ACTIVE", Style::default().fg(Color::Green))
                } else {
                    Span::styled("LAPSED", Style::default().fg(Color::Red))
                };
                lines.push(Line::from(vec![Span::styled("Status: ", label), status]));
            }
        }
        Page::TransactionLog => {
            if let Some(e) = app.selected_log_entry() {
                let r = &e.record;
                lines.push(Line::from(vec![Span::styled("Submission: ", label), Span::raw(r.id.clone())]));
                lines.push(Line::from(vec![Span::styled("Submitted: ", label), Span::raw(r.timestamp.clone())]));
                lines.push(Line::from(vec![Span::styled("Sender: ", label), Span::raw(r.sender_name.clone())]));
                lines.push(Line::from(vec![Span::styled("Amount: ", label), Span::raw(r.amount.clone())]));
                lines.push(Line::from(vec![Span::styled("Slip time: ", label), Span::raw(r.transfer_time.clone())]));
                lines.push(Line::from(vec![Span::styled("Status: ", label), Span::raw(e.status.clone())]));
                lines.push(Line::from(""));
                lines.push(Line::from(vec![Span::styled("Slip SHA-256: ", label)]));
                lines.push(Line::from(r.slip_fingerprint.clone()));
            }
        }
    }

    let panel = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title(" Details "));

    f.render_widget(panel, area);
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
