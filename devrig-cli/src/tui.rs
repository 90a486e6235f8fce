//! Tabbed terminal session over a running commander.
//!
//! One tab per child command plus a leading "status" tab that carries
//! lifecycle banners and build output. A background input pump and the
//! per-stream line scanners all feed a single event channel; the render
//! loop consumes it serially, so tab state never needs a lock.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers, MouseEvent, MouseEventKind,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Tabs};
use ratatui::{Frame, Terminal};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use devrig_core::command::{Command, OutputReader};
use devrig_core::commander::Commander;
use devrig_core::error::RigError;
use devrig_core::linebuf::LineBuffer;
use devrig_core::pipe::PipeReader;

/// One output tab's worth of streams, taken from a command before it goes
/// into the commander. Tree subordinates get their own source, so watch
/// tasks show up as tabs even though the commander only sees the tree.
pub struct TabSource {
    pub title: String,
    pub stdout: Option<OutputReader>,
    pub stderr: Option<OutputReader>,
}

impl TabSource {
    pub fn from_command(command: &dyn Command) -> Self {
        Self {
            title: command.name().to_string(),
            stdout: command.stdout(),
            stderr: command.stderr(),
        }
    }
}

#[derive(Debug)]
pub enum UiEvent {
    /// A line landed in the given tab's buffer.
    Update { tab: usize },
    Started,
    Restarted,
    Stopped,
    /// Non-fatal notice for the status tab.
    Banner(String),
    /// Lifecycle failure; the session tears the commander down and exits.
    Fatal(String),
    Key(KeyEvent),
    Mouse(MouseEvent),
    Resize(u16, u16),
    Tick,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Starting,
    Running,
    Restarting,
    Stopping,
}

impl Lifecycle {
    fn indicator(self) -> (&'static str, &'static str, Color) {
        match self {
            Lifecycle::Starting => ("◐", "starting", Color::Yellow),
            Lifecycle::Running => ("●", "running", Color::Green),
            Lifecycle::Restarting => ("⟲", "restarting", Color::Yellow),
            Lifecycle::Stopping => ("○", "stopping", Color::DarkGray),
        }
    }
}

struct Tab {
    title: String,
    buf: Arc<LineBuffer>,
    /// Distance from the buffer tail; 0 is the tail itself.
    scroll: usize,
    follow: bool,
}

impl Tab {
    fn new(title: impl Into<String>, width: usize) -> Self {
        Self {
            title: title.into(),
            buf: Arc::new(LineBuffer::new(width)),
            scroll: 0,
            follow: true,
        }
    }

    fn scroll_up(&mut self, lines: usize) {
        let len = self.buf.len();
        if len == 0 {
            return;
        }
        self.follow = false;
        self.scroll = (self.scroll + lines).min(len - 1);
    }

    /// Landing back on the exact tail re-engages follow.
    fn scroll_down(&mut self, lines: usize) {
        self.scroll = self.scroll.saturating_sub(lines);
        if self.scroll == 0 {
            self.follow = true;
        }
    }

    fn clamp(&mut self) {
        let len = self.buf.len();
        if self.scroll >= len {
            self.scroll = len.saturating_sub(1);
        }
    }
}

pub struct TuiSession {
    commander: Arc<Commander>,
    tabs: Vec<Tab>,
    active: usize,
    lifecycle: Lifecycle,
    /// Mouse capture off so the terminal's own text selection works.
    selection: bool,
    ready: bool,
    viewport_height: usize,
    events: UnboundedReceiver<UiEvent>,
    tx: UnboundedSender<UiEvent>,
}

const INITIAL_WIDTH: usize = 80;
const STATUS_TAB: usize = 0;

impl TuiSession {
    /// Builds the tab set and wires every output source into the event
    /// channel. Scanners start immediately so no early output is lost;
    /// `build_output` feeds the status tab.
    pub fn new(
        commander: Arc<Commander>,
        sources: Vec<TabSource>,
        build_output: PipeReader,
    ) -> Self {
        let (tx, events) = unbounded_channel();

        let mut tabs = vec![Tab::new("status", INITIAL_WIDTH)];
        spawn_scanner(
            STATUS_TAB,
            Arc::clone(&tabs[STATUS_TAB].buf),
            build_output,
            tx.clone(),
        );

        for source in sources {
            let tab = Tab::new(source.title, INITIAL_WIDTH);
            let index = tabs.len();
            if let Some(stdout) = source.stdout {
                spawn_scanner(index, Arc::clone(&tab.buf), stdout, tx.clone());
            }
            if let Some(stderr) = source.stderr {
                spawn_scanner(index, Arc::clone(&tab.buf), stderr, tx.clone());
            }
            tabs.push(tab);
        }

        Self {
            commander,
            tabs,
            active: STATUS_TAB,
            lifecycle: Lifecycle::Starting,
            selection: false,
            ready: false,
            viewport_height: 0,
            events,
            tx,
        }
    }

    /// Runs the session to completion: sets up the terminal, starts the
    /// commander, consumes events until the commander is done, restores the
    /// terminal.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut terminal = setup_terminal()?;

        self.spawn_start();
        self.spawn_done_monitor();
        spawn_input_pump(self.tx.clone());
        self.banner(STATUS_TAB, "starting");

        // The first size is known before the loop; the first draw does not
        // wait for a resize event.
        let size = terminal.size()?;
        self.apply_resize(size.width, size.height);

        let result = self.event_loop(&mut terminal).await;

        restore_terminal(&mut terminal)?;
        result
    }

    async fn event_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    ) -> anyhow::Result<()> {
        loop {
            let Some(event) = self.events.recv().await else {
                return Ok(());
            };
            if self.handle(event)? {
                return Ok(());
            }
            // Drain whatever else queued up so one draw covers the batch.
            while let Ok(event) = self.events.try_recv() {
                if self.handle(event)? {
                    return Ok(());
                }
            }
            if self.ready {
                terminal.draw(|frame| self.render(frame))?;
            }
        }
    }

    /// Applies one event; `Ok(true)` ends the session.
    fn handle(&mut self, event: UiEvent) -> io::Result<bool> {
        match event {
            UiEvent::Update { .. } | UiEvent::Tick => {}
            UiEvent::Started | UiEvent::Restarted => {
                if self.lifecycle != Lifecycle::Stopping {
                    self.lifecycle = Lifecycle::Running;
                    self.banner(STATUS_TAB, "running");
                }
            }
            UiEvent::Stopped => return Ok(true),
            UiEvent::Banner(text) => {
                self.tabs[STATUS_TAB].buf.push(&text);
            }
            UiEvent::Fatal(message) => {
                self.tabs[STATUS_TAB].buf.push(&format!("error: {message}"));
                self.begin_stop();
            }
            UiEvent::Key(key) => return self.handle_key(key),
            UiEvent::Mouse(mouse) => self.handle_mouse(mouse),
            UiEvent::Resize(width, height) => self.apply_resize(width, height),
        }
        Ok(false)
    }

    fn handle_key(&mut self, key: KeyEvent) -> io::Result<bool> {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') if ctrl => self.begin_stop(),
            KeyCode::Char('r') if ctrl => self.begin_restart(),
            KeyCode::Char('s') if ctrl => self.toggle_selection()?,
            KeyCode::Tab => {
                self.active = (self.active + 1) % self.tabs.len();
                self.tabs[self.active].clamp();
            }
            KeyCode::BackTab => {
                self.active = self.active.checked_sub(1).unwrap_or(self.tabs.len() - 1);
                self.tabs[self.active].clamp();
            }
            KeyCode::Esc => {
                let tab = &mut self.tabs[self.active];
                tab.follow = true;
                tab.scroll = 0;
            }
            KeyCode::Up => self.tabs[self.active].scroll_up(1),
            KeyCode::Down => self.tabs[self.active].scroll_down(1),
            KeyCode::PageUp => {
                let page = self.viewport_height.max(1);
                self.tabs[self.active].scroll_up(page);
            }
            KeyCode::PageDown => {
                let page = self.viewport_height.max(1);
                self.tabs[self.active].scroll_down(page);
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_mouse(&mut self, mouse: MouseEvent) {
        match mouse.kind {
            MouseEventKind::ScrollUp => self.tabs[self.active].scroll_up(1),
            MouseEventKind::ScrollDown => self.tabs[self.active].scroll_down(1),
            _ => {}
        }
    }

    /// Stop is always available, even mid-start; the quit happens when the
    /// commander's done signal comes back as [`UiEvent::Stopped`].
    fn begin_stop(&mut self) {
        if self.lifecycle == Lifecycle::Stopping {
            return;
        }
        self.lifecycle = Lifecycle::Stopping;
        self.banner_all("stopping");
        let commander = Arc::clone(&self.commander);
        tokio::spawn(async move {
            let _ = commander.shutdown().await;
        });
    }

    fn begin_restart(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        self.lifecycle = Lifecycle::Restarting;
        self.banner_all("restarting");
        let commander = Arc::clone(&self.commander);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match commander.restart().await {
                Ok(()) => {
                    let _ = tx.send(UiEvent::Restarted);
                }
                Err(RigError::InProgress(op)) => {
                    // Nothing changed; fall back to the running state.
                    let _ = tx.send(UiEvent::Banner(format!("{op} already in progress")));
                    let _ = tx.send(UiEvent::Restarted);
                }
                // A quit won the race; the stop path owns the session now.
                Err(RigError::Done) => {}
                Err(err) => {
                    let _ = tx.send(UiEvent::Fatal(err.to_string()));
                }
            }
        });
    }

    fn toggle_selection(&mut self) -> io::Result<()> {
        self.selection = !self.selection;
        if self.selection {
            execute!(io::stdout(), DisableMouseCapture)?;
        } else {
            execute!(io::stdout(), EnableMouseCapture)?;
        }
        Ok(())
    }

    fn apply_resize(&mut self, width: u16, height: u16) {
        // Tabs header (3) + footer (1) + content borders (2).
        self.viewport_height = usize::from(height).saturating_sub(6);
        let content_width = usize::from(width).saturating_sub(2);
        for tab in &mut self.tabs {
            tab.buf.set_width(content_width);
            tab.clamp();
        }
        if !self.ready {
            self.ready = true;
            debug!(width, height, "first terminal size");
        }
    }

    fn spawn_start(&self) {
        let commander = Arc::clone(&self.commander);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match commander.start().await {
                Ok(()) => {
                    let _ = tx.send(UiEvent::Started);
                }
                Err(err) => {
                    let _ = tx.send(UiEvent::Fatal(err.to_string()));
                }
            }
        });
    }

    fn spawn_done_monitor(&self) {
        let done = self.commander.done();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            done.wait().await;
            let _ = tx.send(UiEvent::Stopped);
        });
    }

    fn banner(&self, tab: usize, text: &str) {
        self.tabs[tab].buf.push(&format!("== {text} =="));
    }

    fn banner_all(&self, text: &str) {
        for tab in 0..self.tabs.len() {
            self.banner(tab, text);
        }
    }

    fn render(&self, frame: &mut Frame<'_>) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(1),
                Constraint::Length(1),
            ])
            .split(frame.area());

        let (icon, label, color) = self.lifecycle.indicator();
        let titles = self
            .tabs
            .iter()
            .map(|tab| Line::from(tab.title.clone()))
            .collect::<Vec<Line>>();
        let tabs = Tabs::new(titles)
            .select(self.active)
            .block(
                Block::default().borders(Borders::ALL).title(Span::styled(
                    format!(" {icon} {label} "),
                    Style::default().fg(color).add_modifier(Modifier::BOLD),
                )),
            )
            .highlight_style(
                Style::default()
                    .fg(Color::Magenta)
                    .add_modifier(Modifier::BOLD),
            );
        frame.render_widget(tabs, chunks[0]);

        let tab = &self.tabs[self.active];
        let len = tab.buf.len();
        let offset = if tab.follow { 0 } else { tab.scroll };
        let (start, end) = visible_range(len, self.viewport_height, offset);
        let content = Paragraph::new(tab.buf.lines(start, end).join("\n")).block(
            Block::default()
                .borders(Borders::ALL)
                .title(tab.title.clone()),
        );
        frame.render_widget(content, chunks[1]);

        let footer = Paragraph::new(format!(
            "tab switch | esc follow | ctrl-r restart | ctrl-s select | ctrl-c quit   \
             [follow {}] [select {}]",
            on_off(tab.follow),
            on_off(self.selection),
        ))
        .style(Style::default().fg(Color::DarkGray));
        frame.render_widget(footer, chunks[2]);
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

/// Window of `height` lines ending `offset` lines above the tail.
fn visible_range(len: usize, height: usize, offset: usize) -> (usize, usize) {
    let end = len.saturating_sub(offset);
    let start = end.saturating_sub(height);
    (start, end)
}

fn spawn_scanner(
    tab: usize,
    buf: Arc<LineBuffer>,
    reader: impl AsyncRead + Send + Unpin + 'static,
    tx: UnboundedSender<UiEvent>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            buf.push(&line);
            if tx.send(UiEvent::Update { tab }).is_err() {
                return;
            }
        }
    });
}

/// Reads terminal input on a 50 ms poll and forwards it as [`UiEvent`]s,
/// with a tick each round so the render loop never starves.
fn spawn_input_pump(tx: UnboundedSender<UiEvent>) {
    tokio::spawn(async move {
        let tick = Duration::from_millis(50);
        loop {
            if event::poll(tick).unwrap_or(false) {
                match event::read() {
                    Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                        let _ = tx.send(UiEvent::Key(key));
                    }
                    Ok(Event::Mouse(mouse)) => {
                        let _ = tx.send(UiEvent::Mouse(mouse));
                    }
                    Ok(Event::Resize(width, height)) => {
                        let _ = tx.send(UiEvent::Resize(width, height));
                    }
                    _ => {}
                }
            }
            if tx.send(UiEvent::Tick).is_err() {
                break;
            }
        }
    });
}

fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    terminal.hide_cursor()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}
