use crate::client::{ChatSession, SendError};
use crate::protocol::Message;
use crate::store::{MessageStatus, MessageStore, StoreEvent};
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use futures::{FutureExt, Stream, StreamExt};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io;
use std::io::Write;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 5;
const LIVE_HEIGHT: u16 = 10;
const NOTICE_TTL: Duration = Duration::from_secs(4);
const SEND_FAILED_NOTICE: &str = "Something went wrong. Please try again.";

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

#[derive(Debug, Clone)]
struct LineSpec {
    text: String,
    style: Style,
}

impl LineSpec {
    fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

fn message_lines(message: &Message, status: &MessageStatus) -> Vec<LineSpec> {
    let color = if message.is_user_message {
        Color::Blue
    } else {
        Color::Yellow
    };
    let header = if message.is_user_message {
        "You:"
    } else {
        "Assistant:"
    };

    let mut lines = vec![LineSpec::new(
        header,
        Style::default().fg(color).add_modifier(Modifier::BOLD),
    )];
    for line in message.text.lines() {
        lines.push(LineSpec::new(
            format!("  {}", line),
            Style::default().fg(color),
        ));
    }
    if let MessageStatus::Failed(reason) = status {
        lines.push(LineSpec::new(
            format!("  [response interrupted: {}]", reason),
            Style::default().fg(Color::Red).add_modifier(Modifier::ITALIC),
        ));
    }
    lines
}

fn to_text(lines: Vec<LineSpec>) -> Text<'static> {
    Text::from(
        lines
            .into_iter()
            .map(|spec| Line::from(Span::styled(spec.text, spec.style)))
            .collect::<Vec<_>>(),
    )
}

fn rendered_height(lines: &[LineSpec], width: u16) -> u16 {
    let width = width.max(1) as usize;
    let total: usize = lines
        .iter()
        .map(|line| line.text.chars().count().max(1).div_ceil(width))
        .sum();
    total.min(u16::MAX as usize) as u16
}

/// How many leading messages can go to scrollback. Scrollback cannot be
/// edited, so a message still streaming, and a user message whose send has
/// not produced a reply yet, stay in the live area.
fn settled_len(store: &MessageStore, snapshot: &[Message], sending: bool) -> usize {
    let mut settled = snapshot
        .iter()
        .position(|message| store.status(&message.id) == Some(MessageStatus::Streaming))
        .unwrap_or(snapshot.len());

    if sending && settled == snapshot.len() {
        if let Some(last) = snapshot.last() {
            if last.is_user_message {
                settled -= 1;
            }
        }
    }
    settled
}

/// Terminal cell for the input cursor, kept inside the box border even when
/// the box is too small to hold it.
fn cursor_position(area: Rect, cursor_x: usize, cursor_y: usize) -> (u16, u16) {
    let column = u16::try_from(cursor_x.saturating_add(1)).unwrap_or(u16::MAX);
    let row = u16::try_from(cursor_y.saturating_add(1)).unwrap_or(u16::MAX);
    let max_x = area.x + area.width.saturating_sub(2);
    let max_y = area.y + area.height.saturating_sub(2);
    (
        area.x.saturating_add(column).min(max_x),
        area.y.saturating_add(row).min(max_y),
    )
}

#[derive(Debug)]
enum UiEvent {
    SendFinished(Result<(), SendError>),
}

struct InputBuffer {
    lines: Vec<String>,
    // Cursor column counts characters, not bytes.
    cursor_x: usize,
    cursor_y: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    fn clear(&mut self) {
        self.lines = vec![String::new()];
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn line_len(&self, y: usize) -> usize {
        self.lines[y].chars().count()
    }

    fn byte_offset(&self) -> usize {
        let line = &self.lines[self.cursor_y];
        line.char_indices()
            .nth(self.cursor_x)
            .map(|(idx, _)| idx)
            .unwrap_or(line.len())
    }

    fn insert_char(&mut self, c: char) {
        let offset = self.byte_offset();
        self.lines[self.cursor_y].insert(offset, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
            let offset = self.byte_offset();
            self.lines[self.cursor_y].remove(offset);
        } else if self.cursor_y > 0 {
            let current = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
            self.lines[self.cursor_y].push_str(&current);
        }
    }

    fn new_line(&mut self) {
        let offset = self.byte_offset();
        let remaining = self.lines[self.cursor_y].split_off(offset);
        self.lines.insert(self.cursor_y + 1, remaining);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
        }
    }

    fn move_right(&mut self) {
        if self.cursor_x < self.line_len(self.cursor_y) {
            self.cursor_x += 1;
        } else if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn move_up(&mut self) {
        if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn move_down(&mut self) {
        if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is_blank(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }

    fn render(&self, disabled: bool) -> Text<'static> {
        if self.lines.iter().all(|l| l.is_empty()) {
            return Text::from(Span::styled(
                "Type your message here...",
                Style::default().fg(Color::DarkGray),
            ));
        }
        let style = if disabled {
            Style::default().fg(Color::DarkGray)
        } else {
            Style::default()
        };
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::styled(l.clone(), style))
                .collect::<Vec<_>>(),
        )
    }
}

pub struct App {
    session: ChatSession,
    updates: Pin<Box<dyn Stream<Item = StoreEvent> + Send>>,
    dirty: bool,
    input: InputBuffer,
    should_quit: bool,
    sender: mpsc::Sender<UiEvent>,
    receiver: mpsc::Receiver<UiEvent>,
    sending: bool,
    cancel: Option<watch::Sender<bool>>,
    printed: usize,
    notice: Option<(String, Instant)>,
}

impl App {
    pub fn new(session: ChatSession) -> Self {
        let (sender, receiver) = mpsc::channel(16);

        let updates = Box::pin(session.store().subscribe());

        Self {
            session,
            updates,
            dirty: true,
            input: InputBuffer::new(),
            should_quit: false,
            sender,
            receiver,
            sending: false,
            cancel: None,
            printed: 0,
            notice: None,
        }
    }

    fn store(&self) -> &MessageStore {
        self.session.store()
    }

    /// Drains store events that are already queued; any of them means the
    /// screen is stale.
    fn drain_updates(&mut self) {
        while let Some(Some(_event)) = self.updates.next().now_or_never() {
            self.dirty = true;
        }
    }

    fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn draw(&mut self, f: &mut Frame) {
        let [live_area, input_area] =
            Layout::vertical([Constraint::Min(0), Constraint::Length(INPUT_HEIGHT)])
                .areas(f.area());

        let snapshot = self.store().snapshot();
        let mut live = Vec::new();
        for message in snapshot.iter().skip(self.printed) {
            let status = self
                .store()
                .status(&message.id)
                .unwrap_or(MessageStatus::Complete);
            live.extend(message_lines(message, &status));
        }
        // Keep the newest lines in view while a reply grows.
        let overflow = rendered_height(&live, live_area.width)
            .saturating_sub(live_area.height);
        f.render_widget(
            Paragraph::new(to_text(live))
                .wrap(Wrap { trim: false })
                .scroll((overflow, 0)),
            live_area,
        );

        let streaming = self.store().is_streaming();
        let title = match &self.notice {
            Some((notice, _)) => format!(" {} ", notice),
            None if streaming => " Input (Esc to stop) [Streaming...] ".to_string(),
            None if self.sending => " Input [Sending...] ".to_string(),
            None => " Input (Enter to send, Esc to quit) ".to_string(),
        };
        let border = if self.notice.is_some() {
            Color::Red
        } else {
            Color::DarkGray
        };

        let input_paragraph = Paragraph::new(self.input.render(self.sending))
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(border)),
            )
            .wrap(Wrap { trim: false });
        f.render_widget(input_paragraph, input_area);

        if !self.sending {
            f.set_cursor_position(cursor_position(
                input_area,
                self.input.cursor_x,
                self.input.cursor_y,
            ));
        }
    }

    /// Moves settled messages into the terminal's scrollback.
    fn flush_settled(&mut self, terminal: &mut TuiTerminal) -> UiResult<()> {
        let snapshot = self.session.store().snapshot();
        let settled = settled_len(self.store(), &snapshot, self.sending);

        while self.printed < settled {
            let message = &snapshot[self.printed];
            let status = self
                .store()
                .status(&message.id)
                .unwrap_or(MessageStatus::Complete);
            let lines = message_lines(message, &status);

            let width = terminal.size()?.width;
            let height = rendered_height(&lines, width).saturating_add(1);
            let mut text = to_text(lines);
            text.extend(Text::raw("\n"));
            // Insert above the inline viewport so the log stays in scrollback.
            terminal.insert_before(height, |buf| {
                let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
                paragraph.render(buf.area, buf);
            })?;
            self.printed += 1;
        }
        Ok(())
    }

    fn start_send(&mut self) {
        let text = self.input.text();
        let (cancel, cancel_rx) = watch::channel(false);
        self.cancel = Some(cancel);
        self.sending = true;
        self.notice = None;

        let session = self.session.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = session.send(text, Some(cancel_rx)).await.map(|_| ());
            let _ = sender.send(UiEvent::SendFinished(result)).await;
        });
    }

    fn finish_send(&mut self, result: Result<(), SendError>) {
        self.sending = false;
        self.cancel = None;

        match result {
            Ok(()) => self.input.clear(),
            Err(SendError::Network(reason)) => {
                tracing::warn!(error = %reason, "message not sent");
                self.notice = Some((SEND_FAILED_NOTICE.to_string(), Instant::now()));
            }
            Err(SendError::Stream(reason)) => {
                tracing::warn!(error = %reason, "response interrupted");
                self.input.clear();
                self.notice = Some(("The response was interrupted.".to_string(), Instant::now()));
            }
            Err(err) => {
                tracing::error!(error = %err, "send failed");
                self.notice = Some((SEND_FAILED_NOTICE.to_string(), Instant::now()));
            }
        }
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> UiResult<bool> {
        while let Ok(event) = self.receiver.try_recv() {
            match event {
                UiEvent::SendFinished(result) => self.finish_send(result),
            }
            self.dirty = true;
        }
        self.drain_updates();

        if let Some((_, shown_at)) = &self.notice {
            if shown_at.elapsed() > NOTICE_TTL {
                self.notice = None;
                self.dirty = true;
            }
        }

        self.flush_settled(terminal)?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                self.dirty = true;
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c')
                {
                    self.should_quit = true;
                    return Ok(false);
                }

                if key.code == KeyCode::Esc {
                    match &self.cancel {
                        Some(cancel) => {
                            let _ = cancel.send(true);
                        }
                        None => {
                            self.should_quit = true;
                            return Ok(false);
                        }
                    }
                    return Ok(true);
                }

                // Input is disabled until the current reply has finished.
                if self.sending {
                    return Ok(true);
                }

                match key.code {
                    KeyCode::Enter => {
                        if key.modifiers.contains(KeyModifiers::SHIFT) {
                            self.input.new_line();
                        } else if !self.input.is_blank() {
                            self.start_send();
                        }
                    }
                    KeyCode::Char(c) => {
                        self.input.insert_char(c);
                    }
                    KeyCode::Backspace => {
                        self.input.delete_char();
                    }
                    KeyCode::Left => {
                        self.input.move_left();
                    }
                    KeyCode::Right => {
                        self.input.move_right();
                    }
                    KeyCode::Up => {
                        self.input.move_up();
                    }
                    KeyCode::Down => {
                        self.input.move_down();
                    }
                    KeyCode::Home => {
                        self.input.cursor_x = 0;
                    }
                    KeyCode::End => {
                        self.input.cursor_x = self.input.line_len(self.input.cursor_y);
                    }
                    _ => {}
                }
            }
        }

        Ok(true)
    }
}

pub fn run_tui(session: ChatSession) -> UiResult<()> {
    enable_raw_mode()?;
    let _guard = TerminalGuard;

    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(INPUT_HEIGHT + LIVE_HEIGHT),
        },
    )?;

    let mut app = App::new(session);
    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        if !app.handle_events(&mut terminal)? {
            break;
        }

        if app.take_dirty() {
            terminal.draw(|f| app.draw(f))?;
        }

        std::thread::sleep(Duration::from_millis(10));
    }

    // Leaving the chat tears the conversation down.
    app.store().clear();
    terminal.clear()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, is_user_message: bool, text: &str) -> Message {
        Message {
            id: id.to_string(),
            is_user_message,
            text: text.to_string(),
        }
    }

    #[test]
    fn cursor_stays_inside_the_input_box() {
        let area = Rect::new(0, 10, 20, 3);
        assert_eq!(cursor_position(area, 4, 0), (5, 11));
        assert_eq!(cursor_position(area, 500, 7), (18, 11));
    }

    #[test]
    fn cursor_on_a_degenerate_box_does_not_underflow() {
        assert_eq!(cursor_position(Rect::new(3, 4, 1, 1), 0, 0), (3, 4));
        assert_eq!(cursor_position(Rect::new(0, 0, 0, 0), usize::MAX, usize::MAX), (0, 0));
    }

    #[test]
    fn fresh_reply_placeholder_stays_live() {
        let store = MessageStore::new();
        store.add(message("1", true, "hi")).unwrap();
        store
            .add_with_status(message("2", false, ""), MessageStatus::Streaming)
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(settled_len(&store, &snapshot, true), 1);
        assert_eq!(settled_len(&store, &snapshot, false), 1);
    }

    #[test]
    fn input_buffer_shift_enter_inserts_new_line() {
        let mut buffer = InputBuffer::new();
        for ch in "hello".chars() {
            buffer.insert_char(ch);
        }
        buffer.new_line();
        for ch in "world".chars() {
            buffer.insert_char(ch);
        }

        assert_eq!(buffer.text(), "hello\nworld");
        assert_eq!(buffer.lines.len(), 2);
        assert_eq!(buffer.cursor_y, 1);
    }

    #[test]
    fn input_buffer_edits_multibyte_text() {
        let mut buffer = InputBuffer::new();
        for ch in "año".chars() {
            buffer.insert_char(ch);
        }
        buffer.move_left();
        buffer.delete_char();
        buffer.insert_char('n');
        assert_eq!(buffer.text(), "ano");

        buffer.move_left();
        buffer.new_line();
        assert_eq!(buffer.lines, vec!["a".to_string(), "no".to_string()]);
    }

    #[test]
    fn streaming_and_tentative_messages_stay_live() {
        let store = MessageStore::new();
        store.add(message("1", true, "hi")).unwrap();
        store.add(message("2", false, "hello")).unwrap();
        store.add(message("3", true, "pending")).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(settled_len(&store, &snapshot, false), 3);
        assert_eq!(settled_len(&store, &snapshot, true), 2);

        store.add(message("4", false, "str")).unwrap();
        store.set_status("4", MessageStatus::Streaming).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(settled_len(&store, &snapshot, true), 3);
    }

    #[test]
    fn failed_reply_renders_interruption_line() {
        let lines = message_lines(
            &message("a", false, "partial"),
            &MessageStatus::Failed("reset".to_string()),
        );
        let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Assistant:", "  partial", "  [response interrupted: reset]"]
        );
    }

    #[test]
    fn rendered_height_wraps_by_width() {
        let lines = vec![
            LineSpec::new("abcdef", Style::default()),
            LineSpec::new("", Style::default()),
        ];
        assert_eq!(rendered_height(&lines, 4), 3);
    }
}
