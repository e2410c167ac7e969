//! Main chat event loop and UI rendering
//!
//! The event loop is the single writer over the session store: key input,
//! streamed deltas, debounce ticks, and background task results all arrive
//! here and are applied in order.

use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use ratatui::crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
    Frame, Terminal,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

use crate::api::client::CompletionClient;
use crate::core::chat_stream::{ChatStreamService, StreamMessage, StreamParams};
use crate::core::constants::{DEFAULT_TITLE, SAVE_DEBOUNCE_MS, TITLE_DEBOUNCE_MS};
use crate::core::conversation::{ConversationController, TurnState};
use crate::core::debounce::Debouncer;
use crate::core::persistence::default_state_path;
use crate::core::session::SessionStore;
use crate::core::title::synthesize_title;

pub struct ChatLoopOptions {
    pub base_url: String,
    pub model: Option<String>,
    pub credential: Option<String>,
    pub state_path: Option<PathBuf>,
}

/// Events produced outside the key-input path: debounce ticks and results
/// of background tasks.
enum AppEvent {
    SaveRequested,
    TitleReady { session_id: String, title: String },
    ModelsLoaded(Vec<String>),
}

/// Which persisted setting the inline editor overlay is changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingKind {
    Temperature,
    SystemPrompt,
    Credential,
}

impl SettingKind {
    fn title(self) -> &'static str {
        match self {
            SettingKind::Temperature => " Temperature, 0 to 2 (Enter set, Esc cancel) ",
            SettingKind::SystemPrompt => " System prompt (Enter set, Esc cancel) ",
            SettingKind::Credential => " API credential, blank for anonymous (Enter set, Esc cancel) ",
        }
    }
}

struct SettingEditor {
    kind: SettingKind,
    value: String,
    error: Option<String>,
}

/// Modal overlay over the transcript. At most one is open at a time and it
/// captures all key input while open.
enum Overlay {
    SessionPicker(usize),
    ModelPicker(usize),
    Setting(SettingEditor),
}

struct App {
    store: SessionStore,
    turn: TurnState,
    client: CompletionClient,
    input: String,
    scroll_offset: u16,
    auto_scroll: bool,
    overlay: Option<Overlay>,
}

impl App {
    fn current_title(&self) -> String {
        self.store
            .current_session_id()
            .and_then(|id| self.store.session(id))
            .map(|s| s.title.clone())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string())
    }

    fn build_display_lines(&self) -> Vec<Line<'_>> {
        let mut lines = Vec::new();

        if !self.store.hydrated() {
            lines.push(Line::from(Span::styled(
                "Loading saved sessions...",
                Style::default().fg(Color::DarkGray),
            )));
            return lines;
        }

        for msg in self.store.messages() {
            if msg.is_user() {
                lines.push(Line::from(vec![
                    Span::styled(
                        "You: ",
                        Style::default()
                            .fg(Color::Cyan)
                            .add_modifier(Modifier::BOLD),
                    ),
                    Span::styled(msg.content.as_str(), Style::default().fg(Color::Cyan)),
                ]));
                lines.push(Line::from(""));
            } else if !msg.content.is_empty() {
                for content_line in msg.content.lines() {
                    lines.push(Line::from(Span::styled(
                        content_line,
                        Style::default().fg(Color::White),
                    )));
                }
                lines.push(Line::from(""));
            }
        }

        lines
    }

    fn calculate_max_scroll_offset(&self, available_height: u16) -> u16 {
        let total_lines = self.build_display_lines().len() as u16;
        total_lines.saturating_sub(available_height)
    }

    fn scroll_to_bottom(&mut self, available_height: u16) {
        if self.auto_scroll {
            self.scroll_offset = self.calculate_max_scroll_offset(available_height);
        }
    }
}

pub async fn run(opts: ChatLoopOptions) -> Result<(), Box<dyn Error>> {
    let state_path = opts.state_path.or_else(default_state_path);
    let mut store = SessionStore::new(state_path);
    store.hydrate();
    if let Some(id) = store.current_session_id().map(str::to_string) {
        store.load_session(&id);
    }
    if let Some(model) = opts.model {
        store.set_selected_model(model);
    }
    if let Some(credential) = opts.credential {
        store.set_credential(credential);
    }

    let credential = store.credential().to_string();
    let client = CompletionClient::new(opts.base_url, Some(credential));

    let mut app = App {
        store,
        turn: TurnState::default(),
        client,
        input: String::new(),
        scroll_offset: 0,
        auto_scroll: true,
        overlay: None,
    };

    let (stream_service, mut stream_rx) = ChatStreamService::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<AppEvent>();
    let mut save_debouncer = Debouncer::new();
    let mut title_debouncer = Debouncer::new();
    let cancel_token = CancellationToken::new();

    refresh_models(&app.client, &events_tx);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = loop {
        terminal.draw(|f| ui(f, &app))?;
        let available_height = transcript_height(&terminal);

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }

                if app.overlay.is_some() {
                    handle_overlay_key(&mut app, key.code, key.modifiers);
                    continue;
                }

                match key.code {
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        break Ok(());
                    }
                    KeyCode::Char('n') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        if !app.turn.is_streaming() {
                            app.store.save_current_session();
                            app.store.create_session();
                            app.turn.error = None;
                            app.scroll_offset = 0;
                        }
                    }
                    KeyCode::Char('p') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        if !app.turn.is_streaming() && !app.store.sessions().is_empty() {
                            app.overlay = Some(Overlay::SessionPicker(0));
                        }
                    }
                    KeyCode::Char('o') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        open_model_picker(&mut app);
                    }
                    KeyCode::Char('t') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        open_setting(&mut app, SettingKind::Temperature);
                    }
                    KeyCode::Char('s') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        open_setting(&mut app, SettingKind::SystemPrompt);
                    }
                    KeyCode::Char('k') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        open_setting(&mut app, SettingKind::Credential);
                    }
                    KeyCode::Char('r') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        refresh_models(&app.client, &events_tx);
                    }
                    KeyCode::Enter => {
                        send_message(&mut app, &stream_service, &cancel_token);
                    }
                    KeyCode::Up => {
                        app.auto_scroll = false;
                        app.scroll_offset = app.scroll_offset.saturating_sub(1);
                    }
                    KeyCode::Down => {
                        let max_scroll = app.calculate_max_scroll_offset(available_height);
                        app.scroll_offset = app.scroll_offset.saturating_add(1).min(max_scroll);
                        if app.scroll_offset >= max_scroll {
                            app.auto_scroll = true;
                        }
                    }
                    other => {
                        edit_input(&mut app.input, other, key.modifiers);
                    }
                }
            }
        }

        // Streamed deltas, applied in arrival order.
        while let Ok((message, stream_id)) = stream_rx.try_recv() {
            let mut controller = ConversationController::new(&mut app.store, &mut app.turn);
            match message {
                StreamMessage::Chunk(content) => {
                    controller.apply_delta(stream_id, &content);
                    app.scroll_to_bottom(available_height);
                }
                StreamMessage::End => {
                    if controller.finish_turn(stream_id) {
                        schedule_save(&mut save_debouncer, &events_tx);
                    }
                }
                StreamMessage::Error(error) => {
                    controller.fail_turn(stream_id, error);
                }
            }
        }

        while let Ok(event) = events_rx.try_recv() {
            match event {
                AppEvent::SaveRequested => {
                    let outcome = app.store.save_current_session();
                    if outcome.needs_title {
                        schedule_title_synthesis(&mut title_debouncer, &app, &events_tx);
                    }
                }
                AppEvent::TitleReady { session_id, title } => {
                    app.store.set_session_title(&session_id, title);
                }
                AppEvent::ModelsLoaded(models) => {
                    app.store.set_available_models(models);
                }
            }
        }
    };

    // Teardown abandons any in-flight stream and flushes pending saves.
    cancel_token.cancel();
    save_debouncer.cancel();
    title_debouncer.cancel();
    app.store.save_current_session();

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn transcript_height<B: ratatui::backend::Backend>(terminal: &Terminal<B>) -> u16 {
    let terminal_height = terminal.size().map(|size| size.height).unwrap_or_default();
    // Input box (3), status line (1), transcript title (1).
    terminal_height.saturating_sub(5)
}

fn send_message(app: &mut App, stream_service: &ChatStreamService, cancel_token: &CancellationToken) {
    let input = app.input.clone();
    let mut controller = ConversationController::new(&mut app.store, &mut app.turn);
    let Some(api_messages) = controller.begin_turn(&input) else {
        return;
    };
    app.input.clear();
    app.auto_scroll = true;

    stream_service.spawn_stream(StreamParams {
        client: app.client.http().clone(),
        base_url: app.client.base_url().to_string(),
        credential: app.store.credential().to_string(),
        model: app.store.selected_model().to_string(),
        api_messages,
        temperature: Some(app.store.temperature()),
        max_tokens: None,
        top_p: None,
        cancel_token: cancel_token.clone(),
        stream_id: app.turn.stream_id,
    });
}

/// Apply a plain editing key to a text buffer. Control chords are never
/// literal input; an unhandled chord falls through untouched.
fn edit_input(buffer: &mut String, code: KeyCode, modifiers: KeyModifiers) -> bool {
    match code {
        KeyCode::Char(c) if !modifiers.contains(KeyModifiers::CONTROL) => {
            buffer.push(c);
            true
        }
        KeyCode::Backspace => {
            buffer.pop();
            true
        }
        _ => false,
    }
}

fn open_model_picker(app: &mut App) {
    let models = app.store.available_models();
    if models.is_empty() {
        return;
    }
    let selected = models
        .iter()
        .position(|m| m == app.store.selected_model())
        .unwrap_or(0);
    app.overlay = Some(Overlay::ModelPicker(selected));
}

fn open_setting(app: &mut App, kind: SettingKind) {
    let value = match kind {
        SettingKind::Temperature => app.store.temperature().to_string(),
        SettingKind::SystemPrompt => app.store.system_prompt().to_string(),
        // Never echo the stored secret back into an editable field.
        SettingKind::Credential => String::new(),
    };
    app.overlay = Some(Overlay::Setting(SettingEditor {
        kind,
        value,
        error: None,
    }));
}

fn handle_overlay_key(app: &mut App, code: KeyCode, modifiers: KeyModifiers) {
    let Some(overlay) = app.overlay.take() else {
        return;
    };
    app.overlay = match overlay {
        Overlay::SessionPicker(selected) => handle_session_picker_key(app, selected, code),
        Overlay::ModelPicker(selected) => handle_model_picker_key(app, selected, code),
        Overlay::Setting(editor) => handle_setting_key(app, editor, code, modifiers),
    };
}

fn handle_session_picker_key(app: &mut App, selected: usize, code: KeyCode) -> Option<Overlay> {
    let session_count = app.store.sessions().len();
    match code {
        KeyCode::Esc => None,
        KeyCode::Up => Some(Overlay::SessionPicker(selected.saturating_sub(1))),
        KeyCode::Down => Some(Overlay::SessionPicker(
            (selected + 1).min(session_count.saturating_sub(1)),
        )),
        KeyCode::Enter => {
            if let Some(session) = app.store.sessions().get(selected) {
                let id = session.id.clone();
                app.store.save_current_session();
                app.store.load_session(&id);
                app.turn.error = None;
                app.auto_scroll = true;
            }
            None
        }
        KeyCode::Delete => {
            if let Some(session) = app.store.sessions().get(selected) {
                let id = session.id.clone();
                app.store.delete_session(&id);
            }
            let remaining = app.store.sessions().len();
            if remaining == 0 {
                None
            } else {
                Some(Overlay::SessionPicker(selected.min(remaining - 1)))
            }
        }
        _ => Some(Overlay::SessionPicker(selected)),
    }
}

fn handle_model_picker_key(app: &mut App, selected: usize, code: KeyCode) -> Option<Overlay> {
    let model_count = app.store.available_models().len();
    match code {
        KeyCode::Esc => None,
        KeyCode::Up => Some(Overlay::ModelPicker(selected.saturating_sub(1))),
        KeyCode::Down => Some(Overlay::ModelPicker(
            (selected + 1).min(model_count.saturating_sub(1)),
        )),
        KeyCode::Enter => {
            apply_model_selection(&mut app.store, selected);
            None
        }
        _ => Some(Overlay::ModelPicker(selected)),
    }
}

fn handle_setting_key(
    app: &mut App,
    mut editor: SettingEditor,
    code: KeyCode,
    modifiers: KeyModifiers,
) -> Option<Overlay> {
    match code {
        KeyCode::Esc => None,
        KeyCode::Enter => match apply_setting(&mut app.store, editor.kind, &editor.value) {
            Ok(()) => {
                if editor.kind == SettingKind::Credential {
                    let credential = app.store.credential().to_string();
                    app.client.set_credential(credential);
                }
                None
            }
            Err(message) => {
                editor.error = Some(message);
                Some(Overlay::Setting(editor))
            }
        },
        other => {
            if edit_input(&mut editor.value, other, modifiers) {
                editor.error = None;
            }
            Some(Overlay::Setting(editor))
        }
    }
}

/// Select a model from the fetched list by index. Out-of-range indices are
/// a no-op; the new selection applies from the next turn.
fn apply_model_selection(store: &mut SessionStore, index: usize) -> bool {
    let Some(model) = store.available_models().get(index).cloned() else {
        return false;
    };
    store.set_selected_model(model);
    true
}

/// Commit an inline settings edit to the store. Returns a user-facing
/// message when the value does not validate; the editor stays open.
fn apply_setting(store: &mut SessionStore, kind: SettingKind, value: &str) -> Result<(), String> {
    match kind {
        SettingKind::Temperature => {
            let temperature: f64 = value
                .trim()
                .parse()
                .map_err(|_| "temperature must be a number".to_string())?;
            if !(0.0..=2.0).contains(&temperature) {
                return Err("temperature must be between 0 and 2".to_string());
            }
            store.set_temperature(temperature);
            Ok(())
        }
        SettingKind::SystemPrompt => {
            store.set_system_prompt(value.trim().to_string());
            Ok(())
        }
        SettingKind::Credential => {
            store.set_credential(value.trim().to_string());
            Ok(())
        }
    }
}

fn refresh_models(client: &CompletionClient, events_tx: &mpsc::UnboundedSender<AppEvent>) {
    let client = client.clone();
    let events_tx = events_tx.clone();
    tokio::spawn(async move {
        match client.list_models().await {
            Ok(models) => {
                let _ = events_tx.send(AppEvent::ModelsLoaded(models));
            }
            // The previous model list stays intact on failure.
            Err(err) => warn!(error = %err, "model listing failed"),
        }
    });
}

fn schedule_save(save_debouncer: &mut Debouncer, events_tx: &mpsc::UnboundedSender<AppEvent>) {
    let events_tx = events_tx.clone();
    save_debouncer.schedule(Duration::from_millis(SAVE_DEBOUNCE_MS), move || {
        let _ = events_tx.send(AppEvent::SaveRequested);
    });
}

fn schedule_title_synthesis(
    title_debouncer: &mut Debouncer,
    app: &App,
    events_tx: &mpsc::UnboundedSender<AppEvent>,
) {
    let Some(session_id) = app.store.current_session_id().map(str::to_string) else {
        return;
    };
    let messages = app.store.messages().to_vec();
    let client = app.client.clone();
    let events_tx = events_tx.clone();

    title_debouncer.schedule(Duration::from_millis(TITLE_DEBOUNCE_MS), move || {
        tokio::spawn(async move {
            let title = synthesize_title(&client, &messages).await;
            let _ = events_tx.send(AppEvent::TitleReady { session_id, title });
        });
    });
}

/// Column of the cursor inside the input box: one cell per grapheme
/// cluster, clamped to the writable width of the box.
fn input_cursor_col(input: &str, max: u16) -> u16 {
    let count = input.graphemes(true).count();
    u16::try_from(count).unwrap_or(u16::MAX).min(max)
}

fn ui(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(0),
            Constraint::Length(1),
            Constraint::Length(3),
        ])
        .split(f.area());

    let lines = app.build_display_lines();
    let available_height = chunks[0].height.saturating_sub(1);
    let max_offset = (lines.len() as u16).saturating_sub(available_height);
    let scroll_offset = app.scroll_offset.min(max_offset);

    let transcript_title = format!(
        " {} [{}] ",
        app.current_title(),
        app.store.selected_model()
    );
    let transcript = Paragraph::new(lines)
        .block(Block::default().title(transcript_title))
        .wrap(Wrap { trim: true })
        .scroll((scroll_offset, 0));
    f.render_widget(transcript, chunks[0]);

    f.render_widget(status_line(app), chunks[1]);

    let input = Paragraph::new(app.input.as_str())
        .style(Style::default().fg(Color::Yellow))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Type your message (Enter to send, Ctrl+C to quit)"),
        )
        .wrap(Wrap { trim: true });
    f.render_widget(input, chunks[2]);

    match &app.overlay {
        None => {
            let col = input_cursor_col(&app.input, chunks[2].width.saturating_sub(2));
            f.set_cursor_position((chunks[2].x + 1 + col, chunks[2].y + 1));
        }
        Some(Overlay::SessionPicker(selected)) => {
            let labels: Vec<String> = app
                .store
                .sessions()
                .iter()
                .map(|session| format!("{} [{}]", session.title, session.model))
                .collect();
            render_list_popup(
                f,
                " Sessions (Enter load, Delete remove, Esc close) ",
                &labels,
                *selected,
                chunks[0],
            );
        }
        Some(Overlay::ModelPicker(selected)) => {
            let labels: Vec<String> = app
                .store
                .available_models()
                .iter()
                .map(|model| {
                    if model == app.store.selected_model() {
                        format!("{model} (current)")
                    } else {
                        model.clone()
                    }
                })
                .collect();
            render_list_popup(
                f,
                " Models (Enter select, Esc close) ",
                &labels,
                *selected,
                chunks[0],
            );
        }
        Some(Overlay::Setting(editor)) => render_setting_editor(f, editor, chunks[0]),
    }
}

fn status_line(app: &App) -> Paragraph<'_> {
    let span = if let Some(error) = &app.turn.error {
        Span::styled(error.as_str(), Style::default().fg(Color::Red))
    } else if app.turn.is_streaming() {
        Span::styled("Streaming response...", Style::default().fg(Color::Yellow))
    } else {
        Span::styled(
            format!(
                "{} session(s) | Ctrl+N new  Ctrl+P sessions  Ctrl+O models  Ctrl+T temp  Ctrl+S sys prompt  Ctrl+K key",
                app.store.sessions().len(),
            ),
            Style::default().fg(Color::DarkGray),
        )
    };
    Paragraph::new(Line::from(span))
}

fn centered_popup(area: Rect, desired_height: u16) -> Rect {
    let width = area.width.saturating_sub(8).min(70).max(20);
    let height = area.height.saturating_sub(2).min(desired_height).max(3);
    Rect {
        x: area.x + (area.width.saturating_sub(width)) / 2,
        y: area.y + (area.height.saturating_sub(height)) / 2,
        width,
        height,
    }
}

fn render_list_popup(f: &mut Frame, title: &str, labels: &[String], selected: usize, area: Rect) {
    let popup = centered_popup(area, labels.len() as u16 + 2);

    let lines: Vec<Line> = labels
        .iter()
        .enumerate()
        .map(|(index, label)| {
            if index == selected {
                Line::from(Span::styled(
                    label.as_str(),
                    Style::default()
                        .fg(Color::Black)
                        .bg(Color::Cyan)
                        .add_modifier(Modifier::BOLD),
                ))
            } else {
                Line::from(Span::raw(label.as_str()))
            }
        })
        .collect();

    let list = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(title))
        .scroll((
            selected.saturating_sub(popup.height.saturating_sub(3) as usize) as u16,
            0,
        ));

    f.render_widget(Clear, popup);
    f.render_widget(list, popup);
}

fn render_setting_editor(f: &mut Frame, editor: &SettingEditor, area: Rect) {
    let popup = centered_popup(area, if editor.error.is_some() { 4 } else { 3 });

    let mut lines = vec![Line::from(Span::styled(
        editor.value.as_str(),
        Style::default().fg(Color::Yellow),
    ))];
    if let Some(error) = &editor.error {
        lines.push(Line::from(Span::styled(
            error.as_str(),
            Style::default().fg(Color::Red),
        )));
    }

    let widget = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(editor.kind.title()));

    f.render_widget(Clear, popup);
    f.render_widget(widget, popup);
    let col = input_cursor_col(&editor.value, popup.width.saturating_sub(2));
    f.set_cursor_position((popup.x + 1 + col, popup.y + 1));
}
