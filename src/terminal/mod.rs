//! Terminal presentation for fragments
//!
//! [`TerminalSink`] is the CLI's presentation surface: every fragment gets a
//! header, generated text is written incrementally as snapshots arrive, and
//! a closing status line tells completion, stop and failure apart.

pub mod spinner;
pub mod theme;

use crate::fragments::{GenerationTask, PresentationSink, SinkError};
use async_trait::async_trait;
use crossterm::style::{Color, Stylize};
use spinner::ThinkingSpinner;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use theme::Theme;

#[derive(Default)]
struct Surface {
    /// Bytes of `content` already written
    printed: usize,
    finished: bool,
}

struct Screen<W> {
    out: W,
    surfaces: HashMap<String, Surface>,
    spinner: ThinkingSpinner,
}

pub struct TerminalSink<W = io::Stdout> {
    screen: Mutex<Screen<W>>,
    theme: Theme,
    color: bool,
    spinner: bool,
}

impl TerminalSink<io::Stdout> {
    pub fn stdout(color: bool, spinner: bool) -> Self {
        Self::build(io::stdout(), color, spinner)
    }
}

impl<W: Write + Send> TerminalSink<W> {
    /// Write to an arbitrary writer; no spinner is drawn
    pub fn with_writer(out: W, color: bool) -> Self {
        Self::build(out, color, false)
    }

    fn build(out: W, color: bool, spinner: bool) -> Self {
        let spinner_widget = if spinner {
            ThinkingSpinner::new()
        } else {
            ThinkingSpinner::hidden()
        };
        Self {
            screen: Mutex::new(Screen {
                out,
                surfaces: HashMap::new(),
                spinner: spinner_widget,
            }),
            theme: Theme::default(),
            color,
            spinner,
        }
    }

    pub fn into_inner(self) -> W {
        self.screen
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .out
    }

    fn screen(&self) -> MutexGuard<'_, Screen<W>> {
        self.screen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.color {
            text.with(color).to_string()
        } else {
            text.to_string()
        }
    }

    fn header(&self, screen: &mut Screen<W>, task: &GenerationTask, note: &str) -> io::Result<()> {
        writeln!(
            screen.out,
            "\n{} {}",
            self.paint(&format!("{}{}", task.title, note), self.theme.title),
            self.paint(&format!("({})", task.id), self.theme.dim)
        )?;
        if self.spinner && task.is_generating {
            screen.spinner.start("Generating...");
        }
        Ok(())
    }

    fn render(&self, task: &GenerationTask, created: bool) -> io::Result<()> {
        let mut guard = self.screen();
        let screen = &mut *guard;

        if created {
            screen.surfaces.insert(task.id.to_string(), Surface::default());
            self.header(screen, task, "")?;
        }

        let restarted = screen
            .surfaces
            .get(task.id.as_str())
            .map(|s| s.finished && task.is_generating)
            .unwrap_or(false);
        if restarted {
            screen.surfaces.insert(task.id.to_string(), Surface::default());
            self.header(screen, task, " (regenerating)")?;
        }

        let surface = screen.surfaces.entry(task.id.to_string()).or_default();
        let fresh = match task.content.get(surface.printed..) {
            Some(fresh) => fresh,
            // Content was replaced rather than extended
            None => {
                writeln!(screen.out)?;
                task.content.as_str()
            }
        };
        if !fresh.is_empty() {
            screen.spinner.stop();
            write!(screen.out, "{}", self.paint(fresh, self.theme.text))?;
            surface.printed = task.content.len();
        }

        if !task.is_generating && !surface.finished {
            surface.finished = true;
            screen.spinner.stop();
            let status = if task.was_stopped {
                self.paint("[stopped]", self.theme.stopped)
            } else if let Some(error) = &task.error {
                self.paint(&format!("[failed: {}]", error), self.theme.error)
            } else {
                self.paint("[done]", self.theme.success)
            };
            writeln!(screen.out, "\n{}", status)?;
        }

        screen.out.flush()
    }
}

fn unavailable(e: io::Error) -> SinkError {
    SinkError::Unavailable(e.to_string())
}

#[async_trait]
impl<W: Write + Send> PresentationSink for TerminalSink<W> {
    async fn create(&self, task: &GenerationTask) -> Result<(), SinkError> {
        self.render(task, true).map_err(unavailable)
    }

    async fn update(&self, task: &GenerationTask) -> Result<(), SinkError> {
        if !self.screen().surfaces.contains_key(task.id.as_str()) {
            return Err(SinkError::UnknownSurface(task.id.to_string()));
        }
        self.render(task, false).map_err(unavailable)
    }

    async fn close(&self, id: &str) -> Result<(), SinkError> {
        let mut screen = self.screen();
        if screen.surfaces.remove(id).is_none() {
            return Err(SinkError::UnknownSurface(id.to_string()));
        }
        screen.spinner.stop();
        writeln!(screen.out, "{}", self.paint(&format!("[dismissed {}]", id), self.theme.dim))
            .map_err(unavailable)
    }
}
