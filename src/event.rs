use crossterm::event::{self, Event as CrosstermEvent, KeyEvent, KeyEventKind};
use std::time::Duration;
use swrc::swr::FocusEvents;
use tokio::sync::mpsc;

/// Application events
#[derive(Debug)]
pub enum Event {
  /// Terminal key press
  Key(KeyEvent),
  /// The terminal window regained focus
  FocusGained,
  /// Periodic tick for redrawing status
  Tick,
}

/// Event handler that produces events from terminal input and a tick timer.
///
/// Focus reports are also forwarded to `focus`, which drives focus
/// revalidation of mounted queries.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration, focus: FocusEvents) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // crossterm's poll blocks the thread
    tokio::task::spawn_blocking(move || loop {
      let event = if event::poll(tick_rate).unwrap_or(false) {
        match event::read() {
          Ok(CrosstermEvent::Key(key)) if key.kind == KeyEventKind::Press => {
            Some(Event::Key(key))
          }
          Ok(CrosstermEvent::FocusGained) => {
            focus.focus_gained();
            Some(Event::FocusGained)
          }
          _ => None,
        }
      } else {
        Some(Event::Tick)
      };

      if let Some(event) = event {
        if tx.send(event).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
