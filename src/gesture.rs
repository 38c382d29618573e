use crate::feed::FeedSession;

/// Pointer events as a presentation layer reports them, already mapped to
/// row indices. No widget or DOM types leak in here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEvent {
    Down { index: usize },
    Enter { index: usize },
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DragState {
    Idle,
    Dragging { target: bool },
}

/// Drag-to-select over the session's rows. A press on a row flips that row
/// and fixes the drag target state to the flipped value; every row entered
/// while the button is held gets the same value; release returns to idle.
#[derive(Debug, Clone, Copy)]
pub struct DragSelect {
    state: DragState,
}

impl DragSelect {
    pub fn new() -> Self {
        Self {
            state: DragState::Idle,
        }
    }

    pub fn is_dragging(&self) -> bool {
        matches!(self.state, DragState::Dragging { .. })
    }

    /// The value being painted onto rows, if a drag is in progress.
    pub fn target(&self) -> Option<bool> {
        match self.state {
            DragState::Dragging { target } => Some(target),
            DragState::Idle => None,
        }
    }

    pub fn handle(&mut self, session: &mut FeedSession, event: PointerEvent) {
        match event {
            PointerEvent::Down { index } => {
                // A press on a row that does not exist starts nothing.
                if index >= session.len() {
                    return;
                }
                let target = !session.is_selected(index);
                session.set_selected(index, target);
                self.state = DragState::Dragging { target };
            }
            PointerEvent::Enter { index } => {
                if let DragState::Dragging { target } = self.state {
                    session.set_selected(index, target);
                }
            }
            PointerEvent::Up => {
                self.state = DragState::Idle;
            }
        }
    }
}

impl Default for DragSelect {
    fn default() -> Self {
        Self::new()
    }
}
