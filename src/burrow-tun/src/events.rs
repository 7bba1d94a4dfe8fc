//! Device lifecycle events carried between the engine and the substrate.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitset of device events delivered over the substrate's event bus.
///
/// `UP` and `DOWN` drive the engine lifecycle; `MTU_UPDATE` is
/// informational. Flags can be combined with `|` and tested with
/// [`Event::contains`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Event(u8);

impl Event {
    /// Bring the interface up.
    pub const UP: Event = Event(1 << 0);
    /// Bring the interface down.
    pub const DOWN: Event = Event(1 << 1);
    /// The device MTU changed.
    pub const MTU_UPDATE: Event = Event(1 << 2);

    /// Whether every flag in `other` is set in `self`.
    pub const fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Event {
    type Output = Event;

    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Event::UP) {
            names.push("UP");
        }
        if self.contains(Event::DOWN) {
            names.push("DOWN");
        }
        if self.contains(Event::MTU_UPDATE) {
            names.push("MTU_UPDATE");
        }
        if names.is_empty() {
            write!(f, "Event(empty)")
        } else {
            write!(f, "Event({})", names.join("|"))
        }
    }
}
