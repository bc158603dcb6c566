//! SAM task attribute scheduling.
//!
//! Decides, per device, when a command's tasks may join the ready list:
//!
//! - HEAD OF QUEUE is admitted at once, ahead of everything already queued.
//! - ORDERED is admitted when no SIMPLE command is running and nothing is
//!   waiting ahead of it. ORDERED commands may run alongside each other.
//! - SIMPLE is admitted when no ORDERED command is running and nothing is
//!   waiting ahead of it.
//!
//! Commands that cannot be admitted wait in a FIFO. Each completion drains
//! the FIFO from the front while its head is admissible, stopping after an
//! ORDERED entry.
//!
//! The scheduler is pure bookkeeping over caller-supplied items and holds
//! no locks of its own.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use crate::model::{CommandId, TaskAttribute};


/// Result of offering a command to the scheduler.
#[derive(Debug)]
pub enum Admission<T> {
    /// Dispatch now. `at_head` asks for insertion before all queued work.
    Now { item: T, at_head: bool },
    /// Parked until an earlier command completes.
    Deferred,
}

/// Counter a running command is accounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tracked {
    Simple,
    Ordered,
}

#[derive(Debug)]
struct Waiting<T> {
    id: CommandId,
    attribute: TaskAttribute,
    item: T,
}

/// Per-device task attribute state.
#[derive(Debug)]
pub struct TaskAttrScheduler<T> {
    emulate: bool,
    simple_running: usize,
    ordered_running: usize,
    waiting: VecDeque<Waiting<T>>,
    running: HashMap<CommandId, Tracked>,
}

impl<T> TaskAttrScheduler<T> {
    /// With `emulate` off every command is admitted immediately in arrival
    /// order and nothing is tracked.
    pub fn new(emulate: bool) -> Self {
        Self {
            emulate,
            simple_running: 0,
            ordered_running: 0,
            waiting: VecDeque::new(),
            running: HashMap::new(),
        }
    }

    pub fn emulates(&self) -> bool {
        self.emulate
    }

    pub fn simple_running(&self) -> usize {
        self.simple_running
    }

    pub fn ordered_running(&self) -> usize {
        self.ordered_running
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_waiting(&self, id: CommandId) -> bool {
        self.waiting.iter().any(|w| w.id == id)
    }

    /// Offer a newly submitted command.
    pub fn admit(&mut self, id: CommandId, attribute: TaskAttribute, item: T) -> Admission<T> {
        if !self.emulate {
            return Admission::Now {
                item,
                at_head: false,
            };
        }

        match attribute {
            TaskAttribute::HeadOfQueue => {
                trace!(command = %id, "Head of queue admitted");
                Admission::Now {
                    item,
                    at_head: true,
                }
            }
            attribute if self.waiting.is_empty() && self.admissible(attribute) => {
                self.track(id, attribute);
                Admission::Now {
                    item,
                    at_head: false,
                }
            }
            attribute => {
                debug!(
                    command = %id,
                    ?attribute,
                    simple = self.simple_running,
                    ordered = self.ordered_running,
                    waiting = self.waiting.len(),
                    "Command deferred"
                );
                self.waiting.push_back(Waiting {
                    id,
                    attribute,
                    item,
                });
                Admission::Deferred
            }
        }
    }

    /// Account for a finished command and return the commands it unblocked,
    /// in admission order.
    ///
    /// # Panics
    /// If a running counter would go below zero.
    pub fn complete(&mut self, id: CommandId) -> Vec<T> {
        if let Some(tracked) = self.running.remove(&id) {
            let counter = match tracked {
                Tracked::Simple => &mut self.simple_running,
                Tracked::Ordered => &mut self.ordered_running,
            };
            *counter = counter
                .checked_sub(1)
                .unwrap_or_else(|| panic!("{tracked:?} counter underflow on {id}"));
        }
        self.drain()
    }

    /// Remove a command that is still waiting. Returns its item if it was.
    /// Call [`drain`](Self::drain) afterwards: the removed entry may have
    /// been blocking the ones behind it.
    pub fn cancel(&mut self, id: CommandId) -> Option<T> {
        let pos = self.waiting.iter().position(|w| w.id == id)?;
        self.waiting.remove(pos).map(|w| w.item)
    }

    /// Admit waiting commands from the front while permitted.
    pub fn drain(&mut self) -> Vec<T> {
        let mut admitted = Vec::new();
        while let Some(head) = self.waiting.front() {
            if !self.admissible(head.attribute) {
                break;
            }
            let Some(Waiting {
                id,
                attribute,
                item,
            }) = self.waiting.pop_front()
            else {
                break;
            };
            self.track(id, attribute);
            admitted.push(item);
            if attribute == TaskAttribute::Ordered {
                break;
            }
        }
        admitted
    }

    fn admissible(&self, attribute: TaskAttribute) -> bool {
        match attribute {
            TaskAttribute::HeadOfQueue => true,
            TaskAttribute::Simple => self.ordered_running == 0,
            TaskAttribute::Ordered => self.simple_running == 0,
        }
    }

    fn track(&mut self, id: CommandId, attribute: TaskAttribute) {
        let tracked = match attribute {
            TaskAttribute::Simple => Tracked::Simple,
            TaskAttribute::Ordered => Tracked::Ordered,
            TaskAttribute::HeadOfQueue => return,
        };
        match tracked {
            Tracked::Simple => self.simple_running += 1,
            Tracked::Ordered => self.ordered_running += 1,
        }
        self.running.insert(id, tracked);
    }
}
