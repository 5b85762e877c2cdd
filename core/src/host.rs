// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

//! The host/core boundary.
//!
//! The core runs on one dedicated thread that owns all emulator state.
//! Hosts talk to it through exactly two channels: the inbound message
//! queue, drained between scheduler events, and the [Shared] block of
//! atomics plus the framebuffer mutex for everything flowing outward.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32},
        Arc, Condvar, Mutex,
    },
    thread,
};

use common::{Colour, Time};

use crate::{
    ppu::{HEIGHT, WIDTH},
    Gba,
};

/// Cycles to emulate before looking at the message queue again; one
/// scanline keeps input latency well under a frame.
const SLICE: Time = crate::ppu::SCANLINE_LEN;

/// Callback invoked after each visible scanline with its index, with
/// no locks held. Must not block.
pub type VideoSink = Box<dyn FnMut(u16) + Send>;

/// Keys of the system, by KEYINPUT bit index.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Key {
    A = 0,
    B,
    Select,
    Start,
    Right,
    Left,
    Up,
    Down,
    R,
    L,
}

/// Commands a host can send to the emulator thread.
#[derive(Debug, Copy, Clone)]
pub enum Message {
    /// Reset the console, keeping the cartridge in.
    Reset,
    /// Emulate the given number of cycles, on top of what is pending.
    Run(Time),
    /// A key changed state.
    Key { key: Key, pressed: bool },
    /// Shut the emulator thread down.
    Exit,
}

/// Inbound command queue, drained by the core at safe points.
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<Message>>,
    ready: Condvar,
}

impl MessageQueue {
    pub fn send(&self, msg: Message) {
        self.inner.lock().unwrap().push_back(msg);
        self.ready.notify_one();
    }

    fn try_recv(&self) -> Option<Message> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Block until a message arrives. Used while the core is paused.
    fn recv(&self) -> Message {
        let mut queue = self.inner.lock().unwrap();
        loop {
            if let Some(msg) = queue.pop_front() {
                return msg;
            }
            queue = self.ready.wait(queue).unwrap();
        }
    }
}

pub struct FrameBuffer {
    pub pixels: Vec<Colour>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self {
            pixels: vec![[0, 0, 0, 255]; WIDTH * HEIGHT],
        }
    }
}

/// Data the emulator thread publishes for the host.
///
/// A host wanting tear-free frames reads `frame_version` with acquire
/// ordering, locks and copies the framebuffer, and re-checks the
/// version. `save_dirty` flags a fresh backup copy in `save` that
/// should be persisted.
#[derive(Default)]
pub struct Shared {
    pub frame: Mutex<FrameBuffer>,
    pub frame_version: AtomicU32,
    pub frame_count: AtomicU32,

    pub save_dirty: AtomicBool,
    pub save: Mutex<Vec<u8>>,
}

/// Handle to a running emulator thread.
pub struct HostHandle {
    pub messages: Arc<MessageQueue>,
    pub shared: Arc<Shared>,
    thread: thread::JoinHandle<Box<Gba>>,
}

impl HostHandle {
    pub fn send(&self, msg: Message) {
        self.messages.send(msg);
    }

    /// Wait for the emulator thread to exit and take the console back.
    /// Callers send [Message::Exit] first.
    pub fn join(self) -> Box<Gba> {
        self.thread.join().unwrap()
    }
}

/// Move the console onto its own thread and return the host's handle
/// to it.
pub fn run_threaded(gba: Box<Gba>) -> HostHandle {
    let messages = Arc::new(MessageQueue::default());
    let shared = Arc::clone(&gba.shared);
    let queue = Arc::clone(&messages);
    let thread = thread::Builder::new()
        .name("agbemu-core".into())
        .spawn(move || emulator_loop(gba, queue))
        .expect("spawning the emulator thread");
    HostHandle {
        messages,
        shared,
        thread,
    }
}

fn emulator_loop(mut gba: Box<Gba>, queue: Arc<MessageQueue>) -> Box<Gba> {
    let mut pending: Time = 0;
    loop {
        // With no work pending, sleep on the queue instead of spinning.
        let msg = if pending == 0 {
            Some(queue.recv())
        } else {
            queue.try_recv()
        };

        match msg {
            Some(Message::Reset) => gba.reset(),
            Some(Message::Run(cycles)) => pending = pending.saturating_add(cycles),
            Some(Message::Key { key, pressed }) => gba.set_key(key, pressed),
            Some(Message::Exit) => return gba,
            None => {
                let slice = pending.min(SLICE);
                gba.run_until(slice);
                pending -= slice;
                if !gba.is_running() {
                    return gba;
                }
            }
        }
    }
}
