use std::collections::VecDeque;

use parking_lot::Mutex;

use super::stream_transport::{ChatRequest, StreamEvent, StreamEvents, StreamOpener, StreamSink, event_channel};

struct Script {
    events: Vec<StreamEvent>,
    hold_open: bool,
}

/// `StreamOpener` that replays queued event scripts instead of talking HTTP.
#[derive(Default)]
pub struct ScriptedOpener {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
    open_sinks: Mutex<Vec<StreamSink>>,
}

impl ScriptedOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next stream yields `events` and then ends.
    pub fn push_script(&self, events: Vec<StreamEvent>) {
        self.scripts.lock().push_back(Script {
            events,
            hold_open: false,
        });
    }

    /// Next stream yields `events` and then stays pending.
    pub fn push_open_script(&self, events: Vec<StreamEvent>) {
        self.scripts.lock().push_back(Script {
            events,
            hold_open: true,
        });
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl StreamOpener for ScriptedOpener {
    fn open(&self, request: ChatRequest) -> StreamEvents {
        self.requests.lock().push(request);
        let script = self.scripts.lock().pop_front().unwrap_or(Script {
            events: vec![StreamEvent::Done],
            hold_open: false,
        });

        let (sink, events) = event_channel();
        for event in script.events {
            sink.send(event);
        }
        if script.hold_open {
            self.open_sinks.lock().push(sink);
        }
        events
    }
}
