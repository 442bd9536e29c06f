// The pending queue: one entry per admitted request awaiting its response,
// in strict arrival order. Entries only ever leave from the head, so
// responses hit the wire in the order their requests were read.
use std::collections::VecDeque;

/// Identity of an in-flight request on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(pub u64);

/// Entry state; the transition is monotonic, `Awaiting` to `Ready` once.
#[derive(Debug)]
pub enum EntryState<Resp> {
    Awaiting,
    Ready(Resp),
}

#[derive(Debug)]
pub struct PendingEntry<Req, Resp> {
    pub token: RequestToken,
    pub request: Req,
    pub created_at_ms: u64,
    pub state: EntryState<Resp>,
    // Tag snapshot taken when the response became available.
    pub tags: Vec<(String, String)>,
}

impl<Req, Resp> PendingEntry<Req, Resp> {
    pub fn is_ready(&self) -> bool {
        matches!(self.state, EntryState::Ready(_))
    }
}

/// Entry popped from the head once its response is ready.
#[derive(Debug)]
pub struct ReadyEntry<Resp> {
    pub created_at_ms: u64,
    pub response: Resp,
    pub tags: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct PendingQueue<Req, Resp> {
    entries: VecDeque<PendingEntry<Req, Resp>>,
}

impl<Req, Resp> PendingQueue<Req, Resp> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn awaiting_len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_ready()).count()
    }

    pub fn push_back(&mut self, entry: PendingEntry<Req, Resp>) {
        self.entries.push_back(entry);
    }

    pub fn head_mut(&mut self) -> Option<&mut PendingEntry<Req, Resp>> {
        self.entries.front_mut()
    }

    pub fn head_is_ready(&self) -> bool {
        self.entries.front().is_some_and(PendingEntry::is_ready)
    }

    /// Remove the head if, and only if, its response is ready.
    pub fn pop_ready_head(&mut self) -> Option<ReadyEntry<Resp>> {
        if !self.head_is_ready() {
            return None;
        }
        let entry = self.entries.pop_front()?;
        match entry.state {
            EntryState::Ready(response) => Some(ReadyEntry {
                created_at_ms: entry.created_at_ms,
                response,
                tags: entry.tags,
            }),
            EntryState::Awaiting => None,
        }
    }

    /// Look up an entry by token. The scan is linear but bounded by the
    /// configured request buffer size.
    pub fn get_mut(&mut self, token: RequestToken) -> Option<&mut PendingEntry<Req, Resp>> {
        self.entries.iter_mut().find(|entry| entry.token == token)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<Req, Resp> Default for PendingQueue<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}
